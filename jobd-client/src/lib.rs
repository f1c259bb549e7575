//! Worker side of the jobd handshake.
//!
//! A worker is launched with the master's addresses, port and its job code.
//! [`WorkerClient::connect`] tries each address in turn, answers the
//! master's identify request with the code, and returns once the master has
//! acknowledged the binding.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use jobctl_common::protocol::{read_frame_bytes, write_frame};
use jobctl_common::{Frame, FrameKind, JobCode, ProtocolError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("disconnected")]
    Disconnected,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("timeout")]
    Timeout,
    #[error("master not available: {0}")]
    MasterUnavailable(String),
    #[error("job code rejected by master")]
    Rejected,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A connection the master has bound to this worker's slot.
#[derive(Debug)]
pub struct WorkerClient {
    stream: TcpStream,
    master: SocketAddr,
    code: JobCode,
}

impl WorkerClient {
    /// `addresses` is the comma-separated list the master advertised.
    pub async fn connect(
        addresses: &str,
        port: u16,
        code: JobCode,
        wait: Duration,
    ) -> Result<Self> {
        let mut last_error = String::from("no addresses given");
        for host in addresses.split(',').map(str::trim).filter(|h| !h.is_empty()) {
            match timeout(wait, TcpStream::connect((host, port))).await {
                Ok(Ok(stream)) => {
                    let master = stream.peer_addr()?;
                    debug!(%master, "Connected to master");
                    return Self::bind(stream, master, code, wait).await;
                }
                Ok(Err(err)) => {
                    debug!(host, port, "Connect failed: {}", err);
                    last_error = format!("{}:{}: {}", host, port, err);
                }
                Err(_) => {
                    debug!(host, port, "Connect timed out");
                    last_error = format!("{}:{}: timed out", host, port);
                }
            }
        }
        Err(ClientError::MasterUnavailable(last_error))
    }

    pub async fn connect_addr(master: SocketAddr, code: JobCode, wait: Duration) -> Result<Self> {
        let stream = match timeout(wait, TcpStream::connect(master)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(ClientError::MasterUnavailable(err.to_string())),
            Err(_) => return Err(ClientError::Timeout),
        };
        Self::bind(stream, master, code, wait).await
    }

    async fn bind(
        mut stream: TcpStream,
        master: SocketAddr,
        code: JobCode,
        wait: Duration,
    ) -> Result<Self> {
        stream.set_nodelay(true)?;

        let request = read_frame_within(&mut stream, wait).await?;
        match Frame::expect(&request, FrameKind::IdentifyRequest) {
            Ok(_) => {}
            Err(err) => return Err(ClientError::InvalidResponse(err.to_string())),
        }

        write_frame(&mut stream, Frame::Identification(code))
            .await
            .map_err(protocol_to_client)?;

        // The master answers a bad code by closing the connection.
        let reply = match read_frame_within(&mut stream, wait).await {
            Err(ClientError::Disconnected) => return Err(ClientError::Rejected),
            other => other?,
        };
        match Frame::expect(&reply, FrameKind::ConnectedAck) {
            Ok(_) => {
                info!(%master, code = %code, "Bound to master");
                Ok(Self {
                    stream,
                    master,
                    code,
                })
            }
            Err(err) => Err(ClientError::InvalidResponse(err.to_string())),
        }
    }

    pub fn master(&self) -> SocketAddr {
        self.master
    }

    pub fn code(&self) -> JobCode {
        self.code
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read whatever the master sent next. `Ok(0)` once the master closed
    /// the session.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.read(buf).await {
            Ok(n) => Ok(n),
            Err(err) if is_disconnect(&err) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

async fn read_frame_within(
    stream: &mut TcpStream,
    wait: Duration,
) -> Result<[u8; jobctl_common::FRAME_SIZE]> {
    match timeout(wait, read_frame_bytes(stream)).await {
        Ok(Ok(buf)) => Ok(buf),
        Ok(Err(err)) => Err(protocol_to_client(err)),
        Err(_) => Err(ClientError::Timeout),
    }
}

fn protocol_to_client(err: ProtocolError) -> ClientError {
    if err.is_disconnect() {
        return ClientError::Disconnected;
    }
    match err {
        ProtocolError::Io(io_err) => ClientError::Io(io_err),
        other => ClientError::InvalidResponse(other.to_string()),
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}
