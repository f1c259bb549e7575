//! Worker connection lifecycle.
//!
//! ```text
//! Accepted -> AwaitingIdentification -> Identified -> Bound
//!                   |                        |
//!                   +-> Rejected             +-> Lost
//!                   +-> Lost
//! ```
//!
//! `Rejected` means the worker said something that is not a pending code;
//! `Lost` means it said nothing (timeout, close, read error). Both close the
//! connection. A bound session runs until either side closes it.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use jobctl_common::protocol::{read_frame_bytes, write_frame};
use jobctl_common::{Frame, FrameKind, JobCode, ProtocolError};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::control::ControlContext;
use crate::journal::{EV_BOUND, EV_LOST, EV_REJECTED};
use crate::sink::{SessionCommand, SessionHandle};
use crate::slots::{ClaimedSlot, SlotTable};
use crate::JobNumber;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    AwaitingIdentification,
    Identified,
    Bound,
    Rejected,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Well-formed code that is not pending.
    UnknownCode(JobCode),
    Malformed(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnknownCode(code) => write!(f, "unknown job code {}", code),
            RejectReason::Malformed(detail) => write!(f, "malformed identification: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LostReason {
    Timeout,
    PeerClosed,
    Io(String),
    /// Closed from the master side.
    Aborted,
}

impl LostReason {
    fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => LostReason::PeerClosed,
            _ => LostReason::Io(err.to_string()),
        }
    }

    fn from_protocol(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::Io(io_err) => Self::from_io(io_err),
            other => LostReason::Io(other.to_string()),
        }
    }
}

impl fmt::Display for LostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LostReason::Timeout => f.write_str("identification timed out"),
            LostReason::PeerClosed => f.write_str("peer closed the connection"),
            LostReason::Io(detail) => write!(f, "i/o error: {}", detail),
            LostReason::Aborted => f.write_str("closed by master"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Bound(JobNumber),
    Rejected(RejectReason),
    Lost(LostReason),
}

/// One accepted connection and where it is in the handshake.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    state: ConnectionState,
    claimed: Option<ClaimedSlot>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnectionState::Accepted,
            claimed: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Ask the worker to identify and bind it to its slot if the code it
    /// returns is pending. Consumes the code on success.
    pub async fn handshake(
        &mut self,
        slots: &SlotTable,
        identify_timeout: Duration,
    ) -> HandshakeOutcome {
        if let Err(err) = write_frame(&mut self.stream, Frame::IdentifyRequest).await {
            return self.lost(LostReason::from_protocol(&err));
        }
        self.state = ConnectionState::AwaitingIdentification;

        let bytes = match timeout(identify_timeout, read_frame_bytes(&mut self.stream)).await {
            Err(_) => return self.lost(LostReason::Timeout),
            Ok(Err(err)) => return self.lost(LostReason::from_protocol(&err)),
            Ok(Ok(bytes)) => bytes,
        };

        let code = match Frame::expect(&bytes, FrameKind::Identification) {
            Ok(Frame::Identification(code)) => code,
            Ok(other) => {
                return self.reject(RejectReason::Malformed(format!(
                    "unexpected {:?} frame",
                    other.kind()
                )))
            }
            Err(err) => return self.reject(RejectReason::Malformed(err.to_string())),
        };

        let Some(claimed) = slots.claim(&code) else {
            return self.reject(RejectReason::UnknownCode(code));
        };
        self.state = ConnectionState::Identified;
        let job_number = claimed.job_number;

        // The code is spent either way; the sink never saw this worker.
        if let Err(err) = write_frame(&mut self.stream, Frame::ConnectedAck).await {
            slots.release(job_number);
            return self.lost(LostReason::from_protocol(&err));
        }

        self.state = ConnectionState::Bound;
        self.claimed = Some(claimed);
        HandshakeOutcome::Bound(job_number)
    }

    /// The stream and slot of a bound connection.
    pub fn into_bound(self) -> Option<(S, ClaimedSlot)> {
        match (self.state, self.claimed) {
            (ConnectionState::Bound, Some(claimed)) => Some((self.stream, claimed)),
            _ => None,
        }
    }

    fn reject(&mut self, reason: RejectReason) -> HandshakeOutcome {
        self.state = ConnectionState::Rejected;
        HandshakeOutcome::Rejected(reason)
    }

    fn lost(&mut self, reason: LostReason) -> HandshakeOutcome {
        self.state = ConnectionState::Lost;
        HandshakeOutcome::Lost(reason)
    }
}

/// Pump a bound connection: worker bytes go to the sink, queued commands
/// go to the worker. Returns why the session ended.
pub(crate) async fn run_bound<S>(
    stream: S,
    claimed: &ClaimedSlot,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) -> LostReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => return LostReason::PeerClosed,
                Ok(n) => claimed.sink.on_data(claimed.job_number, buf[..n].to_vec()),
                Err(err) => return LostReason::from_io(&err),
            },
            command = commands.recv() => match command {
                Some(SessionCommand::Send(data)) => {
                    let written = async {
                        writer.write_all(&data).await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(err) = written {
                        return LostReason::from_io(&err);
                    }
                }
                Some(SessionCommand::Close) | None => {
                    if let Err(err) = writer.shutdown().await {
                        debug!(job_number = %claimed.job_number, "Shutdown after close failed: {}", err);
                    }
                    return LostReason::Aborted;
                }
            },
        }
    }
}

/// Full lifecycle of one accepted TCP connection.
pub(crate) async fn serve_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ControlContext>) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, "Failed to set TCP_NODELAY: {}", err);
    }

    let mut conn = Connection::new(stream, peer);
    let outcome = conn.handshake(&ctx.slots, ctx.identify_timeout).await;

    let job_number = match outcome {
        HandshakeOutcome::Bound(job_number) => job_number,
        HandshakeOutcome::Rejected(reason) => {
            ctx.stats.record_rejected();
            warn!(%peer, "Rejected worker connection: {}", reason);
            ctx.record(
                EV_REJECTED,
                "",
                None,
                json!({ "peer": peer.to_string(), "reason": reason.to_string() }),
            );
            return;
        }
        HandshakeOutcome::Lost(reason) => {
            ctx.stats.record_handshake_lost();
            info!(%peer, "Worker connection lost during handshake: {}", reason);
            ctx.record(
                EV_LOST,
                "",
                None,
                json!({ "peer": peer.to_string(), "reason": reason.to_string(), "phase": "handshake" }),
            );
            return;
        }
    };

    let Some((stream, claimed)) = conn.into_bound() else {
        return;
    };
    let job = claimed.job_id.to_string();
    ctx.stats.record_bound();
    info!(%peer, job_id = %job, %job_number, "Worker bound");
    ctx.record(EV_BOUND, &job, Some(job_number), json!({ "peer": peer.to_string() }));

    let (handle, commands) = SessionHandle::new(claimed.job_id, job_number, peer);
    if !ctx.slots.attach_session(handle.clone()) {
        debug!(%job_number, "Slot aborted before its session attached");
        return;
    }
    claimed.sink.on_connected(handle);

    let reason = run_bound(stream, &claimed, commands).await;
    ctx.slots.release(job_number);
    ctx.stats.record_session_released();
    info!(%peer, job_id = %job, %job_number, "Worker session ended: {}", reason);
    ctx.record(
        EV_LOST,
        &job,
        Some(job_number),
        json!({ "peer": peer.to_string(), "reason": reason.to_string(), "phase": "session" }),
    );
    claimed.sink.on_lost(job_number, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelSink, JobEvent, JobEventSink};
    use crate::slots::SlotStatus;
    use crate::JobId;
    use jobctl_common::protocol::read_frame;
    use tokio::io::DuplexStream;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn peer() -> SocketAddr {
        "127.0.0.1:3999".parse().unwrap()
    }

    fn pipe() -> (Connection<DuplexStream>, DuplexStream) {
        let (master, worker) = tokio::io::duplex(1024);
        (Connection::new(master, peer()), worker)
    }

    fn table_with_slot() -> (SlotTable, JobNumber, JobCode) {
        let table = SlotTable::new();
        let (sink, _events) = ChannelSink::new();
        let sink: Arc<dyn JobEventSink> = Arc::new(sink);
        let (number, code) = table.register(JobId::new(), sink);
        (table, number, code)
    }

    #[tokio::test]
    async fn valid_code_binds_and_is_acknowledged() {
        let (table, number, code) = table_with_slot();
        let (mut conn, mut worker) = pipe();
        write_frame(&mut worker, Frame::Identification(code)).await.unwrap();

        let outcome = conn.handshake(&table, TIMEOUT).await;
        assert_eq!(outcome, HandshakeOutcome::Bound(number));
        assert_eq!(conn.state(), ConnectionState::Bound);
        assert_eq!(table.status(number), Some(SlotStatus::Bound));

        assert_eq!(read_frame(&mut worker).await.unwrap(), Frame::IdentifyRequest);
        assert_eq!(read_frame(&mut worker).await.unwrap(), Frame::ConnectedAck);
        assert!(conn.into_bound().is_some());
    }

    #[tokio::test]
    async fn second_use_of_a_code_is_rejected() {
        let (table, _, code) = table_with_slot();

        let (mut first, mut first_worker) = pipe();
        write_frame(&mut first_worker, Frame::Identification(code)).await.unwrap();
        assert!(matches!(
            first.handshake(&table, TIMEOUT).await,
            HandshakeOutcome::Bound(_)
        ));

        let (mut second, mut second_worker) = pipe();
        write_frame(&mut second_worker, Frame::Identification(code)).await.unwrap();
        assert_eq!(
            second.handshake(&table, TIMEOUT).await,
            HandshakeOutcome::Rejected(RejectReason::UnknownCode(code))
        );
        assert_eq!(second.state(), ConnectionState::Rejected);
        assert!(second.into_bound().is_none());
    }

    #[tokio::test]
    async fn malformed_identification_is_rejected() {
        let (table, number, _) = table_with_slot();
        let (mut conn, mut worker) = pipe();
        worker.write_all(&[0xffu8; jobctl_common::FRAME_SIZE]).await.unwrap();

        assert!(matches!(
            conn.handshake(&table, TIMEOUT).await,
            HandshakeOutcome::Rejected(RejectReason::Malformed(_))
        ));
        assert_eq!(table.status(number), Some(SlotStatus::Pending));
    }

    #[tokio::test]
    async fn wrong_frame_kind_is_rejected() {
        let (table, _, _) = table_with_slot();
        let (mut conn, mut worker) = pipe();
        write_frame(&mut worker, Frame::ConnectedAck).await.unwrap();

        assert!(matches!(
            conn.handshake(&table, TIMEOUT).await,
            HandshakeOutcome::Rejected(RejectReason::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn silence_is_lost_not_rejected() {
        let (table, number, _) = table_with_slot();
        let (mut conn, _worker) = pipe();

        let outcome = conn.handshake(&table, Duration::from_millis(50)).await;
        assert_eq!(outcome, HandshakeOutcome::Lost(LostReason::Timeout));
        assert_eq!(conn.state(), ConnectionState::Lost);
        assert_eq!(table.status(number), Some(SlotStatus::Pending));
    }

    #[tokio::test]
    async fn partial_frame_then_close_is_lost() {
        let (table, _, code) = table_with_slot();
        let (mut conn, mut worker) = pipe();
        worker
            .write_all(&Frame::Identification(code).encode()[..4])
            .await
            .unwrap();
        drop(worker);

        assert_eq!(
            conn.handshake(&table, TIMEOUT).await,
            HandshakeOutcome::Lost(LostReason::PeerClosed)
        );
    }

    /// Duplex whose writes fail once the first frame has gone out.
    struct AckFails {
        inner: DuplexStream,
        written: usize,
    }

    impl AsyncRead for AckFails {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for AckFails {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let this = self.get_mut();
            if this.written >= jobctl_common::FRAME_SIZE {
                return std::task::Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            let polled = std::pin::Pin::new(&mut this.inner).poll_write(cx, buf);
            if let std::task::Poll::Ready(Ok(n)) = &polled {
                this.written += *n;
            }
            polled
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::pin::Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn failed_ack_is_lost_and_never_reaches_the_sink() {
        let table = SlotTable::new();
        let (sink, mut events) = ChannelSink::new();
        let (number, code) = table.register(JobId::new(), Arc::new(sink));

        let (master, mut worker) = tokio::io::duplex(1024);
        write_frame(&mut worker, Frame::Identification(code)).await.unwrap();
        let mut conn = Connection::new(
            AckFails {
                inner: master,
                written: 0,
            },
            peer(),
        );

        let outcome = conn.handshake(&table, TIMEOUT).await;
        assert_eq!(outcome, HandshakeOutcome::Lost(LostReason::PeerClosed));
        assert_eq!(conn.state(), ConnectionState::Lost);
        assert_eq!(table.status(number), Some(SlotStatus::Released));
        assert!(table.claim(&code).is_none());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn bound_session_forwards_data_and_closes_on_request() {
        let table = SlotTable::new();
        let (sink, mut events) = ChannelSink::new();
        let job = JobId::new();
        let (number, code) = table.register(job, Arc::new(sink));
        let claimed = table.claim(&code).unwrap();

        let (master, mut worker) = tokio::io::duplex(1024);
        let (handle, commands) = SessionHandle::new(job, number, peer());
        let session = tokio::spawn(async move { run_bound(master, &claimed, commands).await });

        worker.write_all(b"progress 10%").await.unwrap();
        match events.recv().await.unwrap() {
            JobEvent::Data { job_number, data } => {
                assert_eq!(job_number, number);
                assert_eq!(data, b"progress 10%");
            }
            other => panic!("unexpected event {:?}", other),
        }

        handle.send(b"next".to_vec()).unwrap();
        let mut reply = [0u8; 4];
        worker.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"next");

        handle.close();
        assert_eq!(session.await.unwrap(), LostReason::Aborted);
    }

    #[tokio::test]
    async fn bound_session_ends_when_worker_disconnects() {
        let table = SlotTable::new();
        let (sink, _events) = ChannelSink::new();
        let job = JobId::new();
        let (number, code) = table.register(job, Arc::new(sink));
        let claimed = table.claim(&code).unwrap();

        let (master, worker) = tokio::io::duplex(1024);
        let (_handle, commands) = SessionHandle::new(job, number, peer());
        drop(worker);
        assert_eq!(
            run_bound(master, &claimed, commands).await,
            LostReason::PeerClosed
        );
    }
}
