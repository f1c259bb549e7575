//! Handshake wire protocol shared by the master and its workers.
//!
//! Every message is a fixed-width frame, so neither side ever scans for a
//! delimiter:
//!
//! ```text
//! +---------+------+------------------------+
//! | version | kind | payload (CODE_SIZE)    |
//! +---------+------+------------------------+
//!    1 byte  1 byte        16 bytes
//! ```
//!
//! The exchange is master `IdentifyRequest` -> worker `Identification(code)`
//! -> master `ConnectedAck` on a match. On a mismatch the master closes the
//! connection without a reply.

use std::fmt;
use std::io;
use std::str::FromStr;

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Width of a job code and of every frame payload.
pub const CODE_SIZE: usize = 16;
/// Bumped whenever the frame layout or the handshake changes.
pub const PROTOCOL_VERSION: u8 = 1;
/// Total width of one frame on the wire.
pub const FRAME_SIZE: usize = 2 + CODE_SIZE;

const IDENTIFY_PAYLOAD: [u8; CODE_SIZE] = *b"please-identify!";
const CONNECTED_PAYLOAD: [u8; CODE_SIZE] = *b"you-are-bound-ok";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0} (expected {PROTOCOL_VERSION})")]
    UnsupportedVersion(u8),
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("frame payload does not match {0:?}")]
    BadPayload(FrameKind),
    #[error("invalid job code: {0}")]
    InvalidCode(String),
    #[error("expected {expected:?} frame, received {received:?}")]
    UnexpectedFrame {
        expected: FrameKind,
        received: FrameKind,
    },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True when the peer went away rather than sending something malformed.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Single-use token identifying one expected worker.
///
/// Codes are ASCII alphanumeric, which keeps them safe to paste into a shell
/// command line and guarantees they never contain a template placeholder.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobCode([u8; CODE_SIZE]);

impl JobCode {
    /// Fresh random code from the thread-local RNG.
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; CODE_SIZE];
        for slot in bytes.iter_mut() {
            *slot = rng.sample(Alphanumeric);
        }
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; CODE_SIZE]) -> Result<Self, ProtocolError> {
        if bytes.iter().all(u8::is_ascii_alphanumeric) {
            Ok(Self(bytes))
        } else {
            Err(ProtocolError::InvalidCode(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        }
    }

    pub fn as_bytes(&self) -> &[u8; CODE_SIZE] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Validated as ASCII on construction.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl FromStr for JobCode {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; CODE_SIZE] = raw.as_bytes().try_into().map_err(|_| {
            ProtocolError::InvalidCode(format!(
                "'{}' is {} bytes, expected {}",
                raw,
                raw.len(),
                CODE_SIZE
            ))
        })?;
        Self::from_bytes(bytes)
    }
}

impl fmt::Display for JobCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for JobCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobCode({})", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    IdentifyRequest = 0x01,
    Identification = 0x02,
    ConnectedAck = 0x03,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(FrameKind::IdentifyRequest),
            0x02 => Ok(FrameKind::Identification),
            0x03 => Ok(FrameKind::ConnectedAck),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Master -> worker, sent right after accept.
    IdentifyRequest,
    /// Worker -> master, carrying the code the worker was launched with.
    Identification(JobCode),
    /// Master -> worker, the code matched a pending slot.
    ConnectedAck,
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::IdentifyRequest => FrameKind::IdentifyRequest,
            Frame::Identification(_) => FrameKind::Identification,
            Frame::ConnectedAck => FrameKind::ConnectedAck,
        }
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut buf = [0u8; FRAME_SIZE];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = self.kind() as u8;
        let payload = match self {
            Frame::IdentifyRequest => &IDENTIFY_PAYLOAD,
            Frame::Identification(code) => code.as_bytes(),
            Frame::ConnectedAck => &CONNECTED_PAYLOAD,
        };
        buf[2..].copy_from_slice(payload);
        buf
    }

    pub fn decode(buf: &[u8; FRAME_SIZE]) -> Result<Self, ProtocolError> {
        if buf[0] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(buf[0]));
        }
        let kind = FrameKind::from_byte(buf[1])?;
        let mut payload = [0u8; CODE_SIZE];
        payload.copy_from_slice(&buf[2..]);

        match kind {
            FrameKind::IdentifyRequest if payload == IDENTIFY_PAYLOAD => {
                Ok(Frame::IdentifyRequest)
            }
            FrameKind::ConnectedAck if payload == CONNECTED_PAYLOAD => Ok(Frame::ConnectedAck),
            FrameKind::Identification => JobCode::from_bytes(payload).map(Frame::Identification),
            other => Err(ProtocolError::BadPayload(other)),
        }
    }

    /// Decode and insist on a particular kind.
    pub fn expect(buf: &[u8; FRAME_SIZE], expected: FrameKind) -> Result<Self, ProtocolError> {
        let frame = Self::decode(buf)?;
        if frame.kind() != expected {
            return Err(ProtocolError::UnexpectedFrame {
                expected,
                received: frame.kind(),
            });
        }
        Ok(frame)
    }
}

/// Read exactly one frame's worth of bytes.
pub async fn read_frame_bytes<R>(reader: &mut R) -> Result<[u8; FRAME_SIZE], ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FRAME_SIZE];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let buf = read_frame_bytes(reader).await?;
    Frame::decode(&buf)
}

pub async fn write_frame<W>(writer: &mut W, frame: Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_codes_are_alphanumeric_and_distinct() {
        let codes: HashSet<JobCode> = (0..256).map(|_| JobCode::generate()).collect();
        assert_eq!(codes.len(), 256);
        for code in &codes {
            assert!(code.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
            assert_eq!(code.as_str().len(), CODE_SIZE);
        }
    }

    #[test]
    fn job_code_parses_from_command_line_form() {
        let code: JobCode = "abcdEFGH01234567".parse().unwrap();
        assert_eq!(code.to_string(), "abcdEFGH01234567");
        assert!("short".parse::<JobCode>().is_err());
        assert!("abcd$FGH01234567".parse::<JobCode>().is_err());
    }

    #[test]
    fn identification_frame_carries_code() {
        let code = JobCode::generate();
        let encoded = Frame::Identification(code).encode();
        assert_eq!(encoded.len(), FRAME_SIZE);
        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Identification(code));
    }

    #[test]
    fn decode_rejects_foreign_version() {
        let mut encoded = Frame::IdentifyRequest.encode();
        encoded[0] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(ProtocolError::UnsupportedVersion(v)) if v == PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn decode_rejects_unknown_kind_and_bad_payload() {
        let mut encoded = Frame::ConnectedAck.encode();
        encoded[1] = 0x7f;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(ProtocolError::UnknownKind(0x7f))
        ));

        let mut encoded = Frame::ConnectedAck.encode();
        encoded[5] = b'X';
        assert!(matches!(
            Frame::decode(&encoded),
            Err(ProtocolError::BadPayload(FrameKind::ConnectedAck))
        ));
    }

    #[test]
    fn expect_reports_unexpected_kind() {
        let encoded = Frame::ConnectedAck.encode();
        let err = Frame::expect(&encoded, FrameKind::IdentifyRequest).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedFrame {
                expected: FrameKind::IdentifyRequest,
                received: FrameKind::ConnectedAck
            }
        ));
    }

    #[tokio::test]
    async fn short_read_is_a_disconnect() {
        let partial = &Frame::IdentifyRequest.encode()[..5];
        let mut reader = partial;
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let code = JobCode::generate();
        write_frame(&mut a, Frame::Identification(code)).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), Frame::Identification(code));
    }
}
