//! Relay frame encoding and decoding.
//!
//! Every frame is a fixed 26-byte header followed by exactly `payload_len`
//! bytes. All multi-byte fields are big-endian (network byte order).
//!
//! ```text
//!  0      4   5   6          10                 18                 26
//!  +------+---+---+----------+------------------+------------------+----------
//!  |magic |ver|cmd|payloadLen|     from id      |      to id       | payload..
//!  +------+---+---+----------+------------------+------------------+----------
//! ```
//!
//! Readers must consume the whole payload even when they discard it, or the
//! next header on the shared stream is misread.

use crate::error::{RelayError, Result};
use meshlink_core::PeerId;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame magic (`"MLRY"`)
pub const MAGIC: [u8; 4] = *b"MLRY";

/// Protocol version carried in every header
pub const VERSION: u8 = 1;

/// Encoded header length
pub const HEADER_LEN: usize = 26;

/// Default upper bound on a single payload (1 MiB)
pub const DEFAULT_MAX_PAYLOAD: u32 = 1 << 20;

/// Relay command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Bind this connection to `from`; must be the first frame
    Register,
    /// Keepalive, no payload
    Ping,
    /// Signaling passthrough (handshake packets)
    Probe,
    /// Raw tunnel packet
    Forward,
    /// Command this build does not understand; drained by readers
    Unknown(u8),
}

impl Command {
    /// Wire value
    #[must_use]
    pub const fn as_u8(&self) -> u8 {
        match self {
            Command::Register => 0x01,
            Command::Ping => 0x02,
            Command::Probe => 0x03,
            Command::Forward => 0x04,
            Command::Unknown(b) => *b,
        }
    }
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Command::Register,
            0x02 => Command::Ping,
            0x03 => Command::Probe,
            0x04 => Command::Forward,
            other => Command::Unknown(other),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Register => write!(f, "Register"),
            Command::Ping => write!(f, "Ping"),
            Command::Probe => write!(f, "Probe"),
            Command::Forward => write!(f, "Forward"),
            Command::Unknown(b) => write!(f, "Unknown({b:#04x})"),
        }
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Command
    pub command: Command,
    /// Bytes following the header
    pub payload_len: u32,
    /// Sending peer
    pub from: PeerId,
    /// Target peer, `PeerId::ZERO` when not applicable
    pub to: PeerId,
}

impl FrameHeader {
    /// Build a header
    #[must_use]
    pub fn new(command: Command, payload_len: u32, from: PeerId, to: PeerId) -> Self {
        Self {
            command,
            payload_len,
            from,
            to,
        }
    }

    /// Encode into the fixed wire layout
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = VERSION;
        buf[5] = self.command.as_u8();
        buf[6..10].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[10..18].copy_from_slice(&self.from.to_be_bytes());
        buf[18..26].copy_from_slice(&self.to.to_be_bytes());
        buf
    }

    /// Decode a header, validating magic and version.
    ///
    /// Unknown command bytes decode successfully as [`Command::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BadMagic`] or [`RelayError::UnsupportedVersion`].
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(RelayError::BadMagic(magic));
        }
        if buf[4] != VERSION {
            return Err(RelayError::UnsupportedVersion(buf[4]));
        }

        let payload_len = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let mut from = [0u8; 8];
        from.copy_from_slice(&buf[10..18]);
        let mut to = [0u8; 8];
        to.copy_from_slice(&buf[18..26]);

        Ok(Self {
            command: Command::from(buf[5]),
            payload_len,
            from: PeerId::from_be_bytes(from),
            to: PeerId::from_be_bytes(to),
        })
    }
}

/// Read and validate one header.
///
/// Returns `Ok(None)` on a clean end of stream before any header byte.
///
/// # Errors
///
/// Returns decode errors, [`RelayError::PayloadTooLarge`] past `max_payload`,
/// or I/O errors (including a stream that ends mid-header).
pub async fn read_header<R>(reader: &mut R, max_payload: u32) -> Result<Option<(FrameHeader, [u8; HEADER_LEN])>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = [0u8; HEADER_LEN];
    let first = reader.read(&mut raw[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut raw[1..]).await?;

    let header = FrameHeader::decode(&raw)?;
    if header.payload_len > max_payload {
        return Err(RelayError::PayloadTooLarge {
            len: header.payload_len,
            max: max_payload,
        });
    }
    Ok(Some((header, raw)))
}

/// Write a header followed by its payload, then flush
///
/// # Errors
///
/// Returns I/O errors from the writer.
pub async fn write_frame<W>(writer: &mut W, header: &FrameHeader, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    debug_assert_eq!(header.payload_len as usize, payload.len());
    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Consume and discard exactly `len` payload bytes
///
/// # Errors
///
/// Returns [`RelayError::Closed`] if the stream ends early.
pub async fn drain<R>(reader: &mut R, len: u32) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if len == 0 {
        return Ok(());
    }
    let copied = tokio::io::copy(&mut reader.take(u64::from(len)), &mut tokio::io::sink()).await?;
    if copied < u64::from(len) {
        return Err(RelayError::Closed);
    }
    Ok(())
}

/// One read that must make progress within `idle`
///
/// # Errors
///
/// Returns [`RelayError::Timeout`] when nothing arrives in time and
/// [`RelayError::Closed`] at end of stream.
pub async fn read_within<R>(reader: &mut R, buf: &mut [u8], idle: Duration) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match tokio::time::timeout(idle, reader.read(buf)).await {
        Err(_) => Err(RelayError::Timeout),
        Ok(Ok(0)) => Err(RelayError::Closed),
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(e.into()),
    }
}

/// [`drain`] where every read is bounded by `idle`
///
/// # Errors
///
/// Returns [`RelayError::Timeout`] if the sender stalls mid-payload and
/// [`RelayError::Closed`] if the stream ends early.
pub async fn drain_within<R>(reader: &mut R, len: u32, idle: Duration) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut scratch = [0u8; 4096];
    let mut remaining = len as usize;
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        remaining -= read_within(reader, &mut scratch[..want], idle).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FrameHeader::new(
            Command::Forward,
            0x0102_0304,
            PeerId::from_u64(1),
            PeerId::from_u64(2),
        );
        let raw = header.encode();

        assert_eq!(&raw[0..4], b"MLRY");
        assert_eq!(raw[4], VERSION);
        assert_eq!(raw[5], 0x04);
        assert_eq!(&raw[6..10], &[1, 2, 3, 4]);
        assert_eq!(&raw[10..18], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&raw[18..26], &[0, 0, 0, 0, 0, 0, 0, 2]);
        assert_eq!(FrameHeader::decode(&raw).unwrap(), header);
    }

    #[test]
    fn test_unknown_command_decodes() {
        let header = FrameHeader::new(Command::Unknown(0x7f), 3, PeerId::from_u64(1), PeerId::ZERO);
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.command, Command::Unknown(0x7f));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut raw = FrameHeader::new(Command::Ping, 0, PeerId::from_u64(1), PeerId::ZERO).encode();
        raw[4] = 9;
        assert!(matches!(
            FrameHeader::decode(&raw),
            Err(RelayError::UnsupportedVersion(9))
        ));

        raw[0] = b'G';
        assert!(matches!(FrameHeader::decode(&raw), Err(RelayError::BadMagic(_))));
    }

    #[tokio::test]
    async fn test_read_header_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_header(&mut empty, DEFAULT_MAX_PAYLOAD).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_header_rejects_oversized() {
        let raw = FrameHeader::new(Command::Forward, 2048, PeerId::from_u64(1), PeerId::from_u64(2)).encode();
        let mut reader: &[u8] = &raw;
        let err = read_header(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, RelayError::PayloadTooLarge { len: 2048, max: 1024 }));
    }

    #[tokio::test]
    async fn test_drain_keeps_stream_framed() {
        let first = FrameHeader::new(Command::Unknown(0x33), 5, PeerId::from_u64(1), PeerId::ZERO);
        let second = FrameHeader::new(Command::Forward, 2, PeerId::from_u64(1), PeerId::from_u64(2));

        let mut wire = Vec::new();
        write_frame(&mut wire, &first, b"junk!").await.unwrap();
        write_frame(&mut wire, &second, b"ok").await.unwrap();

        let mut reader: &[u8] = &wire;
        let (h, _) = read_header(&mut reader, DEFAULT_MAX_PAYLOAD).await.unwrap().unwrap();
        drain(&mut reader, h.payload_len).await.unwrap();

        let (h, _) = read_header(&mut reader, DEFAULT_MAX_PAYLOAD).await.unwrap().unwrap();
        assert_eq!(h, second);
        let mut payload = [0u8; 2];
        reader.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ok");
    }

    #[tokio::test]
    async fn test_drain_short_stream() {
        let mut reader: &[u8] = &[1, 2];
        assert!(matches!(drain(&mut reader, 4).await, Err(RelayError::Closed)));
    }

    #[tokio::test]
    async fn test_drain_within_times_out_on_stall() {
        let (mut near, mut far) = tokio::io::duplex(64);
        far.write_all(&[0u8; 10]).await.unwrap();

        let result = drain_within(&mut near, 100, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(RelayError::Timeout)));
    }

    #[tokio::test]
    async fn test_drain_within_short_stream() {
        let mut reader: &[u8] = &[1, 2, 3];
        let result = drain_within(&mut reader, 8, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(RelayError::Closed)));
    }
}
