//! Length-prefixed frame codec (§4.2): a 16-bit big-endian length followed
//! by exactly that many bytes of one IP packet. No sequence numbers, no
//! per-frame checksum: TLS provides integrity, framing only provides
//! boundaries.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FramingError;

/// Largest length a frame header can express (§3 `Frame`).
pub const MTU_CAP: usize = u16::MAX as usize;

/// Failure from [`encode`] or [`encode_heartbeat`]. `Invalid` is a frame-level
/// rejection that never touches the wire (§4.2 only defines `InvalidFrame`/
/// `OversizePacket` as encode outcomes); `Io` is a genuine write failure on
/// the underlying transport and is never `FramingError` (a write failing
/// partway through is a transport fault, not frame corruption).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error(transparent)]
    Invalid(#[from] FramingError),
    #[error("transport write failed: {0}")]
    Io(#[source] std::io::Error),
}

/// Encode one IP packet as a frame and write it to `writer`. Rejects
/// zero-length and over-`mtu_cap` payloads without writing anything.
pub async fn encode<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &[u8],
    mtu_cap: usize,
) -> Result<(), EncodeError> {
    if packet.is_empty() {
        return Err(FramingError::InvalidFrame.into());
    }

    if packet.len() > mtu_cap || packet.len() > MTU_CAP {
        return Err(FramingError::OversizePacket.into());
    }

    let len = packet.len() as u16;
    writer.write_all(&len.to_be_bytes()).await.map_err(EncodeError::Io)?;
    writer.write_all(packet).await.map_err(EncodeError::Io)?;

    Ok(())
}

/// Decode exactly one frame from `reader` into `buf`, returning the packet
/// length. `buf` must be at least `mtu_cap` bytes (the caller sizes it to
/// the session MTU per §4.5: "buffers are sized to MTU").
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary (no bytes of a new
/// header have been read yet) so callers can distinguish a graceful peer
/// close from a truncated frame.
pub async fn decode<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    mtu_cap: usize,
) -> Result<Option<usize>, FramingError> {
    let mut header = [0u8; 2];

    match read_exact_or_eof(reader, &mut header).await {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Truncated => return Err(FramingError::TruncatedFrame),
        ReadOutcome::Full => {}
    }

    let len = u16::from_be_bytes(header) as usize;

    if len == 0 || len > mtu_cap || len > MTU_CAP {
        return Err(FramingError::InvalidFrame);
    }

    if len > buf.len() {
        return Err(FramingError::OversizePacket);
    }

    reader
        .read_exact(&mut buf[..len])
        .await
        .map_err(|_| FramingError::TruncatedFrame)?;

    Ok(Some(len))
}

/// What a frame-boundary-aware read produced. Distinct from the plain
/// `decode` above, which always treats a zero-length header as corruption.
/// This variant set is for the keepalive-aware call site, where a
/// zero-length header at a frame boundary is a heartbeat, not an error
/// (§4.3: "heartbeats ... MUST NOT be observable at the framing layer").
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    Packet(usize),
    Heartbeat,
    Eof,
}

/// Like `decode`, but treats a zero-length header as a heartbeat marker to
/// consume and report rather than an `InvalidFrame` error. Used only by the
/// ingress loop when an application keepalive is configured.
pub async fn decode_allow_heartbeat<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    mtu_cap: usize,
) -> Result<DecodeOutcome, FramingError> {
    let mut header = [0u8; 2];

    match read_exact_or_eof(reader, &mut header).await {
        ReadOutcome::Eof => return Ok(DecodeOutcome::Eof),
        ReadOutcome::Truncated => return Err(FramingError::TruncatedFrame),
        ReadOutcome::Full => {}
    }

    let len = u16::from_be_bytes(header) as usize;

    if len == 0 {
        return Ok(DecodeOutcome::Heartbeat);
    }

    if len > mtu_cap || len > MTU_CAP {
        return Err(FramingError::InvalidFrame);
    }

    if len > buf.len() {
        return Err(FramingError::OversizePacket);
    }

    reader
        .read_exact(&mut buf[..len])
        .await
        .map_err(|_| FramingError::TruncatedFrame)?;

    Ok(DecodeOutcome::Packet(len))
}

/// Write a heartbeat marker: a bare zero-length header, no payload. Never
/// routed through `encode`, which rejects zero-length payloads outright.
pub async fn encode_heartbeat<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), EncodeError> {
    writer
        .write_all(&0u16.to_be_bytes())
        .await
        .map_err(EncodeError::Io)
}

enum ReadOutcome {
    Full,
    Eof,
    Truncated,
}

/// Like `read_exact`, but distinguishes "zero bytes read, clean EOF" from
/// "some bytes read, then EOF mid-header" (the latter is a truncated frame).
async fn read_exact_or_eof<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => {
                return if filled == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Truncated
                };
            }
            Ok(n) => filled += n,
            Err(_) => return ReadOutcome::Truncated,
        }
    }

    ReadOutcome::Full
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_single_frame() {
        let packet = vec![1u8, 2, 3, 4, 5];
        let mut wire = Vec::new();
        encode(&mut wire, &packet, 1500).await.unwrap();

        let mut buf = [0u8; 1500];
        let mut cursor = std::io::Cursor::new(wire);
        let n = decode(&mut cursor, &mut buf, 1500).await.unwrap().unwrap();
        assert_eq!(&buf[..n], packet.as_slice());
    }

    #[tokio::test]
    async fn round_trip_many_frames_in_order() {
        let packets: Vec<Vec<u8>> = (0..50).map(|i| vec![i as u8; (i % 30) + 1]).collect();
        let mut wire = Vec::new();
        for p in &packets {
            encode(&mut wire, p, 1500).await.unwrap();
        }

        let mut cursor = std::io::Cursor::new(wire);
        let mut buf = [0u8; 1500];
        for expected in &packets {
            let n = decode(&mut cursor, &mut buf, 1500).await.unwrap().unwrap();
            assert_eq!(&buf[..n], expected.as_slice());
        }

        assert!(decode(&mut cursor, &mut buf, 1500).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn encode_rejects_zero_length() {
        let mut wire = Vec::new();
        let err = encode(&mut wire, &[], 1500).await.unwrap_err();
        assert!(matches!(err, EncodeError::Invalid(FramingError::InvalidFrame)));
    }

    #[tokio::test]
    async fn encode_rejects_oversize() {
        let mut wire = Vec::new();
        let packet = vec![0u8; 1501];
        let err = encode(&mut wire, &packet, 1500).await.unwrap_err();
        assert!(matches!(err, EncodeError::Invalid(FramingError::OversizePacket)));
    }

    #[tokio::test]
    async fn encode_surfaces_write_failure_as_io_not_framing() {
        struct FailingWriter;

        impl AsyncWrite for FailingWriter {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &[u8],
            ) -> std::task::Poll<std::io::Result<usize>> {
                std::task::Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                )))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let mut writer = FailingWriter;
        let err = encode(&mut writer, &[1, 2, 3], 1500).await.unwrap_err();
        assert!(matches!(err, EncodeError::Io(_)));
    }

    #[tokio::test]
    async fn boundary_length_one_and_mtu_accepted() {
        let mut wire = Vec::new();
        encode(&mut wire, &[0xAB], 1500).await.unwrap();
        encode(&mut wire, &vec![0xCD; 1500], 1500).await.unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let mut buf = [0u8; 1500];
        assert_eq!(decode(&mut cursor, &mut buf, 1500).await.unwrap(), Some(1));
        assert_eq!(decode(&mut cursor, &mut buf, 1500).await.unwrap(), Some(1500));
    }

    #[tokio::test]
    async fn decode_rejects_zero_length_header() {
        let wire = vec![0u8, 0u8];
        let mut cursor = std::io::Cursor::new(wire);
        let mut buf = [0u8; 1500];
        let err = decode(&mut cursor, &mut buf, 1500).await.unwrap_err();
        assert_eq!(err, FramingError::InvalidFrame);
    }

    #[tokio::test]
    async fn decode_rejects_oversize_header() {
        let len: u16 = 1501;
        let mut wire = len.to_be_bytes().to_vec();
        wire.extend(vec![0u8; 1501]);
        let mut cursor = std::io::Cursor::new(wire);
        let mut buf = [0u8; 1500];
        let err = decode(&mut cursor, &mut buf, 1500).await.unwrap_err();
        assert_eq!(err, FramingError::OversizePacket);
    }

    #[tokio::test]
    async fn decode_detects_truncated_frame() {
        let len: u16 = 10;
        let mut wire = len.to_be_bytes().to_vec();
        wire.extend(vec![0u8; 4]); // short by 6 bytes
        let mut cursor = std::io::Cursor::new(wire);
        let mut buf = [0u8; 1500];
        let err = decode(&mut cursor, &mut buf, 1500).await.unwrap_err();
        assert_eq!(err, FramingError::TruncatedFrame);
    }

    #[tokio::test]
    async fn decode_allow_heartbeat_consumes_zero_length_header() {
        let mut wire = Vec::new();
        encode_heartbeat(&mut wire).await.unwrap();
        encode(&mut wire, &[1, 2, 3], 1500).await.unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let mut buf = [0u8; 1500];
        assert_eq!(
            decode_allow_heartbeat(&mut cursor, &mut buf, 1500).await.unwrap(),
            DecodeOutcome::Heartbeat
        );
        assert_eq!(
            decode_allow_heartbeat(&mut cursor, &mut buf, 1500).await.unwrap(),
            DecodeOutcome::Packet(3)
        );
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn decode_allow_heartbeat_clean_eof_at_boundary() {
        let wire: Vec<u8> = Vec::new();
        let mut cursor = std::io::Cursor::new(wire);
        let mut buf = [0u8; 1500];
        assert_eq!(
            decode_allow_heartbeat(&mut cursor, &mut buf, 1500).await.unwrap(),
            DecodeOutcome::Eof
        );
    }

    #[tokio::test]
    async fn decode_clean_eof_at_boundary_is_none() {
        let wire: Vec<u8> = Vec::new();
        let mut cursor = std::io::Cursor::new(wire);
        let mut buf = [0u8; 1500];
        assert!(decode(&mut cursor, &mut buf, 1500).await.unwrap().is_none());
    }
}
