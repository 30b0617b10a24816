//! Wire protocol shared by servers and clients. Every envelope travels in its own frame:
//!
//! ```ascii
//! 0: frame length (i64 BE) - number of bytes of the serialized envelope that follows
//! 8: serialized envelope
//! ```
//!
//! The frame length must be between 0 and the configured maximum (2048 by default). There is no
//!  marker to resynchronize on, so after a corrupted frame the rest of the stream is garbage.

use std::future::Future;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::messaging::envelope::Envelope;
use crate::messaging::error::MessagingError;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const LENGTH_PREFIX_LEN: usize = size_of::<i64>();


/// Serializes an envelope into a complete frame. Nothing is produced if the serialized envelope
///  exceeds the maximum frame size.
pub fn encode_frame(envelope: &Envelope, max_frame_len: usize) -> Result<BytesMut, MessagingError> {
    let len = envelope.serialized_len();
    if len > max_frame_len {
        return Err(MessagingError::FrameTooLarge { len, max: max_frame_len });
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + len);
    buf.put_i64(len.prechecked_cast());
    envelope.ser(&mut buf);
    Ok(buf)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, envelope: &Envelope, max_frame_len: usize) -> Result<(), MessagingError> {
    let buf = encode_frame(envelope, max_frame_len)?;
    trace!("writing frame of {} bytes", buf.len());

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame from a stream.
///
/// The stream ending before a frame's first byte is a regular close ([MessagingError::ConnectionClosed]),
///  ending anywhere inside a frame is a [MessagingError::ShortRead].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_frame_len: usize) -> Result<Envelope, MessagingError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_LEN];
    match read_until_full(reader, &mut len_buf).await? {
        0 => return Err(MessagingError::ConnectionClosed),
        LENGTH_PREFIX_LEN => {}
        actual => return Err(MessagingError::ShortRead { expected: LENGTH_PREFIX_LEN, actual }),
    }

    let frame_len = i64::from_be_bytes(len_buf);
    if frame_len < 0 || frame_len as u64 > max_frame_len.safe_cast() {
        return Err(MessagingError::InvalidFrame { len: frame_len, max: max_frame_len });
    }
    let frame_len: usize = frame_len.prechecked_cast();

    let mut frame_buf = vec![0u8; frame_len];
    let actual = read_until_full(reader, &mut frame_buf).await?;
    if actual < frame_len {
        return Err(MessagingError::ShortRead { expected: frame_len, actual });
    }

    trace!("received frame of {} bytes", frame_len);
    Envelope::try_deser(&mut frame_buf.as_slice())
        .map_err(|e| MessagingError::DecodeFailed(e.to_string()))
}

/// Like `read_exact`, but reports how much was read before the stream ended
async fn read_until_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize, MessagingError> {
    let mut offs = 0;
    while offs < buf.len() {
        match reader.read(&mut buf[offs..]).await? {
            0 => break,
            n => offs += n,
        }
    }
    Ok(offs)
}

/// Applies an optional deadline to a socket operation
pub async fn with_deadline<T>(deadline: Option<Duration>, f: impl Future<Output = Result<T, MessagingError>>) -> Result<T, MessagingError> {
    match deadline {
        None => f.await,
        Some(d) => tokio::time::timeout(d, f).await
            .map_err(|_| MessagingError::Timeout(d))?,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use super::*;
    use crate::messaging::config::MAX_FRAME_LEN;
    use crate::util::buf_ext::varint_len;

    #[rstest]
    #[case::ping(Envelope::new(1, "ping"), b"\0\0\0\0\0\0\0\x06\x01\x04ping")]
    #[case::empty_payload(Envelope::new(2, ""), b"\0\0\0\0\0\0\0\x02\x02\x00")]
    fn test_encode_frame(#[case] envelope: Envelope, #[case] expected: &[u8]) {
        let buf = encode_frame(&envelope, MAX_FRAME_LEN).unwrap();
        assert_eq!(buf.as_ref(), expected);
    }

    #[rstest]
    #[case::exactly_max(2045, true)]
    #[case::one_above_max(2046, false)]
    #[case::far_above_max(100_000, false)]
    fn test_encode_frame_max_len(#[case] payload_len: usize, #[case] expected_ok: bool) {
        // type: 1 byte, payload length: 2 bytes
        let envelope = Envelope::new(1, vec![7u8; payload_len]);
        match encode_frame(&envelope, MAX_FRAME_LEN) {
            Ok(buf) => {
                assert!(expected_ok);
                assert_eq!(buf.len(), LENGTH_PREFIX_LEN + 2048);
            }
            Err(MessagingError::FrameTooLarge { len, max }) => {
                assert!(!expected_ok);
                assert_eq!(len, envelope.serialized_len());
                assert_eq!(len, varint_len(payload_len as u64) + 1 + payload_len);
                assert_eq!(max, 2048);
            }
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    #[tokio::test]
    async fn test_write_frame_too_large_writes_nothing() {
        let mut written: Vec<u8> = Vec::new();
        let result = write_frame(&mut written, &Envelope::new(1, vec![0u8; 4096]), MAX_FRAME_LEN).await;
        assert!(matches!(result, Err(MessagingError::FrameTooLarge { .. })));
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let mut written: Vec<u8> = Vec::new();
        write_frame(&mut written, &Envelope::new(1, "ping"), MAX_FRAME_LEN).await.unwrap();
        write_frame(&mut written, &Envelope::new(2, "pong"), MAX_FRAME_LEN).await.unwrap();

        let mut reader = written.as_slice();
        assert_eq!(read_frame(&mut reader, MAX_FRAME_LEN).await.unwrap(), Envelope::new(1, "ping"));
        assert_eq!(read_frame(&mut reader, MAX_FRAME_LEN).await.unwrap(), Envelope::new(2, "pong"));
        assert!(matches!(read_frame(&mut reader, MAX_FRAME_LEN).await, Err(MessagingError::ConnectionClosed)));
    }

    #[rstest]
    #[case::clean_eof(b"", "closed")]
    #[case::partial_length(b"\0\0\0", "short")]
    #[case::partial_payload(b"\0\0\0\0\0\0\0\x06\x01\x04pi", "short")]
    #[case::negative_length(b"\xff\xff\xff\xff\xff\xff\xff\xff", "invalid")]
    #[case::length_above_max(b"\0\0\0\0\0\0\x08\x01", "invalid")]
    #[case::undecodable(b"\0\0\0\0\0\0\0\x02\x01\x05", "decode")]
    #[case::zero_length(b"\0\0\0\0\0\0\0\0", "decode")]
    #[tokio::test]
    async fn test_read_frame_errors(#[case] mut input: &[u8], #[case] expected: &str) {
        let result = read_frame(&mut input, MAX_FRAME_LEN).await;
        match (result, expected) {
            (Err(MessagingError::ConnectionClosed), "closed") => {}
            (Err(MessagingError::ShortRead { .. }), "short") => {}
            (Err(MessagingError::InvalidFrame { .. }), "invalid") => {}
            (Err(MessagingError::DecodeFailed(_)), "decode") => {}
            (other, _) => panic!("expected {}, was {:?}", expected, other),
        }
    }

    #[tokio::test]
    async fn test_read_frame_short_read_counts() {
        let mut input: &[u8] = b"\0\0\0\0\0\0\0\x06\x01\x04pi";
        match read_frame(&mut input, MAX_FRAME_LEN).await {
            Err(MessagingError::ShortRead { expected, actual }) => {
                assert_eq!(expected, 6);
                assert_eq!(actual, 4);
            }
            other => panic!("expected short read, was {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_length_consumes_no_payload() {
        let mut input: &[u8] = b"\0\0\0\0\0\0\x08\x01abc";
        match read_frame(&mut input, MAX_FRAME_LEN).await {
            Err(MessagingError::InvalidFrame { len, max }) => {
                assert_eq!(len, 2049);
                assert_eq!(max, 2048);
            }
            other => panic!("expected invalid frame, was {:?}", other),
        }
        assert_eq!(input, b"abc");
    }

    #[tokio::test]
    async fn test_read_frame_respects_configured_max() {
        let mut written: Vec<u8> = Vec::new();
        write_frame(&mut written, &Envelope::new(1, "0123456789"), MAX_FRAME_LEN).await.unwrap();

        let mut reader = written.as_slice();
        assert!(matches!(read_frame(&mut reader, 8).await, Err(MessagingError::InvalidFrame { len: 12, max: 8 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        let (_writer, mut reader) = tokio::io::duplex(64);

        let result = with_deadline(Some(Duration::from_millis(100)), read_frame(&mut reader, MAX_FRAME_LEN)).await;
        assert!(matches!(result, Err(MessagingError::Timeout(d)) if d == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_no_deadline() {
        let mut input: &[u8] = b"\0\0\0\0\0\0\0\x06\x01\x04ping";
        let result = with_deadline(None, read_frame(&mut input, MAX_FRAME_LEN)).await;
        assert_eq!(result.unwrap(), Envelope::new(1, "ping"));
    }
}
