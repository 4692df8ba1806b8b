//! Frame codec for the compute worker socket
//!
//! Every message on the worker socket is a 16-byte header followed by a
//! payload. The header layout is fixed and bit-stable:
//!
//! | offset | size | field          | encoding |
//! |--------|------|----------------|----------|
//! | 0      | 4    | magic          | u32 big-endian, always `0x57455645` ("WEVE") |
//! | 4      | 2    | version        | u16 big-endian |
//! | 6      | 2    | message type   | u16 big-endian |
//! | 8      | 4    | payload length | u32 big-endian |
//! | 12     | 4    | reserved       | zero |
//!
//! The first 8 bytes of every payload are an unsigned little-endian
//! request id used by the multiplexer for correlation.
//!
//! Decoding never hands a partial frame to the caller: the reader loops
//! (via `read_exact`) until the full header and payload are in hand or
//! the underlying stream errors out.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, WeaveError};

/// Magic constant at the start of every frame: "WEVE" in ASCII.
pub const FRAME_MAGIC: u32 = 0x5745_5645;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 16;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default upper bound on payload length (32 MiB).
///
/// A 2048x2048 RGBA response is 16 MiB of pixels; 32 MiB leaves room for
/// headers and growth without letting a corrupt length field allocate
/// gigabytes.
pub const MAX_PAYLOAD_LEN: u32 = 32 * 1024 * 1024;

/// A complete frame: header fields plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version from the header
    pub version: u16,
    /// Message type discriminant (see [`crate::compute::protocol`])
    pub message_type: u16,
    /// Payload bytes; the first 8 are the little-endian request id
    pub payload: Bytes,
}

impl Frame {
    /// Creates a frame with the current protocol version.
    pub fn new(message_type: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            payload: payload.into(),
        }
    }

    /// Extracts the request id from the first 8 bytes of the payload.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::FrameTruncated`] if the payload is shorter
    /// than 8 bytes.
    pub fn request_id(&self) -> Result<u64> {
        if self.payload.len() < 8 {
            return Err(WeaveError::FrameTruncated(self.payload.len()).into());
        }
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&self.payload[..8]);
        Ok(u64::from_le_bytes(id_bytes))
    }

    /// Serializes header and payload into a single buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(FRAME_MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.message_type);
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(0); // reserved
        buf.put_slice(&self.payload);
        buf
    }
}

/// Writes one frame to the stream.
///
/// The header and payload are flushed together so a frame is never left
/// half-written on a clean return.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one complete frame from the stream.
///
/// Reads exactly [`HEADER_LEN`] bytes, validates the magic constant and
/// declared length, then reads the full payload before returning.
///
/// # Errors
///
/// - [`WeaveError::InvalidMagic`] if the magic constant does not match.
/// - [`WeaveError::FrameTooLarge`] if the declared payload length
///   exceeds `max_payload`.
/// - [`WeaveError::Io`] on stream errors, including EOF mid-frame.
pub async fn read_frame<R>(reader: &mut R, max_payload: u32) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let mut cursor = &header[..];
    let magic = cursor.get_u32();
    if magic != FRAME_MAGIC {
        return Err(WeaveError::InvalidMagic(magic).into());
    }
    let version = cursor.get_u16();
    let message_type = cursor.get_u16();
    let length = cursor.get_u32();
    if length > max_payload {
        return Err(WeaveError::FrameTooLarge {
            length,
            max: max_payload,
        }
        .into());
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        version,
        message_type,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_with_id(id: u64, extra: &[u8]) -> Vec<u8> {
        let mut p = id.to_le_bytes().to_vec();
        p.extend_from_slice(extra);
        p
    }

    #[test]
    fn test_encode_layout_is_bit_stable() {
        let frame = Frame::new(2, payload_with_id(0x0102_0304_0506_0708, b"x"));
        let encoded = frame.encode();

        assert_eq!(&encoded[0..4], &[0x57, 0x45, 0x56, 0x45], "magic is WEVE");
        assert_eq!(&encoded[4..6], &[0x00, 0x01], "version 1 big-endian");
        assert_eq!(&encoded[6..8], &[0x00, 0x02], "message type big-endian");
        assert_eq!(&encoded[8..12], &[0x00, 0x00, 0x00, 0x09], "length 9");
        assert_eq!(&encoded[12..16], &[0u8; 4], "reserved zeroed");
        // Request id is little-endian in the payload.
        assert_eq!(
            &encoded[16..24],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_request_id_round_trip() {
        let frame = Frame::new(1, payload_with_id(42, b"hello"));
        assert_eq!(frame.request_id().unwrap(), 42);
    }

    #[test]
    fn test_request_id_truncated_payload() {
        let frame = Frame::new(1, vec![1, 2, 3]);
        let err = frame.request_id().unwrap_err();
        let weave = err.downcast::<WeaveError>().unwrap();
        assert!(matches!(weave, WeaveError::FrameTruncated(3)));
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = Frame::new(7, payload_with_id(99, b"payload bytes"));
        write_frame(&mut client, &frame).await.unwrap();

        let decoded = read_frame(&mut server, MAX_PAYLOAD_LEN).await.unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.request_id().unwrap(), 99);
    }

    #[tokio::test]
    async fn test_read_rejects_bad_magic() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut bogus = Frame::new(1, payload_with_id(1, b"")).encode();
        bogus[0] = 0xff;
        tokio::io::AsyncWriteExt::write_all(&mut client, &bogus)
            .await
            .unwrap();

        let err = read_frame(&mut server, MAX_PAYLOAD_LEN).await.unwrap_err();
        let weave = err.downcast::<WeaveError>().unwrap();
        assert!(matches!(weave, WeaveError::InvalidMagic(_)));
    }

    #[tokio::test]
    async fn test_read_rejects_oversize_declared_length() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let mut header = BytesMut::new();
        header.put_u32(FRAME_MAGIC);
        header.put_u16(PROTOCOL_VERSION);
        header.put_u16(1);
        header.put_u32(MAX_PAYLOAD_LEN + 1);
        header.put_u32(0);
        tokio::io::AsyncWriteExt::write_all(&mut client, &header)
            .await
            .unwrap();

        let err = read_frame(&mut server, MAX_PAYLOAD_LEN).await.unwrap_err();
        let weave = err.downcast::<WeaveError>().unwrap();
        assert!(matches!(weave, WeaveError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_read_eof_mid_payload_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        // Header promises 100 payload bytes but only 3 arrive before EOF.
        let mut partial = BytesMut::new();
        partial.put_u32(FRAME_MAGIC);
        partial.put_u16(PROTOCOL_VERSION);
        partial.put_u16(1);
        partial.put_u32(100);
        partial.put_u32(0);
        partial.put_slice(&[1, 2, 3]);
        tokio::io::AsyncWriteExt::write_all(&mut client, &partial)
            .await
            .unwrap();
        drop(client);

        let err = read_frame(&mut server, MAX_PAYLOAD_LEN).await.unwrap_err();
        let weave = err.downcast::<WeaveError>().unwrap();
        assert!(matches!(weave, WeaveError::Io(_)));
    }

    #[tokio::test]
    async fn test_read_empty_payload_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);

        let frame = Frame::new(3, Bytes::new());
        write_frame(&mut client, &frame).await.unwrap();

        let decoded = read_frame(&mut server, MAX_PAYLOAD_LEN).await.unwrap();
        assert!(decoded.payload.is_empty());
        assert!(decoded.request_id().is_err());
    }
}
