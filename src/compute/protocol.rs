//! Wire messages for the compute worker protocol
//!
//! The frame header (see [`crate::compute::frame`]) carries a message
//! type; this module defines the type constants and the payload codecs
//! for each message. All payload-internal integers are little-endian,
//! matching the request id prefix. These layouts are bit-stable: the
//! worker is a separate binary compiled against the same constants.
//!
//! Payload layouts (after the 8-byte little-endian request id):
//!
//! - `GENERATE_REQUEST`: prompt length `u32` + prompt UTF-8 bytes,
//!   width `u32`, height `u32`, steps `u32`, cfg scale `f32`, seed `u64`.
//! - `GENERATE_RESPONSE`: width `u32`, height `u32`, channels `u32`,
//!   then `width * height * channels` raw pixel bytes, row-major.
//! - `ERROR_RESPONSE`: error code `u32`, then a UTF-8 message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::compute::frame::Frame;
use crate::error::{Result, WeaveError};

/// Message type: image generation request (orchestrator -> worker).
pub const GENERATE_REQUEST: u16 = 1;

/// Message type: image generation response (worker -> orchestrator).
pub const GENERATE_RESPONSE: u16 = 2;

/// Message type: worker-reported error (worker -> orchestrator).
pub const ERROR_RESPONSE: u16 = 3;

/// Maximum prompt length in bytes accepted by the SD3.5 worker.
pub const SD35_MAX_PROMPT_LEN: usize = 4096;

/// An image generation request bound for the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    /// Correlation id; must be unique among in-flight requests
    pub request_id: u64,
    /// Prompt text, at most [`SD35_MAX_PROMPT_LEN`] bytes
    pub prompt: String,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Diffusion step count
    pub steps: u32,
    /// Classifier-free guidance scale
    pub cfg_scale: f32,
    /// Wire seed; 0 asks the worker to randomize
    pub seed: u64,
}

impl GenerateRequest {
    /// Encodes this request into a frame.
    ///
    /// The prompt is truncated to [`SD35_MAX_PROMPT_LEN`] bytes at a
    /// UTF-8 boundary before encoding.
    pub fn into_frame(self) -> Frame {
        let prompt = truncate_utf8(&self.prompt, SD35_MAX_PROMPT_LEN);
        let mut payload = BytesMut::with_capacity(8 + 4 + prompt.len() + 24);
        payload.put_u64_le(self.request_id);
        payload.put_u32_le(prompt.len() as u32);
        payload.put_slice(prompt.as_bytes());
        payload.put_u32_le(self.width);
        payload.put_u32_le(self.height);
        payload.put_u32_le(self.steps);
        payload.put_f32_le(self.cfg_scale);
        payload.put_u64_le(self.seed);
        Frame::new(GENERATE_REQUEST, payload.freeze())
    }

    /// Decodes a request from a frame payload.
    ///
    /// Used by worker-side test doubles; the orchestrator only encodes.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let mut buf = frame.payload.clone();
        if buf.remaining() < 12 {
            return Err(WeaveError::FrameTruncated(buf.remaining()).into());
        }
        let request_id = buf.get_u64_le();
        let prompt_len = buf.get_u32_le() as usize;
        if buf.remaining() < prompt_len + 24 {
            return Err(WeaveError::FrameTruncated(frame.payload.len()).into());
        }
        let prompt_bytes = buf.copy_to_bytes(prompt_len);
        let prompt = String::from_utf8(prompt_bytes.to_vec())
            .map_err(|e| WeaveError::Internal(format!("non-UTF-8 prompt on wire: {}", e)))?;
        Ok(Self {
            request_id,
            prompt,
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
            steps: buf.get_u32_le(),
            cfg_scale: buf.get_f32_le(),
            seed: buf.get_u64_le(),
        })
    }
}

/// A decoded generation response carrying raw pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateResponse {
    /// Correlation id echoed from the request
    pub request_id: u64,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Channels per pixel: 3 = RGB, 4 = RGBA
    pub channels: u32,
    /// Row-major raw pixel bytes, `width * height * channels` long
    pub pixels: Bytes,
}

impl GenerateResponse {
    /// Decodes a response from a frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`WeaveError::FrameTruncated`] if the payload is shorter
    /// than its declared pixel buffer.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let mut buf = frame.payload.clone();
        if buf.remaining() < 20 {
            return Err(WeaveError::FrameTruncated(buf.remaining()).into());
        }
        let request_id = buf.get_u64_le();
        let width = buf.get_u32_le();
        let height = buf.get_u32_le();
        let channels = buf.get_u32_le();
        let expected = width as usize * height as usize * channels as usize;
        if buf.remaining() < expected {
            return Err(WeaveError::FrameTruncated(frame.payload.len()).into());
        }
        let pixels = buf.copy_to_bytes(expected);
        Ok(Self {
            request_id,
            width,
            height,
            channels,
            pixels,
        })
    }

    /// Encodes this response into a frame (worker-side test doubles).
    pub fn into_frame(self) -> Frame {
        let mut payload = BytesMut::with_capacity(20 + self.pixels.len());
        payload.put_u64_le(self.request_id);
        payload.put_u32_le(self.width);
        payload.put_u32_le(self.height);
        payload.put_u32_le(self.channels);
        payload.put_slice(&self.pixels);
        Frame::new(GENERATE_RESPONSE, payload.freeze())
    }
}

/// A worker-reported error for a specific request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Correlation id echoed from the request
    pub request_id: u64,
    /// Worker-defined error code
    pub code: u32,
    /// Human-readable message
    pub message: String,
}

impl ErrorResponse {
    /// Decodes an error response from a frame payload.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let mut buf = frame.payload.clone();
        if buf.remaining() < 12 {
            return Err(WeaveError::FrameTruncated(buf.remaining()).into());
        }
        let request_id = buf.get_u64_le();
        let code = buf.get_u32_le();
        let message = String::from_utf8_lossy(&buf.copy_to_bytes(buf.remaining())).into_owned();
        Ok(Self {
            request_id,
            code,
            message,
        })
    }

    /// Encodes this error into a frame (worker-side test doubles).
    pub fn into_frame(self) -> Frame {
        let mut payload = BytesMut::with_capacity(12 + self.message.len());
        payload.put_u64_le(self.request_id);
        payload.put_u32_le(self.code);
        payload.put_slice(self.message.as_bytes());
        Frame::new(ERROR_RESPONSE, payload.freeze())
    }
}

/// Maps a user-facing settings seed onto the wire.
///
/// `-1` means "random" and `0` is the worker's randomize sentinel, so
/// both cross the wire as `0`; positive seeds pass through unchanged.
pub fn wire_seed(settings_seed: i64) -> u64 {
    if settings_seed <= 0 {
        0
    } else {
        settings_seed as u64
    }
}

/// Truncates `s` to at most `max_bytes` bytes, snapping back to the
/// nearest UTF-8 character boundary.
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_request_round_trip() {
        let request = GenerateRequest {
            request_id: 7,
            prompt: "a cat wearing a hat".to_string(),
            width: 512,
            height: 512,
            steps: 20,
            cfg_scale: 7.5,
            seed: 1234,
        };
        let frame = request.clone().into_frame();
        assert_eq!(frame.message_type, GENERATE_REQUEST);
        assert_eq!(frame.request_id().unwrap(), 7);

        let decoded = GenerateRequest::from_frame(&frame).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_generate_request_truncates_prompt_on_encode() {
        let request = GenerateRequest {
            request_id: 1,
            prompt: "é".repeat(SD35_MAX_PROMPT_LEN), // 2 bytes per char
            width: 64,
            height: 64,
            steps: 4,
            cfg_scale: 1.0,
            seed: 0,
        };
        let frame = request.into_frame();
        let decoded = GenerateRequest::from_frame(&frame).unwrap();
        assert!(decoded.prompt.len() <= SD35_MAX_PROMPT_LEN);
        // Still valid UTF-8 with no split character.
        assert!(decoded.prompt.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_generate_response_round_trip() {
        let pixels: Vec<u8> = (0..64u32 * 64 * 3).map(|i| (i % 251) as u8).collect();
        let response = GenerateResponse {
            request_id: 99,
            width: 64,
            height: 64,
            channels: 3,
            pixels: Bytes::from(pixels),
        };
        let frame = response.clone().into_frame();
        assert_eq!(frame.message_type, GENERATE_RESPONSE);

        let decoded = GenerateResponse::from_frame(&frame).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_generate_response_short_pixel_buffer_rejected() {
        let mut payload = BytesMut::new();
        payload.put_u64_le(1);
        payload.put_u32_le(64);
        payload.put_u32_le(64);
        payload.put_u32_le(3);
        payload.put_slice(&[0u8; 16]); // far fewer than 64*64*3
        let frame = Frame::new(GENERATE_RESPONSE, payload.freeze());

        let err = GenerateResponse::from_frame(&frame).unwrap_err();
        let weave = err.downcast::<WeaveError>().unwrap();
        assert!(matches!(weave, WeaveError::FrameTruncated(_)));
    }

    #[test]
    fn test_error_response_round_trip() {
        let error = ErrorResponse {
            request_id: 5,
            code: 2,
            message: "model not loaded".to_string(),
        };
        let frame = error.clone().into_frame();
        assert_eq!(frame.message_type, ERROR_RESPONSE);

        let decoded = ErrorResponse::from_frame(&frame).unwrap();
        assert_eq!(decoded, error);
    }

    #[test]
    fn test_wire_seed_translation() {
        assert_eq!(wire_seed(-1), 0, "random sentinel maps to 0");
        assert_eq!(wire_seed(0), 0);
        assert_eq!(wire_seed(42), 42);
        assert_eq!(wire_seed(i64::MAX), i64::MAX as u64);
    }

    #[test]
    fn test_truncate_utf8_ascii() {
        assert_eq!(truncate_utf8("hello", 3), "hel");
        assert_eq!(truncate_utf8("hello", 5), "hello");
        assert_eq!(truncate_utf8("hello", 100), "hello");
    }

    #[test]
    fn test_truncate_utf8_multibyte_boundary() {
        // "日" is 3 bytes; cutting at 4 must snap back to 3.
        let s = "日本語";
        assert_eq!(truncate_utf8(s, 4), "日");
        assert_eq!(truncate_utf8(s, 6), "日本");
        assert_eq!(truncate_utf8(s, 2), "");
    }
}
