//! Bitmap decoder boundary.
//!
//! PNG (and any other container format) decoding is host-provided. The
//! manager only consumes the finished pixel buffer; a decode failure is
//! reported to the caller with a human-readable message and leaves no image
//! state behind.

use crate::error::{GraphicsError, GraphicsResult};

/// A successfully decoded bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    /// Raw pixels, RGB (3 bytes per pixel) when `is_opaque`, RGBA otherwise.
    pub pixels: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Whether the pixel data carries no alpha channel.
    pub is_opaque: bool,
}

impl DecodedImage {
    /// Bytes per pixel of the payload.
    #[inline]
    #[must_use]
    pub const fn bytes_per_pixel(&self) -> usize {
        if self.is_opaque {
            3
        } else {
            4
        }
    }

    /// Expected payload length for the declared geometry.
    #[inline]
    #[must_use]
    pub const fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel()
    }

    /// Validate that the payload length matches the declared geometry.
    pub fn validate(&self) -> GraphicsResult<()> {
        if self.pixels.len() != self.expected_len() {
            return Err(GraphicsError::PayloadSizeMismatch {
                expected: self.expected_len(),
                actual: self.pixels.len(),
            });
        }
        Ok(())
    }
}

/// Decoder for encoded bitmap payloads.
pub trait Decoder {
    /// Decode an encoded payload into raw pixels.
    fn decode(&self, data: &[u8]) -> GraphicsResult<DecodedImage>;
}
