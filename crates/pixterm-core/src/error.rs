//! Error types for the graphics engine.

use std::fmt;

/// Errors produced by graphics operations.
///
/// Nothing here is fatal to the host process: the worst outcome of any
/// variant is that a single image or frame does not render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// No image with the given client id (or number) exists.
    ImageNotFound(u32),
    /// No placement with the given id exists on the image.
    PlacementNotFound(u32, u32),
    /// The image has no virtual placement to instantiate cell images from.
    VirtualPlacementNotFound(u32),
    /// No animation frame with the given id exists on the image.
    FrameNotFound(u32),
    /// Image dimensions are zero or exceed the per-dimension cap.
    DimensionsTooLarge {
        /// Requested width in pixels.
        width: u32,
        /// Requested height in pixels.
        height: u32,
        /// Maximum allowed for either dimension.
        max: u32,
    },
    /// Pixel payload length does not match the declared geometry.
    PayloadSizeMismatch {
        /// Bytes expected from width x height x bytes-per-pixel.
        expected: usize,
        /// Bytes actually provided.
        actual: usize,
    },
    /// Adding the frame would exceed the per-image frame cap.
    TooManyFrames,
    /// The bitmap decoder rejected the payload.
    DecodeFailed(String),
    /// The frame's bytes were expected in the frame store but are absent.
    FrameDataMissing {
        /// Owning image internal id.
        image_id: u32,
        /// Frame id whose bytes are missing.
        frame_id: u32,
    },
    /// A frame delta chain exceeded the flattening depth bound.
    FrameChainTooDeep,
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphicsError::ImageNotFound(id) => write!(f, "image {} not found", id),
            GraphicsError::PlacementNotFound(img, p) => {
                write!(f, "placement {} not found on image {}", p, img)
            }
            GraphicsError::VirtualPlacementNotFound(img) => {
                write!(f, "image {} has no matching virtual placement", img)
            }
            GraphicsError::FrameNotFound(id) => write!(f, "animation frame {} not found", id),
            GraphicsError::DimensionsTooLarge { width, height, max } => write!(
                f,
                "image dimensions {}x{} invalid (max {} per dimension)",
                width, height, max
            ),
            GraphicsError::PayloadSizeMismatch { expected, actual } => write!(
                f,
                "pixel payload is {} bytes, expected {}",
                actual, expected
            ),
            GraphicsError::TooManyFrames => write!(f, "too many animation frames for image"),
            GraphicsError::DecodeFailed(msg) => write!(f, "image decode failed: {}", msg),
            GraphicsError::FrameDataMissing { image_id, frame_id } => write!(
                f,
                "frame data for image {} frame {} missing from frame store",
                image_id, frame_id
            ),
            GraphicsError::FrameChainTooDeep => {
                write!(f, "frame delta chain exceeds maximum depth")
            }
        }
    }
}

impl std::error::Error for GraphicsError {}

/// Result type for graphics operations.
pub type GraphicsResult<T> = Result<T, GraphicsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = [
            GraphicsError::ImageNotFound(42),
            GraphicsError::PlacementNotFound(1, 2),
            GraphicsError::VirtualPlacementNotFound(3),
            GraphicsError::FrameNotFound(7),
            GraphicsError::DimensionsTooLarge {
                width: 20000,
                height: 30000,
                max: 10000,
            },
            GraphicsError::PayloadSizeMismatch {
                expected: 400,
                actual: 399,
            },
            GraphicsError::TooManyFrames,
            GraphicsError::DecodeFailed("truncated stream".to_string()),
            GraphicsError::FrameDataMissing {
                image_id: 1,
                frame_id: 2,
            },
            GraphicsError::FrameChainTooDeep,
        ];

        for error in &errors {
            let msg = format!("{}", error);
            assert!(!msg.is_empty());
        }
    }
}
