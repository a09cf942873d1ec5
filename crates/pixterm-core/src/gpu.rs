//! GPU texture sink boundary.
//!
//! Texture upload and shader management live in the host renderer; this
//! module only defines the handle type and the trait the graphics manager
//! drives. Uploads require the rendering context to be current — the manager
//! calls [`TextureSink::make_current`] once per batch of GPU work.

use crate::geometry::Rect;

/// Handle to a GPU image texture.
///
/// Handles are unique within a sink instance and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

impl TextureHandle {
    /// A null/invalid handle.
    pub const NULL: Self = Self(0);

    /// Create a handle from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if this is a null handle.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Texture coordinate wrap mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrapMode {
    /// Clamp to the edge texel.
    #[default]
    ClampToEdge,
    /// Repeat the texture.
    Repeat,
}

/// Options for a texture upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Pixel data is 3 bytes per pixel (RGB) rather than 4 (RGBA).
    pub is_opaque: bool,
    /// Row stride alignment of the pixel buffer in bytes.
    pub row_alignment: u32,
    /// Sample with linear filtering instead of nearest.
    pub linear_filtering: bool,
    /// Coordinate wrap mode.
    pub wrap_mode: WrapMode,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            is_opaque: false,
            row_alignment: 1,
            linear_filtering: true,
            wrap_mode: WrapMode::ClampToEdge,
        }
    }
}

/// The GPU upload primitive, implemented by the host renderer.
pub trait TextureSink {
    /// Ensure the rendering context is current on this thread.
    ///
    /// Called lazily, once per batch of uploads/releases.
    fn make_current(&mut self) {}

    /// Upload a pixel buffer, creating a texture or overwriting `existing`.
    ///
    /// Passing [`TextureHandle::NULL`] as `existing` allocates a new texture;
    /// a non-null handle is overwritten in place (all frames of an animated
    /// image share one texture). Returns the handle actually used.
    fn upload(
        &mut self,
        existing: TextureHandle,
        pixels: &[u8],
        width: u32,
        height: u32,
        opts: UploadOptions,
    ) -> TextureHandle;

    /// Release a texture handle.
    fn release(&mut self, handle: TextureHandle);
}

/// One render-ready rectangle for the frame currently being drawn.
///
/// Rectangles sharing a texture are adjacent in the manager's render list so
/// the renderer can batch by texture binding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageRenderData {
    /// Texture to bind.
    pub texture: TextureHandle,
    /// Source rectangle in normalized image coordinates (0..1, y down).
    pub src_rect: Rect,
    /// Destination rectangle in normalized device coordinates (y up).
    pub dest_rect: Rect,
    /// Paint order; lower values draw first (further back).
    pub z_index: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_handle_null() {
        assert!(TextureHandle::NULL.is_null());
        assert!(!TextureHandle(1).is_null());
        assert_eq!(TextureHandle::from_raw(7).raw(), 7);
    }

    #[test]
    fn test_upload_options_default() {
        let opts = UploadOptions::default();
        assert!(!opts.is_opaque);
        assert_eq!(opts.row_alignment, 1);
        assert_eq!(opts.wrap_mode, WrapMode::ClampToEdge);
    }
}
