//! Inline-graphics engine for the pixterm terminal emulator.
//!
//! This crate is the terminal's image subsystem: it ingests decoded bitmap
//! payloads from "transmit and place" protocol commands, tracks images,
//! animation frames, and placements, computes how an image maps onto the
//! character grid (including sub-cell clipping and Unicode-placeholder
//! virtual placements), flattens multi-frame animations with alpha blending,
//! and keeps placements consistent as the screen scrolls or is cleared.
//!
//! ## Boundaries
//!
//! Bitmap decoding ([`decode::Decoder`]), the GPU upload primitive
//! ([`gpu::TextureSink`]), and the persistent frame byte store
//! ([`cache::FrameStore`]) are host-provided collaborators; this crate only
//! drives their narrow contracts.
//!
//! ## Concurrency
//!
//! Single-threaded by design: protocol commands, scroll events, and
//! animation ticks are dispatched serially from the event loop that owns the
//! rendering context. There is no internal locking because there is no
//! concurrent mutation.

pub mod cache;
pub mod compositor;
pub mod decode;
pub mod error;
pub mod geometry;
pub mod gpu;
pub mod image;
pub mod manager;

pub use cache::{FrameKey, FrameStore, MemoryFrameStore};
pub use compositor::{flatten_frame, FlattenedFrame};
pub use decode::{DecodedImage, Decoder};
pub use error::{GraphicsError, GraphicsResult};
pub use geometry::{CellBox, CellSize, Rect, Viewport};
pub use gpu::{ImageRenderData, TextureHandle, TextureSink, UploadOptions, WrapMode};
pub use image::{AnimationState, Frame, Image, ImageRef, ROOT_FRAME_ID};
pub use manager::{
    AnimationControl, AnimationTick, FrameOptions, GraphicsConfig, GraphicsManager, PutOptions,
    ScrollData, TransmitOptions,
};

/// Maximum width or height for an image or frame, in pixels.
/// Prevents DoS via extremely large images.
pub const MAX_IMAGE_DIMENSION: u32 = 10000;

/// Default storage budget for spilled frame data (320 MB).
pub const DEFAULT_STORAGE_LIMIT: usize = 320 * 1024 * 1024;

/// Maximum number of frames (including the root) per image.
pub const MAX_FRAMES_PER_IMAGE: u32 = 1000;

/// Maximum depth of a frame delta chain during flattening.
/// Malformed (cyclic or excessively deep) chains fail closed at this bound.
pub const MAX_FLATTEN_DEPTH: u32 = 32;

/// Frame gap assigned to a root frame that still has the 0 ("skip") gap when
/// its image gains a second frame, in milliseconds.
pub const DEFAULT_FRAME_GAP_MS: u32 = 40;
