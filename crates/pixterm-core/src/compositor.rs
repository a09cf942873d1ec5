//! Animation frame compositor.
//!
//! Frames may be stored as deltas over a base frame; displaying one means
//! resolving the chain into a full canvas-sized pixel buffer. Chains are
//! attacker-controlled input, so resolution is bounded at
//! [`MAX_FLATTEN_DEPTH`](crate::MAX_FLATTEN_DEPTH) and fails closed past the
//! bound. A frame whose bytes are missing from the frame store is a soft
//! failure: flattening returns `None` and the previously displayed frame
//! stays on screen.

use tracing::{debug, warn};

use crate::cache::{FrameKey, FrameStore};
use crate::image::{Frame, Image};
use crate::MAX_FLATTEN_DEPTH;

/// A fully materialized frame buffer covering the image canvas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenedFrame {
    /// Pixel data; RGB when `is_opaque`, RGBA otherwise.
    pub pixels: Vec<u8>,
    /// Whether `pixels` is 3 bytes per pixel.
    pub is_opaque: bool,
}

/// Blend an RGBA source pixel onto a 3-byte opaque destination pixel.
///
/// Alpha is dropped; RGB is linearly interpolated by the overlay's alpha.
#[inline]
fn blend_onto_opaque(dest: &mut [u8], src: &[u8]) {
    let alpha = f32::from(src[3]) / 255.0;
    for i in 0..3 {
        dest[i] = (f32::from(src[i]) * alpha + f32::from(dest[i]) * (1.0 - alpha)) as u8;
    }
}

/// Source-over composite an RGBA source pixel onto an RGBA destination pixel.
///
/// Standard compositing on coverage-premultiplied alpha. A resulting alpha of
/// zero would divide by zero; that case forces black.
#[inline]
fn alpha_blend(dest: &mut [u8], src: &[u8]) {
    let src_a = f32::from(src[3]) / 255.0;
    let dest_a = f32::from(dest[3]) / 255.0;
    let out_a = src_a + dest_a * (1.0 - src_a);
    if out_a == 0.0 {
        dest[..4].fill(0);
        return;
    }
    for i in 0..3 {
        dest[i] =
            ((f32::from(src[i]) * src_a + f32::from(dest[i]) * dest_a * (1.0 - src_a)) / out_a)
                as u8;
    }
    dest[3] = (out_a * 255.0) as u8;
}

/// Copy one source pixel into the destination format without blending.
#[inline]
fn replace_pixel(dest: &mut [u8], dest_opaque: bool, src: &[u8], src_opaque: bool) {
    dest[0] = src[0];
    dest[1] = src[1];
    dest[2] = src[2];
    if !dest_opaque {
        dest[3] = if src_opaque { 255 } else { src[3] };
    }
}

/// Allocate a canvas buffer pre-filled with a packed 0xRRGGBBAA color.
fn filled_canvas(width: u32, height: u32, bgcolor: u32, is_opaque: bool) -> Vec<u8> {
    let bpp: usize = if is_opaque { 3 } else { 4 };
    let size = width as usize * height as usize * bpp;
    if bgcolor == 0 {
        return vec![0; size];
    }
    let pixel = [
        (bgcolor >> 24) as u8,
        (bgcolor >> 16) as u8,
        (bgcolor >> 8) as u8,
        bgcolor as u8,
    ];
    let mut canvas = Vec::with_capacity(size);
    for _ in 0..width as usize * height as usize {
        canvas.extend_from_slice(&pixel[..bpp]);
    }
    canvas
}

/// Composite a frame's bytes onto a canvas-sized buffer at the frame's
/// offset.
///
/// `needs_blending` is `alpha_blend && !is_opaque` on the overlay frame:
/// an opaque overlay has no alpha to blend with, and a frame with blending
/// disabled replaces pixels outright.
pub fn compose_patch(
    canvas: &mut [u8],
    canvas_width: u32,
    canvas_height: u32,
    canvas_opaque: bool,
    frame: &Frame,
    bytes: &[u8],
) {
    let canvas_bpp: usize = if canvas_opaque { 3 } else { 4 };
    let frame_bpp = frame.bytes_per_pixel();
    let needs_blending = frame.alpha_blend && !frame.is_opaque;

    if frame.x >= canvas_width || frame.y >= canvas_height {
        return;
    }
    let copy_width = frame.width.min(canvas_width - frame.x) as usize;
    let copy_height = frame.height.min(canvas_height - frame.y) as usize;

    for row in 0..copy_height {
        let src_off = row * frame.width as usize * frame_bpp;
        let dst_off = ((frame.y as usize + row) * canvas_width as usize + frame.x as usize)
            * canvas_bpp;

        if !needs_blending && canvas_bpp == frame_bpp {
            // Matching formats, straight copy.
            let n = copy_width * frame_bpp;
            canvas[dst_off..dst_off + n].copy_from_slice(&bytes[src_off..src_off + n]);
            continue;
        }

        for col in 0..copy_width {
            let s = &bytes[src_off + col * frame_bpp..src_off + col * frame_bpp + frame_bpp];
            let d = &mut canvas[dst_off + col * canvas_bpp..dst_off + col * canvas_bpp + canvas_bpp];
            if !needs_blending {
                replace_pixel(d, canvas_opaque, s, frame.is_opaque);
            } else if canvas_opaque {
                blend_onto_opaque(d, s);
            } else {
                alpha_blend(d, s);
            }
        }
    }
}

/// Resolve a frame (and its base chain) into a full canvas buffer.
///
/// Returns `None` on a frame-store miss, a malformed payload, or a chain
/// deeper than the flattening bound.
pub fn flatten_frame(
    image: &Image,
    frame_id: u32,
    store: &dyn FrameStore,
) -> Option<FlattenedFrame> {
    flatten_inner(image, frame_id, store, 0)
}

fn flatten_inner(
    image: &Image,
    frame_id: u32,
    store: &dyn FrameStore,
    depth: u32,
) -> Option<FlattenedFrame> {
    if depth >= MAX_FLATTEN_DEPTH {
        warn!(
            image_id = image.internal_id,
            frame_id, "frame delta chain exceeds depth bound, not compositing"
        );
        return None;
    }
    let frame = image.frame(frame_id)?;
    let bytes = match store.load(FrameKey::new(image.internal_id, frame_id)) {
        Some(b) => b,
        None => {
            debug!(
                image_id = image.internal_id,
                frame_id, "frame bytes missing from frame store"
            );
            return None;
        }
    };
    let expected = frame.width as usize * frame.height as usize * frame.bytes_per_pixel();
    if bytes.len() < expected {
        warn!(
            image_id = image.internal_id,
            frame_id,
            expected,
            actual = bytes.len(),
            "frame payload shorter than declared geometry"
        );
        return None;
    }

    if frame.base_frame_id != 0 {
        let mut base = flatten_inner(image, frame.base_frame_id, store, depth + 1)?;
        compose_patch(
            &mut base.pixels,
            image.width,
            image.height,
            base.is_opaque,
            frame,
            &bytes,
        );
        return Some(base);
    }

    if frame.covers_canvas(image.width, image.height) {
        return Some(FlattenedFrame {
            pixels: bytes,
            is_opaque: frame.is_opaque,
        });
    }

    let mut canvas = filled_canvas(image.width, image.height, frame.bgcolor, frame.is_opaque);
    compose_patch(
        &mut canvas,
        image.width,
        image.height,
        frame.is_opaque,
        frame,
        &bytes,
    );
    Some(FlattenedFrame {
        pixels: canvas,
        is_opaque: frame.is_opaque,
    })
}
