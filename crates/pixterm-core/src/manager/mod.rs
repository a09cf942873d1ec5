//! Graphics manager.
//!
//! The in-memory model of images, frames, and placements for one terminal
//! screen: identity allocation, storage accounting, placement geometry,
//! animation driving, and the scroll/clear lifecycle that mutates or destroys
//! placements as the scrollback moves.
//!
//! ## Design
//!
//! - Single-threaded: every operation runs on the thread that owns the
//!   rendering context, dispatched serially from one event loop. No locking.
//! - Frame pixel data is spilled to the [`FrameStore`] and fetched on demand;
//!   only flattened buffers transit memory, on their way to the GPU.
//! - The storage budget is enforced after every load by evicting the
//!   least-recently-accessed images first.
//! - Texture handles freed on non-GPU paths (scroll, clear, eviction) are
//!   queued and released in [`GraphicsManager::update_layers`], the one point
//!   per batch that makes the rendering context current.

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::cache::{FrameKey, FrameStore, MemoryFrameStore};
use crate::compositor::{compose_patch, flatten_frame};
use crate::decode::DecodedImage;
use crate::error::{GraphicsError, GraphicsResult};
use crate::geometry::{cells_for_pixels, fit_cell_image, CellBox, CellSize, Viewport};
use crate::gpu::{ImageRenderData, TextureHandle, TextureSink, UploadOptions};
use crate::image::{next_id, AnimationState, Frame, Image, ImageRef, ROOT_FRAME_ID};
use crate::{DEFAULT_STORAGE_LIMIT, MAX_IMAGE_DIMENSION};


/// Tunable limits for a graphics manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsConfig {
    /// Aggregate budget, in bytes, for spilled frame data.
    pub storage_limit: usize,
    /// Maximum width or height accepted for an image or frame.
    pub max_dimension: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            storage_limit: DEFAULT_STORAGE_LIMIT,
            max_dimension: MAX_IMAGE_DIMENSION,
        }
    }
}

/// Parameters of a scroll event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollData {
    /// Signed row delta applied to placements.
    pub amt: i32,
    /// Topmost retained row; a placement whose bottom edge lands at or above
    /// this row after the shift is destroyed. Ignored when `has_margins`.
    pub limit: i32,
    /// Top margin row (inclusive) for margin-constrained scrolls.
    pub margin_top: u32,
    /// Bottom margin row (inclusive) for margin-constrained scrolls.
    pub margin_bottom: u32,
    /// Whether the scroll is constrained to the margins.
    pub has_margins: bool,
}

/// Identity for a transmitted image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitOptions {
    /// Protocol-visible image id; 0 for anonymous images.
    pub client_id: u32,
    /// Client-chosen number for most-recent lookups; 0 = unset.
    pub client_number: u32,
}

/// Parameters of a placement command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Target image client id; 0 to address by `image_number`.
    pub image_id: u32,
    /// Target image number, used when `image_id` is 0.
    pub image_number: u32,
    /// Client placement id; a non-zero id replaces an existing placement
    /// with the same id.
    pub placement_id: u32,
    /// Grid row of the top-left cell.
    pub start_row: i32,
    /// Grid column of the top-left cell.
    pub start_column: i32,
    /// Requested width in cells; 0 = natural size.
    pub num_cols: u32,
    /// Requested height in cells; 0 = natural size.
    pub num_rows: u32,
    /// Source rectangle x in image pixels.
    pub src_x: u32,
    /// Source rectangle y in image pixels.
    pub src_y: u32,
    /// Source rectangle width; 0 = to the image's right edge.
    pub src_width: u32,
    /// Source rectangle height; 0 = to the image's bottom edge.
    pub src_height: u32,
    /// Pixel offset into the first cell, horizontally.
    pub cell_x_offset: u32,
    /// Pixel offset into the first cell, vertically.
    pub cell_y_offset: u32,
    /// Paint order.
    pub z_index: i32,
    /// Create a virtual (Unicode-placeholder template) placement.
    pub is_virtual: bool,
}

/// Metadata for a transmitted animation frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOptions {
    /// Frame id; 0 = auto-assign.
    pub frame_id: u32,
    /// Horizontal offset within the canvas.
    pub x: u32,
    /// Vertical offset within the canvas.
    pub y: u32,
    /// Display duration in milliseconds; 0 = skip this frame.
    pub gap: u32,
    /// Pre-fill color (0xRRGGBBAA) for uncovered canvas regions.
    pub bgcolor: u32,
    /// Blend transparent pixels with the base instead of replacing.
    pub alpha_blend: bool,
    /// Frame this one is a delta over; 0 = standalone.
    pub base_frame_id: u32,
}

/// Parameters of an animation-control command. `None` fields are untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnimationControl {
    /// New playback state. Switching to `Running` rewinds to the first frame.
    pub state: Option<AnimationState>,
    /// New loop budget; 0 = unlimited.
    pub max_loops: Option<u32>,
    /// Frame id to jump playback to.
    pub current_frame: Option<u32>,
    /// Set the gap of one frame: (frame id, gap in milliseconds).
    pub set_gap: Option<(u32, u32)>,
}

/// Result of one animation clock scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimationTick {
    /// Whether any frame advanced (a redraw is owed).
    pub changed: bool,
    /// Time until the next frame is due across all animated images, if any.
    pub next_wake: Option<Duration>,
}

/// Lazily makes the rendering context current, at most once per batch.
#[derive(Default)]
struct LazyContext {
    made: bool,
}

impl LazyContext {
    fn ensure(&mut self, sink: &mut dyn TextureSink) {
        if !self.made {
            sink.make_current();
            self.made = true;
        }
    }
}

/// Flatten the image's current frame and push it to the GPU.
///
/// Returns `false` on a soft failure (frame bytes missing, malformed chain);
/// the previously uploaded texture stays on screen.
fn upload_current_frame(
    image: &mut Image,
    frames: &dyn FrameStore,
    sink: &mut dyn TextureSink,
    now: Instant,
) -> bool {
    let frame_id = image.current_frame().id;
    let Some(flat) = flatten_frame(image, frame_id, frames) else {
        debug!(
            image_id = image.internal_id,
            frame_id, "current frame not flattenable, keeping previous texture"
        );
        return false;
    };
    let opts = UploadOptions {
        is_opaque: flat.is_opaque,
        ..UploadOptions::default()
    };
    image.texture = sink.upload(image.texture, &flat.pixels, image.width, image.height, opts);
    image.current_frame_shown_at = Some(now);
    true
}

/// Clip a placement to the scroll margins after it has been shifted.
///
/// The clipped portion is removed from the source rectangle as well as the
/// row count, so the crop stays consistent. Returns `false` when nothing of
/// the placement survives.
fn clip_ref_to_margins(
    r: &mut ImageRef,
    margin_top: i32,
    margin_bottom: i32,
    img_width: u32,
    img_height: u32,
) -> bool {
    let rows = r.effective_num_rows as i32;
    if rows <= 0 {
        return false;
    }
    let last = r.start_row + rows - 1;
    if last < margin_top || r.start_row > margin_bottom {
        return false;
    }
    if r.start_row < margin_top {
        let clipped = margin_top - r.start_row;
        if clipped >= rows {
            return false;
        }
        let per_row = r.src_height / rows as f32;
        r.src_y += per_row * clipped as f32;
        r.src_height -= per_row * clipped as f32;
        r.start_row = margin_top;
        r.effective_num_rows -= clipped as u32;
        if r.num_rows != 0 {
            r.num_rows = r.effective_num_rows;
        }
        r.update_src_rect(img_width, img_height);
    }
    let rows = r.effective_num_rows as i32;
    let last = r.start_row + rows - 1;
    if last > margin_bottom {
        let clipped = last - margin_bottom;
        if clipped >= rows {
            return false;
        }
        let per_row = r.src_height / rows as f32;
        r.src_height -= per_row * clipped as f32;
        r.effective_num_rows -= clipped as u32;
        if r.num_rows != 0 {
            r.num_rows = r.effective_num_rows;
        }
        r.update_src_rect(img_width, img_height);
    }
    true
}

/// The graphics subsystem of one terminal screen.
pub struct GraphicsManager {
    images: FxHashMap<u32, Image>,
    image_id_counter: u32,
    used_storage: usize,
    storage_limit: usize,
    max_dimension: u32,
    layers_dirty: bool,
    frames: Box<dyn FrameStore>,
    dead_textures: Vec<TextureHandle>,
    render_list: Vec<ImageRenderData>,
}

impl Default for GraphicsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphicsManager {
    /// Create a manager with default limits and an in-memory frame store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(GraphicsConfig::default(), Box::new(MemoryFrameStore::new()))
    }

    /// Create a manager with default limits and the given frame store.
    #[must_use]
    pub fn with_store(frames: Box<dyn FrameStore>) -> Self {
        Self::with_config(GraphicsConfig::default(), frames)
    }

    /// Create a manager with explicit limits and frame store.
    #[must_use]
    pub fn with_config(config: GraphicsConfig, frames: Box<dyn FrameStore>) -> Self {
        Self {
            images: FxHashMap::default(),
            image_id_counter: 0,
            used_storage: 0,
            storage_limit: config.storage_limit,
            max_dimension: config.max_dimension,
            layers_dirty: false,
            frames,
            dead_textures: Vec::new(),
            render_list: Vec::new(),
        }
    }

    /// Number of live images.
    #[inline]
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Aggregate bytes charged for spilled frame data.
    #[inline]
    #[must_use]
    pub const fn used_storage(&self) -> usize {
        self.used_storage
    }

    /// The storage budget in bytes.
    #[inline]
    #[must_use]
    pub const fn storage_limit(&self) -> usize {
        self.storage_limit
    }

    /// Change the storage budget, evicting immediately if now exceeded.
    pub fn set_storage_limit(&mut self, limit: usize) {
        self.storage_limit = limit;
        self.enforce_storage_limit(0);
    }

    /// Whether the set of on-screen rectangles changed since the last
    /// [`update_layers`](Self::update_layers).
    #[inline]
    #[must_use]
    pub const fn layers_dirty(&self) -> bool {
        self.layers_dirty
    }

    /// Look up an image by internal id.
    #[must_use]
    pub fn image(&self, internal_id: u32) -> Option<&Image> {
        self.images.get(&internal_id)
    }

    /// Look up an image by protocol client id. Linear scan: image counts are
    /// small, bounded by the storage budget.
    #[must_use]
    pub fn image_by_client_id(&self, client_id: u32) -> Option<&Image> {
        if client_id == 0 {
            return None;
        }
        self.images.values().find(|i| i.client_id == client_id)
    }

    /// Look up the most recent image with the given client number.
    #[must_use]
    pub fn image_by_client_number(&self, number: u32) -> Option<&Image> {
        if number == 0 {
            return None;
        }
        self.images
            .values()
            .filter(|i| i.client_number == number)
            .max_by_key(|i| i.internal_id)
    }

    fn resolve_internal_id(&self, client_id: u32, client_number: u32) -> Option<u32> {
        if client_id != 0 {
            self.image_by_client_id(client_id).map(|i| i.internal_id)
        } else {
            self.image_by_client_number(client_number)
                .map(|i| i.internal_id)
        }
    }

    // ------------------------------------------------------------------
    // Image store
    // ------------------------------------------------------------------

    /// Ingest a successfully decoded image.
    ///
    /// A non-zero client id replaces any existing image with the same id.
    /// Returns the new image's internal id.
    pub fn transmit(
        &mut self,
        opts: TransmitOptions,
        decoded: DecodedImage,
        now: Instant,
    ) -> GraphicsResult<u32> {
        decoded.validate()?;
        self.check_dimensions(decoded.width, decoded.height)?;

        if opts.client_id != 0 {
            if let Some(old) = self.image_by_client_id(opts.client_id).map(|i| i.internal_id) {
                self.remove_image(old);
            }
        }

        let mut id = next_id(&mut self.image_id_counter);
        while self.images.contains_key(&id) {
            id = next_id(&mut self.image_id_counter);
        }
        let mut image = Image::new(
            id,
            opts.client_id,
            opts.client_number,
            decoded.width,
            decoded.height,
            decoded.is_opaque,
            now,
        );
        let charged = decoded.pixels.len();
        image.used_storage = charged;
        self.frames
            .store(FrameKey::new(id, ROOT_FRAME_ID), decoded.pixels);
        self.images.insert(id, image);
        self.used_storage += charged;
        self.enforce_storage_limit(id);
        Ok(id)
    }

    /// Remove an image by internal id, releasing its texture (deferred), its
    /// placements, its spilled frame data, and its storage charge.
    pub fn remove_image(&mut self, internal_id: u32) -> bool {
        let Some(image) = self.images.remove(&internal_id) else {
            return false;
        };
        if !image.texture.is_null() {
            self.dead_textures.push(image.texture);
        }
        self.frames
            .remove(FrameKey::new(internal_id, ROOT_FRAME_ID));
        for f in image.extra_frames() {
            self.frames.remove(FrameKey::new(internal_id, f.id));
        }
        self.used_storage = self.used_storage.saturating_sub(image.used_storage);
        self.layers_dirty = true;
        true
    }

    /// Remove an image by protocol client id.
    pub fn remove_image_by_client_id(&mut self, client_id: u32) -> GraphicsResult<()> {
        let internal = self
            .image_by_client_id(client_id)
            .map(|i| i.internal_id)
            .ok_or(GraphicsError::ImageNotFound(client_id))?;
        self.remove_image(internal);
        Ok(())
    }

    fn check_dimensions(&self, width: u32, height: u32) -> GraphicsResult<()> {
        if width == 0 || height == 0 || width > self.max_dimension || height > self.max_dimension {
            return Err(GraphicsError::DimensionsTooLarge {
                width,
                height,
                max: self.max_dimension,
            });
        }
        Ok(())
    }

    /// Evict least-recently-accessed images until within the storage budget.
    ///
    /// The image that triggered enforcement is skipped, so a single oversized
    /// image may exceed the limit alone rather than failing the load.
    fn enforce_storage_limit(&mut self, keep: u32) {
        while self.used_storage > self.storage_limit {
            let candidate = self
                .images
                .values()
                .filter(|i| i.internal_id != keep)
                .min_by_key(|i| i.atime)
                .map(|i| i.internal_id);
            let Some(id) = candidate else { break };
            debug!(image_id = id, "evicting image to enforce storage limit");
            self.remove_image(id);
        }
    }

    /// Remove images that can never be referenced again: refless and, unless
    /// `even_addressable`, lacking any client id/number.
    fn remove_unreferenced_images(&mut self, even_addressable: bool) {
        let ids: Vec<u32> = self
            .images
            .values()
            .filter(|i| !i.has_refs() && (even_addressable || !i.is_client_addressable()))
            .map(|i| i.internal_id)
            .collect();
        for id in ids {
            self.remove_image(id);
        }
    }

    // ------------------------------------------------------------------
    // Placements
    // ------------------------------------------------------------------

    /// Create (or replace) a placement of an image on the grid.
    ///
    /// Returns the placement's internal id.
    pub fn put(&mut self, opts: PutOptions, cell: CellSize, now: Instant) -> GraphicsResult<u32> {
        let internal = self
            .resolve_internal_id(opts.image_id, opts.image_number)
            .ok_or(GraphicsError::ImageNotFound(if opts.image_id != 0 {
                opts.image_id
            } else {
                opts.image_number
            }))?;
        self.put_internal(internal, opts, cell, now)
    }

    /// Like [`put`](Self::put), addressing the image by internal id.
    ///
    /// Used by transmit-and-display flows, where the image may be anonymous
    /// and thus unreachable by client id or number.
    pub fn put_internal(
        &mut self,
        internal: u32,
        opts: PutOptions,
        cell: CellSize,
        now: Instant,
    ) -> GraphicsResult<u32> {
        let Some(image) = self.images.get_mut(&internal) else {
            return Err(GraphicsError::ImageNotFound(opts.image_id));
        };

        let src_x = opts.src_x.min(image.width);
        let src_y = opts.src_y.min(image.height);
        let max_w = image.width - src_x;
        let max_h = image.height - src_y;
        let src_width = if opts.src_width == 0 {
            max_w
        } else {
            opts.src_width.min(max_w)
        };
        let src_height = if opts.src_height == 0 {
            max_h
        } else {
            opts.src_height.min(max_h)
        };

        let mut r = ImageRef {
            client_id: opts.placement_id,
            is_virtual: opts.is_virtual,
            start_row: opts.start_row,
            start_column: opts.start_column,
            num_cols: opts.num_cols,
            num_rows: opts.num_rows,
            src_x: src_x as f32,
            src_y: src_y as f32,
            src_width: src_width as f32,
            src_height: src_height as f32,
            cell_x_offset: opts.cell_x_offset,
            cell_y_offset: opts.cell_y_offset,
            z_index: opts.z_index,
            ..ImageRef::default()
        };
        r.update_src_rect(image.width, image.height);
        r.update_effective_size(cell);
        let ref_id = image.add_ref(r);
        image.touch(now);
        if !opts.is_virtual {
            self.layers_dirty = true;
        }
        Ok(ref_id)
    }

    /// Instantiate a concrete cell image from a virtual placement.
    ///
    /// `row`/`col` position the placement on the grid; `req` names the
    /// sub-box of the virtual placement's cell box to display. Returns
    /// `Ok(None)` when the requested sub-box is entirely outside the scaled
    /// image, in which case no placement is created.
    pub fn place_cell_image(
        &mut self,
        image_client_id: u32,
        placement_id: u32,
        row: i32,
        col: i32,
        req: CellBox,
        cell: CellSize,
        now: Instant,
    ) -> GraphicsResult<Option<u32>> {
        let internal = self
            .image_by_client_id(image_client_id)
            .map(|i| i.internal_id)
            .ok_or(GraphicsError::ImageNotFound(image_client_id))?;
        let Some(image) = self.images.get_mut(&internal) else {
            return Err(GraphicsError::ImageNotFound(image_client_id));
        };
        let Some(vref) = image.find_virtual_ref(placement_id) else {
            return Err(GraphicsError::VirtualPlacementNotFound(image_client_id));
        };

        let img_columns = if vref.num_cols > 0 {
            vref.num_cols
        } else {
            cells_for_pixels(image.width, cell.width)
        };
        let img_rows = if vref.num_rows > 0 {
            vref.num_rows
        } else {
            cells_for_pixels(image.height, cell.height)
        };
        let virtual_ref_id = vref.internal_id;

        let Some(fit) = fit_cell_image(image.width, image.height, img_columns, img_rows, cell, req)
        else {
            return Ok(None);
        };

        let mut r = ImageRef {
            virtual_ref_id,
            start_row: row.saturating_add(fit.skip_rows as i32),
            start_column: col.saturating_add(fit.skip_cols as i32),
            num_cols: fit.num_cols,
            num_rows: fit.num_rows,
            src_x: fit.src_x,
            src_y: fit.src_y,
            src_width: fit.src_width,
            src_height: fit.src_height,
            cell_x_offset: fit.cell_x_offset,
            cell_y_offset: fit.cell_y_offset,
            // Cell images draw beneath the cursor.
            z_index: -1,
            ..ImageRef::default()
        };
        r.update_src_rect(image.width, image.height);
        r.update_effective_size(cell);
        let ref_id = image.add_ref(r);
        image.touch(now);
        self.layers_dirty = true;
        Ok(Some(ref_id))
    }

    /// Remove a placement by its client id.
    ///
    /// An anonymous image left refless is removed with it.
    pub fn remove_placement(
        &mut self,
        image_client_id: u32,
        placement_id: u32,
    ) -> GraphicsResult<()> {
        let internal = self
            .image_by_client_id(image_client_id)
            .map(|i| i.internal_id)
            .ok_or(GraphicsError::ImageNotFound(image_client_id))?;
        let Some(image) = self.images.get_mut(&internal) else {
            return Err(GraphicsError::ImageNotFound(image_client_id));
        };
        let Some(ref_id) = image.ref_by_client_id(placement_id).map(|r| r.internal_id) else {
            return Err(GraphicsError::PlacementNotFound(
                image_client_id,
                placement_id,
            ));
        };
        image.remove_ref(ref_id);
        self.layers_dirty = true;
        if let Some(image) = self.images.get(&internal) {
            if !image.has_refs() && !image.is_client_addressable() {
                self.remove_image(internal);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Animation
    // ------------------------------------------------------------------

    /// Add an animation frame to an image.
    ///
    /// Returns the frame's id.
    pub fn add_frame(
        &mut self,
        image_client_id: u32,
        image_number: u32,
        opts: FrameOptions,
        decoded: DecodedImage,
        now: Instant,
    ) -> GraphicsResult<u32> {
        decoded.validate()?;
        self.check_dimensions(decoded.width, decoded.height)?;
        let internal = self
            .resolve_internal_id(image_client_id, image_number)
            .ok_or(GraphicsError::ImageNotFound(if image_client_id != 0 {
                image_client_id
            } else {
                image_number
            }))?;

        let charged = decoded.pixels.len();
        let frame_id = {
            let Some(image) = self.images.get_mut(&internal) else {
                return Err(GraphicsError::ImageNotFound(image_client_id));
            };
            if opts.base_frame_id != 0 && image.frame(opts.base_frame_id).is_none() {
                return Err(GraphicsError::FrameNotFound(opts.base_frame_id));
            }
            let frame = Frame {
                id: opts.frame_id,
                width: decoded.width,
                height: decoded.height,
                x: opts.x,
                y: opts.y,
                gap: opts.gap,
                bgcolor: opts.bgcolor,
                alpha_blend: opts.alpha_blend,
                is_opaque: decoded.is_opaque,
                base_frame_id: opts.base_frame_id,
            };
            let id = image.add_frame(frame)?;
            image.used_storage += charged;
            image.touch(now);
            id
        };
        self.frames
            .store(FrameKey::new(internal, frame_id), decoded.pixels);
        self.used_storage += charged;
        self.enforce_storage_limit(internal);
        Ok(frame_id)
    }

    /// Composite one frame's flattened pixels onto another frame.
    ///
    /// The destination becomes a standalone full-canvas frame.
    pub fn compose_frames(
        &mut self,
        image_client_id: u32,
        image_number: u32,
        src_frame_id: u32,
        dest_frame_id: u32,
        now: Instant,
    ) -> GraphicsResult<()> {
        let internal = self
            .resolve_internal_id(image_client_id, image_number)
            .ok_or(GraphicsError::ImageNotFound(if image_client_id != 0 {
                image_client_id
            } else {
                image_number
            }))?;

        let (new_pixels, new_opaque) = {
            let Some(image) = self.images.get(&internal) else {
                return Err(GraphicsError::ImageNotFound(image_client_id));
            };
            if image.frame(src_frame_id).is_none() {
                return Err(GraphicsError::FrameNotFound(src_frame_id));
            }
            if image.frame(dest_frame_id).is_none() {
                return Err(GraphicsError::FrameNotFound(dest_frame_id));
            }
            let src_flat = flatten_frame(image, src_frame_id, self.frames.as_ref()).ok_or(
                GraphicsError::FrameDataMissing {
                    image_id: internal,
                    frame_id: src_frame_id,
                },
            )?;
            let mut dest_flat = flatten_frame(image, dest_frame_id, self.frames.as_ref()).ok_or(
                GraphicsError::FrameDataMissing {
                    image_id: internal,
                    frame_id: dest_frame_id,
                },
            )?;
            let overlay = Frame::full_canvas(0, image.width, image.height, src_flat.is_opaque);
            compose_patch(
                &mut dest_flat.pixels,
                image.width,
                image.height,
                dest_flat.is_opaque,
                &overlay,
                &src_flat.pixels,
            );
            (dest_flat.pixels, dest_flat.is_opaque)
        };

        let key = FrameKey::new(internal, dest_frame_id);
        let old_len = self.frames.load(key).map_or(0, |b| b.len());
        let new_len = new_pixels.len();
        self.frames.store(key, new_pixels);

        let Some(image) = self.images.get_mut(&internal) else {
            return Err(GraphicsError::ImageNotFound(image_client_id));
        };
        let (w, h) = (image.width, image.height);
        if let Some(f) = image.frame_mut(dest_frame_id) {
            f.x = 0;
            f.y = 0;
            f.width = w;
            f.height = h;
            f.base_frame_id = 0;
            f.is_opaque = new_opaque;
        }
        image.used_storage = image.used_storage.saturating_sub(old_len) + new_len;
        image.touch(now);
        self.used_storage = self.used_storage.saturating_sub(old_len) + new_len;
        self.enforce_storage_limit(internal);
        Ok(())
    }

    /// Remove all extra frames of an image, stopping its animation and
    /// freeing their spilled bytes. The root frame is untouched.
    pub fn delete_frames(
        &mut self,
        image_client_id: u32,
        image_number: u32,
        now: Instant,
    ) -> GraphicsResult<()> {
        let internal = self
            .resolve_internal_id(image_client_id, image_number)
            .ok_or(GraphicsError::ImageNotFound(if image_client_id != 0 {
                image_client_id
            } else {
                image_number
            }))?;
        let Some(image) = self.images.get_mut(&internal) else {
            return Err(GraphicsError::ImageNotFound(image_client_id));
        };
        let removed = image.clear_frames();
        let mut freed = 0usize;
        for frame in &removed {
            let key = FrameKey::new(internal, frame.id);
            if let Some(bytes) = self.frames.load(key) {
                freed += bytes.len();
            }
            self.frames.remove(key);
        }
        image.used_storage = image.used_storage.saturating_sub(freed);
        image.touch(now);
        self.used_storage = self.used_storage.saturating_sub(freed);
        self.layers_dirty = true;
        Ok(())
    }

    /// Apply an animation-control command to an image.
    pub fn control_animation(
        &mut self,
        image_client_id: u32,
        image_number: u32,
        ctl: AnimationControl,
        now: Instant,
    ) -> GraphicsResult<()> {
        let internal = self
            .resolve_internal_id(image_client_id, image_number)
            .ok_or(GraphicsError::ImageNotFound(if image_client_id != 0 {
                image_client_id
            } else {
                image_number
            }))?;
        let Some(image) = self.images.get_mut(&internal) else {
            return Err(GraphicsError::ImageNotFound(image_client_id));
        };

        if let Some((frame_id, gap)) = ctl.set_gap {
            let Some(frame) = image.frame_mut(frame_id) else {
                return Err(GraphicsError::FrameNotFound(frame_id));
            };
            let old = frame.gap;
            frame.gap = gap;
            image.animation_duration =
                image.animation_duration.saturating_sub(old).saturating_add(gap);
        }
        if let Some(frame_id) = ctl.current_frame {
            let index = if frame_id == ROOT_FRAME_ID {
                0
            } else {
                let pos = image
                    .extra_frames()
                    .position(|f| f.id == frame_id)
                    .ok_or(GraphicsError::FrameNotFound(frame_id))?;
                pos as u32 + 1
            };
            image.current_frame_index = index;
        }
        if let Some(max_loops) = ctl.max_loops {
            image.max_loops = max_loops;
        }
        if let Some(state) = ctl.state {
            if state == AnimationState::Running && image.animation_state != AnimationState::Running
            {
                image.reset_animation();
            }
            image.animation_state = state;
        }
        image.touch(now);
        Ok(())
    }

    /// Flatten and upload an image's current frame immediately.
    ///
    /// Returns whether the texture was updated; on a soft failure the
    /// previous texture remains on screen.
    pub fn update_current_frame(
        &mut self,
        internal_id: u32,
        sink: &mut dyn TextureSink,
        now: Instant,
    ) -> bool {
        let Some(image) = self.images.get_mut(&internal_id) else {
            return false;
        };
        sink.make_current();
        let ok = upload_current_frame(image, self.frames.as_ref(), sink, now);
        if ok {
            self.layers_dirty = true;
        }
        ok
    }

    /// Advance the animation clock for every animatable image.
    ///
    /// Called once per tick. For each image whose current frame's gap has
    /// elapsed, the cursor advances (skipping zero-gap frames, honoring the
    /// loop budget), the new frame is flattened and uploaded, and the minimum
    /// time until any image's next advance is reported as a wake hint.
    pub fn scan_active_animations(
        &mut self,
        now: Instant,
        sink: &mut dyn TextureSink,
    ) -> AnimationTick {
        let mut changed = false;
        let mut next_wake: Option<Duration> = None;
        let mut ctx = LazyContext::default();

        let mut ids: Vec<u32> = self.images.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(image) = self.images.get_mut(&id) else {
                continue;
            };
            if !image.is_animatable() {
                continue;
            }
            let Some(shown_at) = image.current_frame_shown_at else {
                continue;
            };
            let gap = Duration::from_millis(u64::from(image.current_frame().gap));
            let elapsed = now.saturating_duration_since(shown_at);
            let mut remaining = gap.saturating_sub(elapsed);
            if elapsed >= gap {
                if image.advance_frame() {
                    ctx.ensure(sink);
                    if !upload_current_frame(image, self.frames.as_ref(), sink, now) {
                        warn!(image_id = id, "animation frame not updated this tick");
                        // Keep the clock moving so a persistent miss does not
                        // turn into a hot loop.
                        image.current_frame_shown_at = Some(now);
                    }
                    changed = true;
                }
                if !image.is_animatable() {
                    continue;
                }
                remaining = Duration::from_millis(u64::from(image.current_frame().gap));
            }
            next_wake = Some(match next_wake {
                None => remaining,
                Some(wake) => wake.min(remaining),
            });
        }
        if changed {
            self.layers_dirty = true;
        }
        AnimationTick { changed, next_wake }
    }

    // ------------------------------------------------------------------
    // Scroll & lifecycle
    // ------------------------------------------------------------------

    /// Apply a scroll event to all placements.
    pub fn scroll(&mut self, data: ScrollData) {
        if data.has_margins {
            self.scroll_within_margins(data);
        } else {
            self.scroll_all(data);
        }
        self.remove_unreferenced_images(false);
    }

    fn scroll_all(&mut self, data: ScrollData) {
        let mut touched = 0usize;
        let ids: Vec<u32> = self.images.keys().copied().collect();
        for id in ids {
            let Some(image) = self.images.get_mut(&id) else {
                continue;
            };
            image.retain_refs(|r| {
                if r.is_virtual {
                    return true;
                }
                touched += 1;
                r.start_row = r.start_row.saturating_add(data.amt);
                r.bottom_row() > data.limit
            });
        }
        if touched > 0 {
            self.layers_dirty = true;
        }
    }

    fn scroll_within_margins(&mut self, data: ScrollData) {
        let margin_top = data.margin_top as i32;
        let margin_bottom = data.margin_bottom as i32;
        let mut touched = 0usize;
        let ids: Vec<u32> = self.images.keys().copied().collect();
        for id in ids {
            let Some(image) = self.images.get_mut(&id) else {
                continue;
            };
            let (w, h) = (image.width, image.height);
            image.retain_refs(|r| {
                if r.is_virtual {
                    return true;
                }
                // Only refs fully inside the margins move.
                let last = r.bottom_row() - 1;
                if r.start_row < margin_top || last > margin_bottom {
                    return true;
                }
                touched += 1;
                r.start_row = r.start_row.saturating_add(data.amt);
                clip_ref_to_margins(r, margin_top, margin_bottom, w, h)
            });
        }
        if touched > 0 {
            self.layers_dirty = true;
        }
    }

    /// Remove concrete cell-image placements within a row range (inclusive).
    pub fn remove_cell_images(&mut self, from_row: i32, to_row: i32) {
        self.remove_cell_images_matching(|r| {
            r.start_row <= to_row && r.bottom_row() - 1 >= from_row
        });
    }

    /// Remove every concrete cell-image placement.
    pub fn remove_all_cell_images(&mut self) {
        self.remove_cell_images_matching(|_| true);
    }

    fn remove_cell_images_matching<F: Fn(&ImageRef) -> bool>(&mut self, matches: F) {
        let mut removed = 0usize;
        let ids: Vec<u32> = self.images.keys().copied().collect();
        for id in ids {
            let Some(image) = self.images.get_mut(&id) else {
                continue;
            };
            removed += image.retain_refs(|r| !(r.virtual_ref_id != 0 && matches(r)));
        }
        if removed > 0 {
            self.layers_dirty = true;
        }
        self.remove_unreferenced_images(false);
    }

    /// Remove non-virtual placements overlapping the visible area, or all of
    /// them when `all`. Images left refless are deleted regardless of client
    /// addressability; they are not expected to survive a clear.
    pub fn clear(&mut self, all: bool, visible_rows: u32) {
        let mut removed = 0usize;
        let ids: Vec<u32> = self.images.keys().copied().collect();
        for id in ids {
            let Some(image) = self.images.get_mut(&id) else {
                continue;
            };
            removed += image.retain_refs(|r| {
                if r.is_virtual {
                    return true;
                }
                !(all || r.is_visible(0, visible_rows))
            });
        }
        if removed > 0 {
            self.layers_dirty = true;
        }
        self.remove_unreferenced_images(true);
    }

    // ------------------------------------------------------------------
    // Render output
    // ------------------------------------------------------------------

    /// Recompute the render list for the current viewport.
    ///
    /// Makes the rendering context current (lazily, once), releases deferred
    /// texture handles, uploads textures for images that lack one, refreshes
    /// the derived rectangles of every visible placement, and returns the
    /// rectangles sorted by paint order and grouped by texture. Clears the
    /// dirty flag.
    pub fn update_layers(
        &mut self,
        scrolled_by: i32,
        viewport: Viewport,
        sink: &mut dyn TextureSink,
    ) -> &[ImageRenderData] {
        let mut ctx = LazyContext::default();
        if !self.dead_textures.is_empty() {
            ctx.ensure(sink);
            for texture in self.dead_textures.drain(..) {
                sink.release(texture);
            }
        }

        self.render_list.clear();
        let now = Instant::now();
        let mut ids: Vec<u32> = self.images.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let Some(image) = self.images.get_mut(&id) else {
                continue;
            };
            let (w, h) = (image.width, image.height);
            let any_visible = image
                .refs()
                .any(|r| !r.is_virtual && r.is_visible(scrolled_by, viewport.rows));
            if !any_visible {
                continue;
            }
            if image.texture.is_null() {
                ctx.ensure(sink);
                if !upload_current_frame(image, self.frames.as_ref(), sink, now) {
                    continue;
                }
            } else if image.current_frame_shown_at.is_none() {
                image.current_frame_shown_at = Some(now);
            }
            let texture = image.texture;
            for r in image.refs_mut() {
                if r.is_virtual || !r.is_visible(scrolled_by, viewport.rows) {
                    continue;
                }
                r.update_src_rect(w, h);
                r.update_dest_rect(scrolled_by, &viewport);
                self.render_list.push(ImageRenderData {
                    texture,
                    src_rect: r.src_rect,
                    dest_rect: r.dest_rect,
                    z_index: r.z_index,
                });
            }
        }
        // Paint order first; within a z level, keep rectangles of the same
        // texture adjacent so the renderer can batch bindings.
        self.render_list
            .sort_by_key(|d| (d.z_index, d.texture.raw()));
        self.layers_dirty = false;
        &self.render_list
    }
}
