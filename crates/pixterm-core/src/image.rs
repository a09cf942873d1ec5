//! Image, frame, and placement data model.
//!
//! An [`Image`] owns its animation [`Frame`] metadata and its placements
//! ([`ImageRef`]). Frame pixel data is not resident: it lives in the frame
//! store and is fetched when a frame is flattened. All frames of an animated
//! image share one GPU texture that is overwritten per tick.

use std::time::Instant;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{GraphicsError, GraphicsResult};
use crate::geometry::{cells_for_pixels, gl_pos_x, gl_pos_y, gl_size, CellSize, Rect, Viewport};
use crate::gpu::TextureHandle;
use crate::{DEFAULT_FRAME_GAP_MS, MAX_FRAMES_PER_IMAGE};

/// Frame id of the implicit root frame.
pub const ROOT_FRAME_ID: u32 = 0;

/// Advance a wrapping id counter, skipping 0.
///
/// 0 is the sentinel for "no id" everywhere in this crate, so allocation
/// wraps past `u32::MAX` to 1 instead of erroring.
#[inline]
pub fn next_id(counter: &mut u32) -> u32 {
    *counter = counter.wrapping_add(1);
    if *counter == 0 {
        *counter = 1;
    }
    *counter
}

/// Animation playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnimationState {
    /// Not animating.
    #[default]
    Stopped,
    /// Frames are still being transmitted; playback waits at the current frame.
    Loading,
    /// Advancing frames on the animation clock.
    Running,
}

/// Metadata for one animation frame.
///
/// `base_frame_id == 0` means the frame stands alone (its bytes, composited
/// over `bgcolor`, produce the full canvas). Non-zero names the frame whose
/// flattened result this frame is a delta over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Frame id, unique within the image. 0 is reserved for the root frame.
    pub id: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Horizontal offset within the image canvas.
    pub x: u32,
    /// Vertical offset within the image canvas.
    pub y: u32,
    /// Display duration in milliseconds. 0 means "instantaneous, skip".
    pub gap: u32,
    /// Pre-fill color (0xRRGGBBAA) for canvas regions the frame does not
    /// cover. 0 = transparent black.
    pub bgcolor: u32,
    /// Blend transparent pixels with the base instead of replacing them.
    pub alpha_blend: bool,
    /// Pixel data is RGB (3 bytes per pixel) rather than RGBA.
    pub is_opaque: bool,
    /// Frame this one is stored as a delta over; 0 = standalone.
    pub base_frame_id: u32,
}

impl Frame {
    /// A standalone full-canvas frame.
    #[must_use]
    pub const fn full_canvas(id: u32, width: u32, height: u32, is_opaque: bool) -> Self {
        Self {
            id,
            width,
            height,
            x: 0,
            y: 0,
            gap: 0,
            bgcolor: 0,
            alpha_blend: true,
            is_opaque,
            base_frame_id: 0,
        }
    }

    /// Whether the frame covers the whole image canvas with no offset.
    #[inline]
    #[must_use]
    pub const fn covers_canvas(&self, img_width: u32, img_height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width == img_width && self.height == img_height
    }

    /// Bytes per pixel of the frame's stored data.
    #[inline]
    #[must_use]
    pub const fn bytes_per_pixel(&self) -> usize {
        if self.is_opaque {
            3
        } else {
            4
        }
    }
}

/// One placement of an image on the terminal grid.
///
/// `src_rect` and `dest_rect` are derived from the other fields by
/// [`ImageRef::update_src_rect`] and [`ImageRef::update_dest_rect`]; nothing
/// else writes them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageRef {
    /// Id unique within the owning image, never 0.
    pub internal_id: u32,
    /// Protocol placement id; 0 for anonymous placements.
    pub client_id: u32,
    /// Template placement for Unicode placeholders; never drawn directly.
    pub is_virtual: bool,
    /// Internal id of the virtual ref this cell image was instantiated from;
    /// 0 for ordinary placements.
    pub virtual_ref_id: u32,
    /// Grid row; signed, may point into scrollback or off-screen.
    pub start_row: i32,
    /// Grid column; signed.
    pub start_column: i32,
    /// Requested width in cells; 0 = natural size.
    pub num_cols: u32,
    /// Requested height in cells; 0 = natural size.
    pub num_rows: u32,
    /// Actual width in cells after size resolution and clipping.
    pub effective_num_cols: u32,
    /// Actual height in cells after size resolution and clipping.
    pub effective_num_rows: u32,
    /// Source rectangle x in image pixels.
    pub src_x: f32,
    /// Source rectangle y in image pixels.
    pub src_y: f32,
    /// Source rectangle width in image pixels.
    pub src_width: f32,
    /// Source rectangle height in image pixels.
    pub src_height: f32,
    /// Pixel offset into the first destination column.
    pub cell_x_offset: u32,
    /// Pixel offset into the first destination row.
    pub cell_y_offset: u32,
    /// Paint order; cell images default to -1 (beneath the cursor).
    pub z_index: i32,
    /// Normalized source rectangle (0..1 in image space). Derived.
    pub src_rect: Rect,
    /// Destination rectangle in normalized device coordinates. Derived.
    pub dest_rect: Rect,
}

impl Default for ImageRef {
    fn default() -> Self {
        Self {
            internal_id: 0,
            client_id: 0,
            is_virtual: false,
            virtual_ref_id: 0,
            start_row: 0,
            start_column: 0,
            num_cols: 0,
            num_rows: 0,
            effective_num_cols: 0,
            effective_num_rows: 0,
            src_x: 0.0,
            src_y: 0.0,
            src_width: 0.0,
            src_height: 0.0,
            cell_x_offset: 0,
            cell_y_offset: 0,
            z_index: 0,
            src_rect: Rect::default(),
            dest_rect: Rect::default(),
        }
    }
}

impl ImageRef {
    /// Recompute the normalized source rectangle from the pixel-space source
    /// rectangle. Pure in the ref and image dimensions.
    pub fn update_src_rect(&mut self, img_width: u32, img_height: u32) {
        if img_width == 0 || img_height == 0 {
            self.src_rect = Rect::default();
            return;
        }
        let w = img_width as f32;
        let h = img_height as f32;
        self.src_rect = Rect::new(
            self.src_x / w,
            self.src_y / h,
            (self.src_x + self.src_width) / w,
            (self.src_y + self.src_height) / h,
        );
    }

    /// Resolve the effective cell extent from the requested extent, the
    /// source rectangle, and the cell size. A request of 0 means "as many
    /// cells as the source needs at natural scale".
    pub fn update_effective_size(&mut self, cell: CellSize) {
        self.effective_num_cols = if self.num_cols > 0 {
            self.num_cols
        } else {
            cells_for_pixels(self.src_width.ceil() as u32 + self.cell_x_offset, cell.width)
        };
        self.effective_num_rows = if self.num_rows > 0 {
            self.num_rows
        } else {
            cells_for_pixels(
                self.src_height.ceil() as u32 + self.cell_y_offset,
                cell.height,
            )
        };
    }

    /// Recompute the destination rectangle in NDC for the current viewport.
    /// Pure in the ref, the scroll offset, and the viewport.
    pub fn update_dest_rect(&mut self, scrolled_by: i32, vp: &Viewport) {
        let cell = vp.cell;
        let left_px =
            i64::from(self.start_column) * i64::from(cell.width) + i64::from(self.cell_x_offset);
        let top_px = (i64::from(self.start_row) + i64::from(scrolled_by)) * i64::from(cell.height)
            + i64::from(self.cell_y_offset);
        let width_px =
            (self.effective_num_cols * cell.width).saturating_sub(self.cell_x_offset);
        let height_px =
            (self.effective_num_rows * cell.height).saturating_sub(self.cell_y_offset);

        let left = gl_pos_x(left_px, vp.width_px);
        let top = gl_pos_y(top_px, vp.height_px);
        self.dest_rect = Rect::new(
            left,
            top,
            left + gl_size(width_px, vp.width_px),
            top - gl_size(height_px, vp.height_px),
        );
    }

    /// Exclusive bottom row of the placement.
    #[inline]
    #[must_use]
    pub fn bottom_row(&self) -> i32 {
        self.start_row
            .saturating_add(i32::try_from(self.effective_num_rows).unwrap_or(i32::MAX))
    }

    /// Whether any part of the placement lies within the visible rows, given
    /// how far the viewport is scrolled back.
    #[must_use]
    pub fn is_visible(&self, scrolled_by: i32, visible_rows: u32) -> bool {
        let top = i64::from(self.start_row) + i64::from(scrolled_by);
        let bottom = top + i64::from(self.effective_num_rows);
        bottom > 0 && top < i64::from(visible_rows)
    }
}

/// A decoded picture with one or more animation frames and its placements.
#[derive(Debug)]
pub struct Image {
    /// Process-unique id, never 0.
    pub internal_id: u32,
    /// Protocol-visible id; 0 for anonymous/transient images.
    pub client_id: u32,
    /// Client-chosen number for "most recent image" lookups; 0 = unset.
    pub client_number: u32,
    /// Canvas width in pixels.
    pub width: u32,
    /// Canvas height in pixels.
    pub height: u32,
    /// Bytes charged against the manager's storage budget.
    pub used_storage: usize,
    /// Last access time, for LRU eviction.
    pub atime: Instant,
    /// GPU texture; at most one per image, shared by all frames.
    pub texture: TextureHandle,
    /// The implicit first frame.
    pub root_frame: Frame,
    /// Animation playback state.
    pub animation_state: AnimationState,
    /// Index of the frame currently displayed (0 = root).
    pub current_frame_index: u32,
    /// Completed animation loops.
    pub current_loop: u32,
    /// Loop budget; 0 = unlimited.
    pub max_loops: u32,
    /// Sum of all frame gaps in milliseconds.
    pub animation_duration: u32,
    /// When the current frame was last drawn; `None` until first drawn.
    pub current_frame_shown_at: Option<Instant>,
    extra_frames: SmallVec<[Frame; 4]>,
    refs: FxHashMap<u32, ImageRef>,
    ref_id_counter: u32,
    frame_id_counter: u32,
}

impl Image {
    /// Create an image with its root frame covering the canvas.
    #[must_use]
    pub fn new(
        internal_id: u32,
        client_id: u32,
        client_number: u32,
        width: u32,
        height: u32,
        is_opaque: bool,
        now: Instant,
    ) -> Self {
        Self {
            internal_id,
            client_id,
            client_number,
            width,
            height,
            used_storage: 0,
            atime: now,
            texture: TextureHandle::NULL,
            root_frame: Frame::full_canvas(ROOT_FRAME_ID, width, height, is_opaque),
            animation_state: AnimationState::default(),
            current_frame_index: 0,
            current_loop: 0,
            max_loops: 0,
            animation_duration: 0,
            current_frame_shown_at: None,
            extra_frames: SmallVec::new(),
            refs: FxHashMap::default(),
            ref_id_counter: 0,
            frame_id_counter: 0,
        }
    }

    /// Whether the image can still be addressed by the client after its refs
    /// are gone.
    #[inline]
    #[must_use]
    pub const fn is_client_addressable(&self) -> bool {
        self.client_id != 0 || self.client_number != 0
    }

    /// Mark the image accessed.
    #[inline]
    pub fn touch(&mut self, now: Instant) {
        self.atime = now;
    }

    // ------------------------------------------------------------------
    // Frames
    // ------------------------------------------------------------------

    /// Total frame count including the root.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> u32 {
        1 + self.extra_frames.len() as u32
    }

    /// Whether the image has more than one frame.
    #[inline]
    #[must_use]
    pub fn is_animated(&self) -> bool {
        !self.extra_frames.is_empty()
    }

    /// Look up a frame by id.
    #[must_use]
    pub fn frame(&self, id: u32) -> Option<&Frame> {
        if id == ROOT_FRAME_ID {
            return Some(&self.root_frame);
        }
        self.extra_frames.iter().find(|f| f.id == id)
    }

    /// Look up a frame by id, mutably.
    pub fn frame_mut(&mut self, id: u32) -> Option<&mut Frame> {
        if id == ROOT_FRAME_ID {
            return Some(&mut self.root_frame);
        }
        self.extra_frames.iter_mut().find(|f| f.id == id)
    }

    /// Frame at a playback index (0 = root, then extra frames in order).
    #[must_use]
    pub fn frame_at_index(&self, index: u32) -> Option<&Frame> {
        if index == 0 {
            return Some(&self.root_frame);
        }
        self.extra_frames.get(index as usize - 1)
    }

    /// The frame currently selected for display.
    #[must_use]
    pub fn current_frame(&self) -> &Frame {
        self.frame_at_index(self.current_frame_index)
            .unwrap_or(&self.root_frame)
    }

    /// Extra frames in playback order.
    #[inline]
    pub fn extra_frames(&self) -> impl Iterator<Item = &Frame> {
        self.extra_frames.iter()
    }

    /// Add an extra frame. A frame id of 0 is auto-assigned.
    ///
    /// When the image gains its second frame and the root gap is still 0,
    /// the root is given the default gap so playback does not starve it.
    pub fn add_frame(&mut self, mut frame: Frame) -> GraphicsResult<u32> {
        if self.frame_count() >= MAX_FRAMES_PER_IMAGE {
            return Err(GraphicsError::TooManyFrames);
        }
        if frame.id == 0 {
            frame.id = next_id(&mut self.frame_id_counter);
        }
        self.animation_duration = self.animation_duration.saturating_add(frame.gap);
        self.extra_frames.push(frame);
        if self.extra_frames.len() == 1 && self.root_frame.gap == 0 {
            self.root_frame.gap = DEFAULT_FRAME_GAP_MS;
            self.animation_duration = self.animation_duration.saturating_add(DEFAULT_FRAME_GAP_MS);
        }
        Ok(frame.id)
    }

    /// Remove an extra frame by id. The root frame cannot be removed.
    pub fn remove_frame(&mut self, id: u32) -> Option<Frame> {
        if id == ROOT_FRAME_ID {
            return None;
        }
        let pos = self.extra_frames.iter().position(|f| f.id == id)?;
        let frame = self.extra_frames.remove(pos);
        self.animation_duration = self.animation_duration.saturating_sub(frame.gap);
        if self.current_frame_index >= self.frame_count() {
            self.current_frame_index = 0;
        }
        Some(frame)
    }

    /// Remove all extra frames and stop the animation. Returns the removed
    /// frames so the caller can drop their spilled bytes.
    pub fn clear_frames(&mut self) -> SmallVec<[Frame; 4]> {
        let frames = std::mem::take(&mut self.extra_frames);
        for f in &frames {
            self.animation_duration = self.animation_duration.saturating_sub(f.gap);
        }
        self.animation_state = AnimationState::Stopped;
        self.current_frame_index = 0;
        self.current_loop = 0;
        frames
    }

    /// Reset the animation cursor to the first frame.
    pub fn reset_animation(&mut self) {
        self.current_frame_index = 0;
        self.current_loop = 0;
    }

    /// Whether the animation clock should consider this image.
    #[must_use]
    pub fn is_animatable(&self) -> bool {
        self.animation_state != AnimationState::Stopped
            && self.is_animated()
            && self.current_frame_shown_at.is_some()
            && self.animation_duration > 0
            && (self.max_loops == 0 || self.current_loop < self.max_loops)
    }

    /// Advance the animation cursor by one frame, skipping zero-gap frames
    /// and accounting for loop wraparound. Returns whether the cursor moved.
    pub fn advance_frame(&mut self) -> bool {
        let count = self.frame_count();
        if count < 2 {
            return false;
        }
        if self.max_loops != 0 && self.current_loop >= self.max_loops {
            return false;
        }
        let mut next = self.current_frame_index;
        let mut wrapped = false;
        for _ in 0..count {
            next = (next + 1) % count;
            if next == 0 {
                wrapped = true;
            }
            let gap = self
                .frame_at_index(next)
                .map(|f| f.gap)
                .unwrap_or_default();
            if gap > 0 {
                break;
            }
        }
        if next == self.current_frame_index && !wrapped {
            return false;
        }
        if wrapped {
            self.current_loop = self.current_loop.saturating_add(1);
        }
        self.current_frame_index = next;
        true
    }

    // ------------------------------------------------------------------
    // Refs
    // ------------------------------------------------------------------

    /// Number of placements.
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    /// Whether any placement exists.
    #[inline]
    #[must_use]
    pub fn has_refs(&self) -> bool {
        !self.refs.is_empty()
    }

    /// Iterate placements. Order is not significant.
    pub fn refs(&self) -> impl Iterator<Item = &ImageRef> {
        self.refs.values()
    }

    /// Iterate placements mutably.
    pub fn refs_mut(&mut self) -> impl Iterator<Item = &mut ImageRef> {
        self.refs.values_mut()
    }

    /// Add a placement, assigning its internal id. A non-zero client id
    /// replaces any existing placement with the same client id.
    pub fn add_ref(&mut self, mut r: ImageRef) -> u32 {
        if r.client_id != 0 {
            let existing: Vec<u32> = self
                .refs
                .values()
                .filter(|p| p.client_id == r.client_id)
                .map(|p| p.internal_id)
                .collect();
            for id in existing {
                self.refs.remove(&id);
            }
        }
        let id = next_id(&mut self.ref_id_counter);
        r.internal_id = id;
        self.refs.insert(id, r);
        id
    }

    /// Remove a placement by internal id.
    pub fn remove_ref(&mut self, internal_id: u32) -> Option<ImageRef> {
        self.refs.remove(&internal_id)
    }

    /// Look up a placement by internal id.
    #[must_use]
    pub fn get_ref(&self, internal_id: u32) -> Option<&ImageRef> {
        self.refs.get(&internal_id)
    }

    /// Look up a placement by client id.
    #[must_use]
    pub fn ref_by_client_id(&self, client_id: u32) -> Option<&ImageRef> {
        self.refs.values().find(|r| r.client_id == client_id)
    }

    /// Find a virtual placement: by client id when non-zero, otherwise the
    /// first virtual placement found.
    #[must_use]
    pub fn find_virtual_ref(&self, placement_id: u32) -> Option<&ImageRef> {
        if placement_id != 0 {
            self.refs
                .values()
                .find(|r| r.is_virtual && r.client_id == placement_id)
        } else {
            self.refs.values().find(|r| r.is_virtual)
        }
    }

    /// Mutate each placement and drop the ones the closure rejects. Returns
    /// how many were removed. Used by the scroll paths, which translate and
    /// clip in a single pass.
    pub fn retain_refs<F: FnMut(&mut ImageRef) -> bool>(&mut self, mut keep: F) -> usize {
        let before = self.refs.len();
        self.refs.retain(|_, r| keep(r));
        before - self.refs.len()
    }

    /// Remove all placements.
    pub fn clear_refs(&mut self) {
        self.refs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn image() -> Image {
        Image::new(1, 0, 0, 100, 50, false, Instant::now())
    }

    #[test]
    fn test_next_id_skips_zero() {
        let mut counter = u32::MAX - 1;
        assert_eq!(next_id(&mut counter), u32::MAX);
        assert_eq!(next_id(&mut counter), 1);
        assert_eq!(next_id(&mut counter), 2);
    }

    #[test]
    fn test_root_frame_covers_canvas() {
        let img = image();
        assert!(img.root_frame.covers_canvas(100, 50));
        assert_eq!(img.root_frame.id, ROOT_FRAME_ID);
        assert_eq!(img.frame_count(), 1);
        assert!(!img.is_animated());
    }

    #[test]
    fn test_add_frame_assigns_ids_and_default_root_gap() {
        let mut img = image();
        let mut f = Frame::full_canvas(0, 100, 50, false);
        f.gap = 100;
        let id = img.add_frame(f).unwrap();
        assert_eq!(id, 1);
        // Root picked up the default gap so playback does not starve it.
        assert_eq!(img.root_frame.gap, DEFAULT_FRAME_GAP_MS);
        assert_eq!(img.animation_duration, 100 + DEFAULT_FRAME_GAP_MS);
        assert!(img.is_animated());
    }

    #[test]
    fn test_remove_frame_updates_duration() {
        let mut img = image();
        let mut f = Frame::full_canvas(0, 100, 50, false);
        f.gap = 100;
        let id = img.add_frame(f).unwrap();
        let removed = img.remove_frame(id).unwrap();
        assert_eq!(removed.gap, 100);
        assert_eq!(img.animation_duration, DEFAULT_FRAME_GAP_MS);
        assert!(img.remove_frame(ROOT_FRAME_ID).is_none());
        assert!(img.remove_frame(99).is_none());
    }

    #[test]
    fn test_frame_cap() {
        let mut img = image();
        for _ in 1..MAX_FRAMES_PER_IMAGE {
            img.add_frame(Frame::full_canvas(0, 1, 1, false)).unwrap();
        }
        let result = img.add_frame(Frame::full_canvas(0, 1, 1, false));
        assert!(matches!(result, Err(GraphicsError::TooManyFrames)));
    }

    #[test]
    fn test_advance_skips_zero_gap_frames() {
        let mut img = image();
        for gap in [40u32, 0, 40] {
            let mut f = Frame::full_canvas(0, 100, 50, false);
            f.gap = gap;
            img.add_frame(f).unwrap();
        }
        // Indices: 0 (root, gap 40), 1 (40), 2 (0, skipped), 3 (40).
        assert!(img.advance_frame());
        assert_eq!(img.current_frame_index, 1);
        assert!(img.advance_frame());
        assert_eq!(img.current_frame_index, 3);
        assert!(img.advance_frame());
        assert_eq!(img.current_frame_index, 0);
        assert_eq!(img.current_loop, 1);
    }

    #[test]
    fn test_advance_respects_loop_budget() {
        let mut img = image();
        for _ in 0..2 {
            let mut f = Frame::full_canvas(0, 100, 50, false);
            f.gap = 40;
            img.add_frame(f).unwrap();
        }
        img.max_loops = 1;
        assert!(img.advance_frame()); // 0 -> 1
        assert!(img.advance_frame()); // 1 -> 2
        assert!(img.advance_frame()); // 2 -> 0, loop complete
        assert_eq!(img.current_loop, 1);
        assert!(!img.advance_frame());
        assert_eq!(img.current_frame_index, 0);
    }

    #[test]
    fn test_is_animatable_conditions() {
        let mut img = image();
        assert!(!img.is_animatable());

        let mut f = Frame::full_canvas(0, 100, 50, false);
        f.gap = 40;
        img.add_frame(f).unwrap();
        img.animation_state = AnimationState::Running;
        // Not drawn yet.
        assert!(!img.is_animatable());

        img.current_frame_shown_at = Some(Instant::now());
        assert!(img.is_animatable());

        img.max_loops = 1;
        img.current_loop = 1;
        assert!(!img.is_animatable());
    }

    #[test]
    fn test_ref_management() {
        let mut img = image();
        let id1 = img.add_ref(ImageRef::default());
        let id2 = img.add_ref(ImageRef::default());
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert!(img.has_refs());

        img.remove_ref(id1);
        assert!(img.get_ref(id1).is_none());
        assert!(img.get_ref(id2).is_some());

        img.clear_refs();
        assert!(!img.has_refs());
    }

    #[test]
    fn test_add_ref_replaces_same_client_id() {
        let mut img = image();
        let r1 = ImageRef {
            client_id: 7,
            start_row: 1,
            ..ImageRef::default()
        };
        let r2 = ImageRef {
            client_id: 7,
            start_row: 5,
            ..ImageRef::default()
        };
        img.add_ref(r1);
        img.add_ref(r2);
        assert_eq!(img.ref_count(), 1);
        assert_eq!(img.ref_by_client_id(7).unwrap().start_row, 5);
    }

    #[test]
    fn test_find_virtual_ref() {
        let mut img = image();
        img.add_ref(ImageRef::default());
        let v = ImageRef {
            is_virtual: true,
            client_id: 3,
            ..ImageRef::default()
        };
        img.add_ref(v);

        assert!(img.find_virtual_ref(0).unwrap().is_virtual);
        assert_eq!(img.find_virtual_ref(3).unwrap().client_id, 3);
        assert!(img.find_virtual_ref(4).is_none());
    }

    #[test]
    fn test_update_src_rect_idempotent() {
        let mut r = ImageRef {
            src_x: 25.0,
            src_y: 0.0,
            src_width: 50.0,
            src_height: 50.0,
            ..ImageRef::default()
        };
        r.update_src_rect(100, 50);
        let first = r.src_rect;
        r.update_src_rect(100, 50);
        assert_eq!(first, r.src_rect);
        assert!((r.src_rect.left - 0.25).abs() < f32::EPSILON);
        assert!((r.src_rect.right - 0.75).abs() < f32::EPSILON);
        assert!((r.src_rect.bottom - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_update_dest_rect_idempotent() {
        let vp = Viewport {
            width_px: 800,
            height_px: 600,
            rows: 60,
            cols: 80,
            cell: CellSize::new(10, 10),
        };
        let mut r = ImageRef {
            start_row: 2,
            start_column: 4,
            effective_num_cols: 10,
            effective_num_rows: 5,
            ..ImageRef::default()
        };
        r.update_dest_rect(0, &vp);
        let first = r.dest_rect;
        r.update_dest_rect(0, &vp);
        assert_eq!(first, r.dest_rect);
        assert!(first.left < first.right);
        assert!(first.top > first.bottom);
    }

    #[test]
    fn test_effective_size_natural() {
        let mut r = ImageRef {
            src_width: 95.0,
            src_height: 50.0,
            cell_x_offset: 7,
            ..ImageRef::default()
        };
        r.update_effective_size(CellSize::new(10, 10));
        // 95px + 7px offset = 102px -> 11 columns.
        assert_eq!(r.effective_num_cols, 11);
        assert_eq!(r.effective_num_rows, 5);
    }

    #[test]
    fn test_visibility() {
        let r = ImageRef {
            start_row: -3,
            effective_num_rows: 2,
            effective_num_cols: 1,
            ..ImageRef::default()
        };
        // Rows -3..-1: off-screen until scrolled back.
        assert!(!r.is_visible(0, 24));
        assert!(r.is_visible(2, 24));
        assert!(r.is_visible(4, 24));
    }
}
