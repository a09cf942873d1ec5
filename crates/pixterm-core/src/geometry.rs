//! Coordinate math for image placements.
//!
//! Everything here is pure: pixel-to-NDC conversion for the renderer, and the
//! fitting algorithm that maps a Unicode-placeholder cell box onto a source
//! image with aspect-preserving scaling, centering, and clipping at cell
//! boundaries.

/// Size of one terminal cell in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSize {
    /// Cell width in pixels.
    pub width: u32,
    /// Cell height in pixels.
    pub height: u32,
}

impl CellSize {
    /// Create a new cell size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Viewport geometry for destination-rectangle computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    /// Viewport width in pixels.
    pub width_px: u32,
    /// Viewport height in pixels.
    pub height_px: u32,
    /// Visible rows.
    pub rows: u32,
    /// Visible columns.
    pub cols: u32,
    /// Cell size in pixels.
    pub cell: CellSize,
}

/// A rectangle in either normalized image space (y down, 0..1) or normalized
/// device coordinates (y up, -1..1). Which space applies is determined by the
/// field it is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    /// Left edge.
    pub left: f32,
    /// Top edge.
    pub top: f32,
    /// Right edge.
    pub right: f32,
    /// Bottom edge.
    pub bottom: f32,
}

impl Rect {
    /// Create a rectangle from its four edges.
    #[must_use]
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }
}

/// Convert a pixel extent to an NDC extent.
#[inline]
#[must_use]
pub fn gl_size(sz: u32, viewport_size: u32) -> f32 {
    // convert pixel sz to OpenGL coordinate system.
    let px = 2.0f32 / viewport_size as f32;
    px * sz as f32
}

/// Convert a pixel x position (from the left margin) to an NDC x position.
///
/// Accepts signed positions so partially scrolled-out placements map to
/// coordinates outside the -1..1 range rather than wrapping.
#[inline]
#[must_use]
pub fn gl_pos_x(px_from_left_margin: i64, viewport_size: u32) -> f32 {
    let px = 2.0f32 / viewport_size as f32;
    -1.0 + px_from_left_margin as f32 * px
}

/// Convert a pixel y position (from the top margin) to an NDC y position.
#[inline]
#[must_use]
pub fn gl_pos_y(px_from_top_margin: i64, viewport_size: u32) -> f32 {
    let px = 2.0f32 / viewport_size as f32;
    1.0 - px_from_top_margin as f32 * px
}

/// The requested destination sub-box of a virtual placement, in cell units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellBox {
    /// Column within the virtual placement's cell box.
    pub img_col: u32,
    /// Row within the virtual placement's cell box.
    pub img_row: u32,
    /// Requested width in cells.
    pub columns: u32,
    /// Requested height in cells.
    pub rows: u32,
}

/// Result of fitting a cell sub-box onto a source image.
///
/// `skip_cols`/`skip_rows` shift the destination grid position;
/// `num_cols`/`num_rows` are the surviving extent after clipping. The source
/// rectangle is in image pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellImageFit {
    /// Source rectangle x in image pixels.
    pub src_x: f32,
    /// Source rectangle y in image pixels.
    pub src_y: f32,
    /// Source rectangle width in image pixels.
    pub src_width: f32,
    /// Source rectangle height in image pixels.
    pub src_height: f32,
    /// Whole destination columns clipped off the left.
    pub skip_cols: u32,
    /// Whole destination rows clipped off the top.
    pub skip_rows: u32,
    /// Destination extent in columns after clipping.
    pub num_cols: u32,
    /// Destination extent in rows after clipping.
    pub num_rows: u32,
    /// Sub-cell pixel offset into the first destination column.
    pub cell_x_offset: u32,
    /// Sub-cell pixel offset into the first destination row.
    pub cell_y_offset: u32,
}

/// Number of cells needed to cover `px` pixels at `cell_px` per cell.
#[inline]
#[must_use]
pub fn cells_for_pixels(px: u32, cell_px: u32) -> u32 {
    if cell_px == 0 {
        return 0;
    }
    px.div_ceil(cell_px)
}

/// Fit a sub-box of a virtual placement onto the source image.
///
/// The image is scaled uniformly (aspect preserved) to fit a box of
/// `img_columns` x `img_rows` cells and centered along the slack axis. The
/// requested destination sub-box is then mapped back to source pixels via the
/// inverse transform, and clipped: leading empty cells become a destination
/// shift plus a sub-cell offset, trailing overflow past the image edge trims
/// whole redundant cells.
///
/// Returns `None` when the clip consumes the entire requested extent, i.e.
/// the placement would show nothing.
#[must_use]
pub fn fit_cell_image(
    img_width: u32,
    img_height: u32,
    img_columns: u32,
    img_rows: u32,
    cell: CellSize,
    req: CellBox,
) -> Option<CellImageFit> {
    if img_width == 0
        || img_height == 0
        || img_columns == 0
        || img_rows == 0
        || cell.width == 0
        || cell.height == 0
        || req.columns == 0
        || req.rows == 0
    {
        return None;
    }

    let box_width = (img_columns * cell.width) as f64;
    let box_height = (img_rows * cell.height) as f64;
    let w = img_width as f64;
    let h = img_height as f64;

    // Decide which axis limits the uniform scale. Comparing
    // w * box_height vs h * box_width avoids the division.
    let (scale, x_offset, y_offset) = if w * box_height >= h * box_width {
        // Image is wider than the box aspect: fit to width, center vertically.
        let scale = box_width / w;
        (scale, 0.0, (box_height - h * scale) / 2.0)
    } else {
        // Fit to height, center horizontally.
        let scale = box_height / h;
        (scale, (box_width - w * scale) / 2.0, 0.0)
    };

    // Requested destination sub-box in pixel units.
    let dst_x = (req.img_col * cell.width) as f64;
    let dst_y = (req.img_row * cell.height) as f64;
    let dst_w = (req.columns * cell.width) as f64;
    let dst_h = (req.rows * cell.height) as f64;

    // Inverse affine transform into source image pixels.
    let mut src_x = (dst_x - x_offset) / scale;
    let mut src_y = (dst_y - y_offset) / scale;
    let mut src_w = dst_w / scale;
    let mut src_h = dst_h / scale;

    let mut num_cols = req.columns;
    let mut num_rows = req.rows;
    let mut skip_cols = 0u32;
    let mut skip_rows = 0u32;
    let mut cell_x_offset = 0u32;
    let mut cell_y_offset = 0u32;

    // Clip the top-left: a negative source coordinate means the leading part
    // of the requested box lies in the centering margin.
    if src_x < 0.0 {
        let overflow_dst = x_offset - dst_x;
        skip_cols = (overflow_dst / cell.width as f64) as u32;
        if skip_cols >= num_cols {
            return None;
        }
        cell_x_offset = (overflow_dst - (skip_cols * cell.width) as f64) as u32;
        num_cols -= skip_cols;
        src_w += src_x;
        src_x = 0.0;
    }
    if src_y < 0.0 {
        let overflow_dst = y_offset - dst_y;
        skip_rows = (overflow_dst / cell.height as f64) as u32;
        if skip_rows >= num_rows {
            return None;
        }
        cell_y_offset = (overflow_dst - (skip_rows * cell.height) as f64) as u32;
        num_rows -= skip_rows;
        src_h += src_y;
        src_y = 0.0;
    }

    // Clip the bottom-right: overflow past the image's true extent converts
    // to whole redundant destination cells.
    if src_x + src_w > w {
        let dst_overflow = (src_x + src_w - w) * scale;
        let redundant = (dst_overflow / cell.width as f64) as u32;
        if redundant >= num_cols {
            return None;
        }
        num_cols -= redundant;
        src_w = w - src_x;
    }
    if src_y + src_h > h {
        let dst_overflow = (src_y + src_h - h) * scale;
        let redundant = (dst_overflow / cell.height as f64) as u32;
        if redundant >= num_rows {
            return None;
        }
        num_rows -= redundant;
        src_h = h - src_y;
    }

    if src_w <= 0.0 || src_h <= 0.0 {
        return None;
    }

    Some(CellImageFit {
        src_x: src_x as f32,
        src_y: src_y as f32,
        src_width: src_w as f32,
        src_height: src_h as f32,
        skip_cols,
        skip_rows,
        num_cols,
        num_rows,
        cell_x_offset,
        cell_y_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CELL: CellSize = CellSize::new(10, 10);

    #[test]
    fn test_gl_conversions() {
        assert!((gl_pos_x(0, 100) - -1.0).abs() < f32::EPSILON);
        assert!((gl_pos_x(50, 100) - 0.0).abs() < f32::EPSILON);
        assert!((gl_pos_y(0, 100) - 1.0).abs() < f32::EPSILON);
        assert!((gl_pos_y(100, 100) - -1.0).abs() < f32::EPSILON);
        assert!((gl_size(50, 100) - 1.0).abs() < f32::EPSILON);
        // Signed positions map past the viewport edge without wrapping.
        assert!(gl_pos_y(-10, 100) > 1.0);
    }

    #[test]
    fn test_cells_for_pixels() {
        assert_eq!(cells_for_pixels(100, 10), 10);
        assert_eq!(cells_for_pixels(101, 10), 11);
        assert_eq!(cells_for_pixels(0, 10), 0);
        assert_eq!(cells_for_pixels(9, 10), 1);
    }

    #[test]
    fn test_fit_exact_box() {
        // 100x50 image in a 10x5 cell box at 10x10 cells: scale 1, no offsets.
        let fit = fit_cell_image(
            100,
            50,
            10,
            5,
            CELL,
            CellBox {
                img_col: 0,
                img_row: 0,
                columns: 10,
                rows: 5,
            },
        )
        .unwrap();
        assert_eq!(fit.num_cols, 10);
        assert_eq!(fit.num_rows, 5);
        assert_eq!(fit.skip_cols, 0);
        assert_eq!(fit.skip_rows, 0);
        assert!((fit.src_x - 0.0).abs() < 1e-6);
        assert!((fit.src_y - 0.0).abs() < 1e-6);
        assert!((fit.src_width - 100.0).abs() < 1e-6);
        assert!((fit.src_height - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_fit_sub_box() {
        // Right half of the same image.
        let fit = fit_cell_image(
            100,
            50,
            10,
            5,
            CELL,
            CellBox {
                img_col: 5,
                img_row: 0,
                columns: 5,
                rows: 5,
            },
        )
        .unwrap();
        assert_eq!(fit.num_cols, 5);
        assert!((fit.src_x - 50.0).abs() < 1e-6);
        assert!((fit.src_width - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_fit_left_margin_clip() {
        // 50x100 image in a 10x10 cell box: fit to height, centered with a
        // 25px margin on each side. Requesting the full box clips 2 whole
        // columns and leaves a 5px sub-cell offset.
        let fit = fit_cell_image(
            50,
            100,
            10,
            10,
            CELL,
            CellBox {
                img_col: 0,
                img_row: 0,
                columns: 10,
                rows: 10,
            },
        )
        .unwrap();
        assert_eq!(fit.skip_cols, 2);
        assert_eq!(fit.cell_x_offset, 5);
        assert!(fit.cell_x_offset < CELL.width);
        // The mirrored right margin trims 2 more whole columns.
        assert_eq!(fit.num_cols, 6);
        assert!((fit.src_x - 0.0).abs() < 1e-6);
        assert!((fit.src_width - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_fit_right_overflow_trims_whole_cells() {
        // Same centered image: requesting only the rightmost 2 columns of the
        // box lands entirely in the margin past the image.
        let fit = fit_cell_image(
            50,
            100,
            10,
            10,
            CELL,
            CellBox {
                img_col: 8,
                img_row: 0,
                columns: 2,
                rows: 10,
            },
        );
        assert!(fit.is_none());
    }

    #[test]
    fn test_fit_entirely_out_of_bounds() {
        // The left 2 columns of the centered image are pure margin.
        let fit = fit_cell_image(
            50,
            100,
            10,
            10,
            CELL,
            CellBox {
                img_col: 0,
                img_row: 0,
                columns: 2,
                rows: 10,
            },
        );
        assert!(fit.is_none());
    }

    #[test]
    fn test_fit_degenerate_inputs() {
        let req = CellBox {
            img_col: 0,
            img_row: 0,
            columns: 1,
            rows: 1,
        };
        assert!(fit_cell_image(0, 50, 10, 5, CELL, req).is_none());
        assert!(fit_cell_image(100, 50, 0, 5, CELL, req).is_none());
        assert!(fit_cell_image(100, 50, 10, 5, CellSize::new(0, 10), req).is_none());
    }
}
