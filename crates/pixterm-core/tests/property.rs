//! Property-based tests for id allocation, derived rectangles, and scroll
//! behavior.

use std::time::Instant;

use proptest::prelude::*;

use pixterm_core::geometry::{fit_cell_image, CellBox, CellSize};
use pixterm_core::image::next_id;
use pixterm_core::{
    DecodedImage, GraphicsManager, ImageRef, PutOptions, ScrollData, TransmitOptions,
};

const CELL: CellSize = CellSize::new(10, 10);

proptest! {
    /// Allocated ids are never zero, from any counter state, including the
    /// wraparound at `u32::MAX`.
    #[test]
    fn allocated_ids_are_never_zero(start in any::<u32>(), steps in 1usize..64) {
        let mut counter = start;
        for _ in 0..steps {
            prop_assert_ne!(next_id(&mut counter), 0);
        }
    }

    /// The derived source rectangle is a pure function of the ref and image
    /// dimensions: recomputing it never changes it.
    #[test]
    fn src_rect_update_is_idempotent(
        src_x in 0u32..500,
        src_y in 0u32..500,
        src_w in 1u32..500,
        src_h in 1u32..500,
        img_w in 1u32..1000,
        img_h in 1u32..1000,
    ) {
        let mut r = ImageRef {
            src_x: src_x as f32,
            src_y: src_y as f32,
            src_width: src_w as f32,
            src_height: src_h as f32,
            ..ImageRef::default()
        };
        r.update_src_rect(img_w, img_h);
        let first = r.src_rect;
        r.update_src_rect(img_w, img_h);
        prop_assert_eq!(first, r.src_rect);
    }

    /// Scrolling down by N and back up by N restores a placement's position
    /// and leaves its source rectangle untouched (plain scroll, no margins).
    #[test]
    fn scroll_round_trip_is_identity(start_row in -50i32..200, amt in 1i32..50) {
        let mut mgr = GraphicsManager::new();
        mgr.transmit(
            TransmitOptions { client_id: 1, client_number: 0 },
            DecodedImage {
                pixels: vec![0; 100 * 50 * 4],
                width: 100,
                height: 50,
                is_opaque: false,
            },
            Instant::now(),
        ).unwrap();
        let ref_id = mgr.put(
            PutOptions {
                image_id: 1,
                start_row,
                ..PutOptions::default()
            },
            CELL,
            Instant::now(),
        ).unwrap();
        let before = *mgr.image_by_client_id(1).unwrap().get_ref(ref_id).unwrap();

        let down = ScrollData {
            amt,
            limit: i32::MIN / 2,
            margin_top: 0,
            margin_bottom: 0,
            has_margins: false,
        };
        mgr.scroll(down);
        mgr.scroll(ScrollData { amt: -amt, ..down });

        let after = mgr.image_by_client_id(1).unwrap().get_ref(ref_id).unwrap();
        prop_assert_eq!(after.start_row, before.start_row);
        prop_assert_eq!(after.src_rect, before.src_rect);
        prop_assert_eq!(after.effective_num_rows, before.effective_num_rows);
    }

    /// Whatever the fit computes, the sub-cell offsets stay below one cell
    /// and the surviving extent never exceeds the request.
    #[test]
    fn cell_image_fit_is_bounded(
        img_w in 1u32..400,
        img_h in 1u32..400,
        cols in 1u32..40,
        rows in 1u32..40,
        req_col in 0u32..40,
        req_row in 0u32..40,
        req_cols in 1u32..40,
        req_rows in 1u32..40,
    ) {
        let req = CellBox {
            img_col: req_col,
            img_row: req_row,
            columns: req_cols,
            rows: req_rows,
        };
        if let Some(fit) = fit_cell_image(img_w, img_h, cols, rows, CELL, req) {
            prop_assert!(fit.cell_x_offset < CELL.width);
            prop_assert!(fit.cell_y_offset < CELL.height);
            prop_assert!(fit.num_cols <= req.columns);
            prop_assert!(fit.num_rows <= req.rows);
            prop_assert!(fit.num_cols > 0);
            prop_assert!(fit.num_rows > 0);
            prop_assert!(fit.src_x >= 0.0);
            prop_assert!(fit.src_y >= 0.0);
            prop_assert!(fit.src_x + fit.src_width <= img_w as f32 + 1e-3);
            prop_assert!(fit.src_y + fit.src_height <= img_h as f32 + 1e-3);
        }
    }
}
