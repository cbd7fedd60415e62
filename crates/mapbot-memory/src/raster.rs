//! Occupancy snapshot → PNG rasterizer.
//!
//! One grid cell becomes one 8-bit grayscale pixel, with pixel `(x, y)` taken
//! from `grid[x][y]`:
//!
//! | cell value     | pixel           |
//! |----------------|-----------------|
//! | `1` occupied   | `0` (black)     |
//! | `0` free       | `255` (white)   |
//! | anything else  | `128` (gray)    |

use std::io::Cursor;

use image::{GrayImage, ImageFormat, Luma};
use mapbot_types::MapError;

pub const OCCUPIED_PIXEL: u8 = 0;
pub const FREE_PIXEL: u8 = 255;
pub const UNKNOWN_PIXEL: u8 = 128;

fn cell_to_pixel(value: Option<i8>) -> u8 {
    match value {
        Some(1) => OCCUPIED_PIXEL,
        Some(0) => FREE_PIXEL,
        _ => UNKNOWN_PIXEL,
    }
}

/// Rasterize a ternary grid into an in-memory grayscale image.
///
/// Cells missing from a ragged `grid` are drawn as unknown.
pub fn rasterize(grid: &[Vec<i8>], width: usize, height: usize) -> Result<GrayImage, MapError> {
    let (w, h) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(MapError::Export(format!(
                "cannot rasterize a {width}x{height} grid"
            )));
        }
    };

    Ok(GrayImage::from_fn(w, h, |x, y| {
        let value = grid
            .get(x as usize)
            .and_then(|column| column.get(y as usize))
            .copied();
        Luma([cell_to_pixel(value)])
    }))
}

/// Rasterize and PNG-encode a ternary grid.
pub fn render_png(grid: &[Vec<i8>], width: usize, height: usize) -> Result<Vec<u8>, MapError> {
    let img = rasterize(grid, width, height)?;
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| MapError::Export(format!("PNG encoding failed: {e}")))?;
    Ok(buf.into_inner())
}
