//! Occupancy-grid rendering of a sheet region for the vision model.
//!
//! Each cell becomes a filled block coloured by content (empty, text, numeric);
//! merged regions are outlined so the model can see spans it cannot read from text.

use crate::error::DegradationReason;
use crate::model::{CellValue, MergedCellRange, Rows};
use crate::patterns;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use std::io::Cursor;

const CELL_WIDTH: u32 = 48;
const CELL_HEIGHT: u32 = 20;
pub const MAX_RENDER_ROWS: usize = 10;
pub const MAX_RENDER_COLS: usize = 15;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const GRID: Rgb<u8> = Rgb([210, 210, 210]);
const TEXT_CELL: Rgb<u8> = Rgb([120, 160, 230]);
const NUMERIC_CELL: Rgb<u8> = Rgb([110, 190, 120]);
const MERGE_OUTLINE: Rgb<u8> = Rgb([220, 50, 50]);

/// Render the top-left region of `rows` as a PNG.
pub fn render_grid(rows: &Rows, merged: &[MergedCellRange]) -> Result<Vec<u8>, DegradationReason> {
    let height = rows.len().min(MAX_RENDER_ROWS);
    let width = rows
        .iter()
        .take(height)
        .map(Vec::len)
        .max()
        .unwrap_or(0)
        .min(MAX_RENDER_COLS);
    if height == 0 || width == 0 {
        return Err(DegradationReason::NoResult("nothing to render".to_string()));
    }

    let mut img = RgbImage::from_pixel(width as u32 * CELL_WIDTH, height as u32 * CELL_HEIGHT, BACKGROUND);

    for (r, row) in rows.iter().take(height).enumerate() {
        for c in 0..width {
            let fill = match row.get(c) {
                Some(cell) if patterns::is_numeric(cell) => NUMERIC_CELL,
                Some(cell) if !cell.is_empty() => TEXT_CELL,
                _ => BACKGROUND,
            };
            fill_cell(&mut img, r as u32, c as u32, fill);
        }
    }

    for region in merged {
        if region.min_row >= height || region.min_col >= width {
            continue;
        }
        let max_row = region.max_row.min(height - 1) as u32;
        let max_col = region.max_col.min(width - 1) as u32;
        outline(
            &mut img,
            region.min_col as u32 * CELL_WIDTH,
            region.min_row as u32 * CELL_HEIGHT,
            (max_col + 1) * CELL_WIDTH - 1,
            (max_row + 1) * CELL_HEIGHT - 1,
        );
    }

    let mut png = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
        .map_err(|e| DegradationReason::NoResult(format!("png encoding failed: {}", e)))?;
    Ok(png)
}

fn fill_cell(img: &mut RgbImage, row: u32, col: u32, fill: Rgb<u8>) {
    let (x0, y0) = (col * CELL_WIDTH, row * CELL_HEIGHT);
    for y in y0..y0 + CELL_HEIGHT {
        for x in x0..x0 + CELL_WIDTH {
            let border = x == x0 || y == y0 || x == x0 + CELL_WIDTH - 1 || y == y0 + CELL_HEIGHT - 1;
            img.put_pixel(x, y, if border { GRID } else { fill });
        }
    }
}

fn outline(img: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32) {
    for x in x0..=x1 {
        for t in 0..2 {
            img.put_pixel(x, (y0 + t).min(y1), MERGE_OUTLINE);
            img.put_pixel(x, y1.saturating_sub(t).max(y0), MERGE_OUTLINE);
        }
    }
    for y in y0..=y1 {
        for t in 0..2 {
            img.put_pixel((x0 + t).min(x1), y, MERGE_OUTLINE);
            img.put_pixel(x1.saturating_sub(t).max(x0), y, MERGE_OUTLINE);
        }
    }
}

/// Share of rendered cells holding a value; used in the vision prompt.
pub fn occupancy(rows: &Rows) -> f64 {
    let cells: Vec<&CellValue> = rows
        .iter()
        .take(MAX_RENDER_ROWS)
        .flat_map(|r| r.iter().take(MAX_RENDER_COLS))
        .collect();
    if cells.is_empty() {
        return 0.0;
    }
    cells.iter().filter(|c| !c.is_empty()).count() as f64 / cells.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_png() {
        let rows = vec![
            vec![CellValue::from("总表"), CellValue::Empty],
            vec![CellValue::from("收入"), CellValue::from(100i64)],
        ];
        let merged = vec![MergedCellRange::new(0, 0, 0, 1)];

        let png = render_grid(&rows, &merged).unwrap();
        assert_eq!(&png[..4], &[0x89, b'P', b'N', b'G']);

        let decoded = image::load_from_memory(&png).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (2 * CELL_WIDTH, 2 * CELL_HEIGHT));
        assert_eq!(*decoded.get_pixel(CELL_WIDTH + 10, CELL_HEIGHT + 10), NUMERIC_CELL);
        assert_eq!(*decoded.get_pixel(0, 0), MERGE_OUTLINE);
    }

    #[test]
    fn test_empty_region_abstains() {
        let err = render_grid(&Vec::new(), &[]).unwrap_err();
        assert_eq!(err.kind(), "no_result");
    }

    #[test]
    fn test_occupancy() {
        let rows = vec![vec![CellValue::from("a"), CellValue::Empty]];
        assert_eq!(occupancy(&rows), 0.5);
    }
}
