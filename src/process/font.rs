//! Bitmap fonts for text overlays.
//!
//! The built-in face is a fixed 5x7 ASCII font (rows top to bottom, bit 4 is
//! the leftmost column). A glyph-sheet PNG can replace it: 16 columns by 6
//! rows of equally sized cells covering ASCII 32..=127, lit where luma > 127.

use anyhow::{anyhow, Result};
use image::GrayImage;
use std::path::Path;

pub const GLYPH_WIDTH: u32 = 5;
pub const GLYPH_HEIGHT: u32 = 7;

const SHEET_COLUMNS: u32 = 16;
const SHEET_ROWS: u32 = 6;
const SHEET_FIRST: u32 = 32;

fn builtin_glyph(c: char) -> Option<[u8; 7]> {
    let rows = match c {
        ' ' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        '!' => [0x04, 0x04, 0x04, 0x04, 0x04, 0x00, 0x04],
        '"' => [0x0A, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00],
        '#' => [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        '\'' => [0x04, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '*' => [0x00, 0x04, 0x15, 0x0E, 0x15, 0x04, 0x00],
        '+' => [0x00, 0x04, 0x04, 0x1F, 0x04, 0x04, 0x00],
        ',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        ';' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x04, 0x08],
        '<' => [0x02, 0x04, 0x08, 0x10, 0x08, 0x04, 0x02],
        '=' => [0x00, 0x00, 0x1F, 0x00, 0x1F, 0x00, 0x00],
        '>' => [0x08, 0x04, 0x02, 0x01, 0x02, 0x04, 0x08],
        '?' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
        '@' => [0x0E, 0x11, 0x01, 0x0D, 0x15, 0x15, 0x0E],
        'A' => [0x0E, 0x11, 0x11, 0x11, 0x1F, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1C, 0x12, 0x11, 0x11, 0x11, 0x12, 0x1C],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '[' => [0x0E, 0x08, 0x08, 0x08, 0x08, 0x08, 0x0E],
        '\\' => [0x00, 0x10, 0x08, 0x04, 0x02, 0x01, 0x00],
        ']' => [0x0E, 0x02, 0x02, 0x02, 0x02, 0x02, 0x0E],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '|' => [0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        '\u{b0}' => [0x0C, 0x12, 0x12, 0x0C, 0x00, 0x00, 0x00],
        _ => return None,
    };
    Some(rows)
}

/// Rows for `c` in the built-in face. Lowercase letters render as uppercase
/// and anything else unknown renders as `?`.
pub fn glyph(c: char) -> [u8; 7] {
    builtin_glyph(c.to_ascii_uppercase())
        .or_else(|| builtin_glyph('?'))
        .unwrap_or([0; 7])
}

#[derive(Clone, Debug, Default)]
pub enum FontFace {
    #[default]
    Builtin,
    Sheet {
        sheet: GrayImage,
        cell_width: u32,
        cell_height: u32,
    },
}

impl FontFace {
    /// Loads a glyph sheet PNG.
    pub fn load_sheet(path: &Path) -> Result<Self> {
        let sheet = image::open(path)
            .map_err(|e| anyhow!("font sheet {}: {}", path.display(), e))?
            .to_luma8();
        let cell_width = sheet.width() / SHEET_COLUMNS;
        let cell_height = sheet.height() / SHEET_ROWS;
        if cell_width == 0 || cell_height == 0 {
            return Err(anyhow!(
                "font sheet {} is too small ({}x{}) for a {}x{} grid",
                path.display(),
                sheet.width(),
                sheet.height(),
                SHEET_COLUMNS,
                SHEET_ROWS
            ));
        }
        Ok(Self::Sheet {
            sheet,
            cell_width,
            cell_height,
        })
    }

    /// Glyph cell size in font pixels, before scaling.
    pub fn cell(&self) -> (u32, u32) {
        match self {
            Self::Builtin => (GLYPH_WIDTH, GLYPH_HEIGHT),
            Self::Sheet {
                cell_width,
                cell_height,
                ..
            } => (*cell_width, *cell_height),
        }
    }

    /// Horizontal distance between glyph origins.
    pub fn advance(&self) -> u32 {
        self.cell().0 + 1
    }

    pub fn line_height(&self) -> u32 {
        self.cell().1 + 2
    }

    pub fn is_lit(&self, c: char, x: u32, y: u32) -> bool {
        match self {
            Self::Builtin => {
                if x >= GLYPH_WIDTH || y >= GLYPH_HEIGHT {
                    return false;
                }
                glyph(c)[y as usize] & (0x10 >> x) != 0
            }
            Self::Sheet {
                sheet,
                cell_width,
                cell_height,
            } => {
                if x >= *cell_width || y >= *cell_height {
                    return false;
                }
                let code = c as u32;
                let index = if (SHEET_FIRST..SHEET_FIRST + SHEET_COLUMNS * SHEET_ROWS).contains(&code) {
                    code - SHEET_FIRST
                } else {
                    '?' as u32 - SHEET_FIRST
                };
                let col = index % SHEET_COLUMNS;
                let row = index / SHEET_COLUMNS;
                sheet.get_pixel(col * cell_width + x, row * cell_height + y).0[0] > 127
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercase_maps_to_uppercase() {
        assert_eq!(glyph('a'), glyph('A'));
        assert_eq!(glyph('z'), glyph('Z'));
    }

    #[test]
    fn unknown_characters_render_as_question_mark() {
        assert_eq!(glyph('~'), glyph('?'));
        assert_eq!(glyph('\u{2603}'), glyph('?'));
    }

    #[test]
    fn builtin_bits_are_left_aligned() {
        let face = FontFace::Builtin;
        // 'T' top row is fully lit, second row only the middle column
        for x in 0..5 {
            assert!(face.is_lit('T', x, 0));
        }
        assert!(face.is_lit('T', 2, 1));
        assert!(!face.is_lit('T', 0, 1));
        assert!(!face.is_lit('T', 5, 0));
    }

    #[test]
    fn glyph_sheet_cells_are_addressed_by_code() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("font.png");
        let mut sheet = GrayImage::new(16 * 4, 6 * 4);
        // light the top-left pixel of 'A' (code 65, index 33 -> col 1, row 2)
        sheet.put_pixel(4, 8, image::Luma([255]));
        sheet.save(&path)?;

        let face = FontFace::load_sheet(&path)?;
        assert_eq!(face.cell(), (4, 4));
        assert!(face.is_lit('A', 0, 0));
        assert!(!face.is_lit('B', 0, 0));
        Ok(())
    }

    #[test]
    fn tiny_sheet_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tiny.png");
        GrayImage::new(8, 8).save(&path)?;
        assert!(FontFace::load_sheet(&path).is_err());
        Ok(())
    }
}
