use serde::{Deserialize, Serialize};

use crate::screen::grid::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalColor {
    // Standard 16 colors
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    BrightBlack,
    BrightRed,
    BrightGreen,
    BrightYellow,
    BrightBlue,
    BrightMagenta,
    BrightCyan,
    BrightWhite,

    // 256-color mode
    Indexed(u8),

    // True color (RGB)
    Rgb { r: u8, g: u8, b: u8 },

    // Default terminal colors
    #[default]
    DefaultFg,
    DefaultBg,
}

const NAMED: [TerminalColor; 16] = [
    TerminalColor::Black,
    TerminalColor::Red,
    TerminalColor::Green,
    TerminalColor::Yellow,
    TerminalColor::Blue,
    TerminalColor::Magenta,
    TerminalColor::Cyan,
    TerminalColor::White,
    TerminalColor::BrightBlack,
    TerminalColor::BrightRed,
    TerminalColor::BrightGreen,
    TerminalColor::BrightYellow,
    TerminalColor::BrightBlue,
    TerminalColor::BrightMagenta,
    TerminalColor::BrightCyan,
    TerminalColor::BrightWhite,
];

impl TerminalColor {
    /// Map a palette index to a color; 0-15 are the named ANSI colors.
    pub fn from_index(index: u8) -> Self {
        match NAMED.get(index as usize) {
            Some(named) => *named,
            None => TerminalColor::Indexed(index),
        }
    }

    /// Convert an SGR foreground/background code (30-37, 40-47, 90-97, 100-107)
    /// to the named color it selects.
    pub fn from_sgr_code(code: u16) -> Option<Self> {
        let index = match code {
            30..=37 => code - 30,
            40..=47 => code - 40,
            90..=97 => code - 90 + 8,
            100..=107 => code - 100 + 8,
            _ => return None,
        };
        Some(NAMED[index as usize])
    }

    /// Position of a named color in the 16-color table.
    pub fn ansi_index(self) -> Option<usize> {
        NAMED.iter().position(|named| *named == self)
    }
}

/// Explicit color table handed to whatever draws the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Palette {
    pub foreground: [u8; 3],
    pub background: [u8; 3],
    pub ansi: [[u8; 3]; 16],
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            foreground: [220, 225, 235],
            background: [15, 15, 20],
            ansi: [
                [40, 42, 54],    // Black
                [255, 85, 85],   // Red
                [80, 200, 120],  // Green
                [241, 250, 140], // Yellow
                [100, 160, 255], // Blue
                [255, 121, 198], // Magenta
                [140, 220, 240], // Cyan
                [248, 248, 242], // White
                [98, 114, 164],  // Bright Black
                [255, 110, 110], // Bright Red
                [105, 255, 148], // Bright Green
                [255, 255, 165], // Bright Yellow
                [130, 185, 255], // Bright Blue
                [255, 146, 223], // Bright Magenta
                [164, 255, 255], // Bright Cyan
                [255, 255, 255], // Bright White
            ],
        }
    }
}

impl Palette {
    /// Resolve a logical color to RGB.
    pub fn rgb(&self, color: TerminalColor) -> [u8; 3] {
        match color {
            TerminalColor::DefaultFg => self.foreground,
            TerminalColor::DefaultBg => self.background,
            TerminalColor::Indexed(idx) => self.indexed_to_rgb(idx),
            TerminalColor::Rgb { r, g, b } => [r, g, b],
            named => named
                .ansi_index()
                .map_or(self.foreground, |idx| self.ansi[idx]),
        }
    }

    /// Foreground and background of a cell after applying reverse video.
    pub fn cell_colors(&self, cell: &Cell) -> ([u8; 3], [u8; 3]) {
        let fg = self.rgb(cell.fg_color);
        let bg = self.rgb(cell.bg_color);
        if cell.attrs.reverse {
            (bg, fg)
        } else {
            (fg, bg)
        }
    }

    fn indexed_to_rgb(&self, index: u8) -> [u8; 3] {
        const CUBE_LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];

        match index {
            // Standard 16 colors (0-15)
            0..=15 => self.ansi[index as usize],

            // 216 color cube (16-231)
            16..=231 => {
                let index = index - 16;
                [
                    CUBE_LEVELS[(index / 36) as usize],
                    CUBE_LEVELS[((index % 36) / 6) as usize],
                    CUBE_LEVELS[(index % 6) as usize],
                ]
            }

            // Grayscale ramp (232-255)
            232..=255 => {
                let gray = 8 + (index - 232) * 10;
                [gray, gray, gray]
            }
        }
    }
}
