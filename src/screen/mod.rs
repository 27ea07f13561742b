pub mod colors;
pub mod emulator;
pub mod grid;
pub mod parser;

pub use colors::{Palette, TerminalColor};
pub use emulator::TerminalEmulator;
pub use grid::{Cell, CellAttributes, Cursor, Grid, Modes, Pen, ScreenBuffer, TermSize};
pub use parser::{Params, Parser, Perform};
