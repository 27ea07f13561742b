// VT100/ANSI terminal emulator: applies parsed sequences to the screen buffer

use std::sync::Arc;

use tracing::{debug, trace};

use crate::screen::colors::TerminalColor;
use crate::screen::grid::{Cursor, Grid, Modes, Pen, ScreenBuffer, TermSize};
use crate::screen::parser::{Params, ParamsIter, Parser, Perform};

// Separate performer to avoid borrowing issues with the parser
struct ScreenPerformer<'a> {
    screen: &'a mut ScreenBuffer,
    title: &'a mut String,
    bell: &'a mut bool,
    replies: &'a mut Vec<u8>,
}

/// Owns the live screen and the parser state that feeds it.
///
/// Only the emulator mutates the buffer; everything else reads the shared
/// [`Grid`] returned by [`TerminalEmulator::snapshot`].
pub struct TerminalEmulator {
    parser: Parser,
    screen: ScreenBuffer,
    title: String,
    bell: bool,
    replies: Vec<u8>,
    snapshot: Option<Arc<Grid>>,
}

impl TerminalEmulator {
    pub fn new(size: TermSize) -> Self {
        Self {
            parser: Parser::new(),
            screen: ScreenBuffer::new(size),
            title: String::new(),
            bell: false,
            replies: Vec::new(),
            snapshot: None,
        }
    }

    /// Apply a chunk of child output. Sequences split across chunks are
    /// completed by later calls.
    pub fn feed(&mut self, data: &[u8]) {
        let mut performer = ScreenPerformer {
            screen: &mut self.screen,
            title: &mut self.title,
            bell: &mut self.bell,
            replies: &mut self.replies,
        };
        self.parser.advance(&mut performer, data);
    }

    pub fn resize(&mut self, size: TermSize) {
        debug!("Resizing screen to {}x{}", size.cols, size.rows);
        self.screen.resize(size);
    }

    pub fn size(&self) -> TermSize {
        self.screen.size()
    }

    /// Shared read-only copy of the screen, rebuilt only after changes.
    pub fn snapshot(&mut self) -> Arc<Grid> {
        match &self.snapshot {
            Some(grid) if !self.screen.is_dirty() => Arc::clone(grid),
            _ => {
                let grid = Arc::new(self.screen.snapshot());
                self.screen.clear_dirty();
                self.snapshot = Some(Arc::clone(&grid));
                grid
            }
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.screen.cursor()
    }

    pub fn modes(&self) -> Modes {
        self.screen.modes()
    }

    pub fn screen(&self) -> &ScreenBuffer {
        &self.screen
    }

    /// Window title set through OSC 0 or 2.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Whether BEL was received since the last call.
    pub fn take_bell(&mut self) -> bool {
        std::mem::take(&mut self.bell)
    }

    /// Bytes the terminal owes the child (status and attribute reports).
    pub fn take_replies(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.replies)
    }
}

fn param(params: &Params, index: usize) -> Option<u16> {
    params.iter().nth(index).map(|p| p[0])
}

/// Motion counts: missing or zero means one.
fn count(params: &Params, index: usize) -> u16 {
    param(params, index).filter(|&n| n > 0).unwrap_or(1)
}

fn to_u8(value: u16) -> u8 {
    u8::try_from(value).unwrap_or(u8::MAX)
}

/// Parse the color following SGR 38/48, in either `38;5;n` / `38;2;r;g;b`
/// form or the colon sub-parameter form (`38:2::r:g:b` included).
fn extended_color(param: &[u16], rest: &mut ParamsIter<'_>) -> Option<TerminalColor> {
    if param.len() > 1 {
        return match param[1] {
            5 => param.get(2).map(|&idx| TerminalColor::from_index(to_u8(idx))),
            2 => {
                let rgb = if param.len() >= 6 {
                    &param[3..6]
                } else {
                    param.get(2..5)?
                };
                Some(TerminalColor::Rgb {
                    r: to_u8(rgb[0]),
                    g: to_u8(rgb[1]),
                    b: to_u8(rgb[2]),
                })
            }
            _ => None,
        };
    }

    match rest.next()?[0] {
        5 => rest
            .next()
            .map(|p| TerminalColor::from_index(to_u8(p[0]))),
        2 => {
            let r = rest.next()?[0];
            let g = rest.next()?[0];
            let b = rest.next()?[0];
            Some(TerminalColor::Rgb {
                r: to_u8(r),
                g: to_u8(g),
                b: to_u8(b),
            })
        }
        _ => None,
    }
}

impl<'a> Perform for ScreenPerformer<'a> {
    fn print(&mut self, c: char) {
        self.screen.write_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' | 0x0B | 0x0C => self.screen.linefeed(),
            b'\r' => self.screen.carriage_return(),
            b'\t' => self.screen.tab(),
            0x08 => self.screen.backspace(),
            0x07 => *self.bell = true,
            _ => {}
        }
    }

    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, c: char) {
        if ignore {
            trace!("Dropping malformed CSI sequence ending in {:?}", c);
            return;
        }

        match intermediates {
            [] => {}
            [b'?'] => {
                match c {
                    'h' => self.set_private_modes(params, true),
                    'l' => self.set_private_modes(params, false),
                    _ => trace!("Unhandled private CSI {:?}", c),
                }
                return;
            }
            [b'>'] if c == 'c' => {
                self.replies.extend_from_slice(b"\x1b[>0;10;0c");
                return;
            }
            _ => {
                trace!("Unhandled CSI {:?} with intermediates {:?}", c, intermediates);
                return;
            }
        }

        match c {
            // Cursor movement
            'A' => self.screen.cursor_up(count(params, 0)),
            'B' | 'e' => self.screen.cursor_down(count(params, 0)),
            'C' | 'a' => self.screen.cursor_right(count(params, 0)),
            'D' => self.screen.cursor_left(count(params, 0)),
            'E' => {
                self.screen.cursor_down(count(params, 0));
                self.screen.carriage_return();
            }
            'F' => {
                self.screen.cursor_up(count(params, 0));
                self.screen.carriage_return();
            }
            'G' | '`' => self.screen.set_cursor_col(count(params, 0) - 1),
            'd' => self.screen.set_cursor_row(count(params, 0) - 1),
            'H' | 'f' => {
                // Cursor position
                let row = count(params, 0) - 1;
                let col = count(params, 1) - 1;
                self.screen.set_cursor(row, col);
            }
            's' => self.screen.save_cursor(),
            'u' => self.screen.restore_cursor(),

            // Screen clearing
            'J' => self.screen.erase_in_display(param(params, 0).unwrap_or(0)),
            'K' => self.screen.erase_in_line(param(params, 0).unwrap_or(0)),
            'X' => self.screen.erase_chars(count(params, 0)),

            // Line and character editing
            '@' => self.screen.insert_chars(count(params, 0)),
            'P' => self.screen.delete_chars(count(params, 0)),
            'L' => self.screen.insert_lines(count(params, 0)),
            'M' => self.screen.delete_lines(count(params, 0)),

            // Scrolling
            'S' => self.screen.scroll_up(count(params, 0)),
            'T' => self.screen.scroll_down(count(params, 0)),
            'r' => {
                let top = count(params, 0) - 1;
                let bottom = param(params, 1)
                    .filter(|&n| n > 0)
                    .unwrap_or(self.screen.rows())
                    - 1;
                if !self.screen.set_scroll_region(top, bottom) {
                    trace!("Ignoring scroll region {}..{}", top, bottom);
                }
            }

            // Character attributes (SGR)
            'm' => self.handle_sgr(params),

            // Reports
            'n' => match param(params, 0) {
                Some(5) => self.replies.extend_from_slice(b"\x1b[0n"),
                Some(6) => {
                    let cursor = self.screen.cursor();
                    let report = format!("\x1b[{};{}R", cursor.y + 1, cursor.x + 1);
                    self.replies.extend_from_slice(report.as_bytes());
                }
                _ => {}
            },
            'c' if param(params, 0).unwrap_or(0) == 0 => {
                self.replies.extend_from_slice(b"\x1b[?6c");
            }

            _ => {
                trace!("Unhandled CSI {:?}", c);
            }
        }
    }

    fn esc_dispatch(&mut self, intermediates: &[u8], ignore: bool, byte: u8) {
        if ignore {
            return;
        }
        if !intermediates.is_empty() {
            // Character set designation and friends: consumed, no effect
            trace!("Ignoring ESC {:?} {:?}", intermediates, byte as char);
            return;
        }

        match byte {
            b'7' => self.screen.save_cursor(),
            b'8' => self.screen.restore_cursor(),
            b'D' => self.screen.linefeed(),
            b'E' => self.screen.newline(),
            b'M' => self.screen.reverse_index(),
            b'c' => {
                debug!("Full terminal reset");
                self.screen.reset();
                self.title.clear();
            }
            _ => trace!("Unhandled ESC {:?}", byte as char),
        }
    }

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        match params {
            [b"0" | b"2", rest @ ..] => {
                *self.title = String::from_utf8_lossy(&rest.join(&b';')).into_owned();
            }
            _ => trace!("Unhandled OSC {:?}", params.first().map(|p| String::from_utf8_lossy(p))),
        }
    }
}

impl<'a> ScreenPerformer<'a> {
    fn set_private_modes(&mut self, params: &Params, enable: bool) {
        for param in params.iter() {
            match param[0] {
                1 => self.screen.set_application_cursor(enable),
                7 => self.screen.set_autowrap(enable),
                25 => self.screen.set_cursor_visible(enable),
                // Alternate screen, mouse reporting, bracketed paste, ...
                mode => trace!("Ignoring private mode {} ({})", mode, enable),
            }
        }
    }

    fn handle_sgr(&mut self, params: &Params) {
        let pen = self.screen.pen_mut();
        if params.is_empty() {
            *pen = Pen::default();
            return;
        }

        let mut iter = params.iter();
        while let Some(param) = iter.next() {
            match param[0] {
                // Reset
                0 => *pen = Pen::default(),

                // Attributes
                1 => pen.attrs.bold = true,
                3 => pen.attrs.italic = true,
                4 => pen.attrs.underline = true,
                5 | 6 => pen.attrs.blink = true,
                7 => pen.attrs.reverse = true,
                9 => pen.attrs.strikethrough = true,

                // Reset attributes
                22 => pen.attrs.bold = false,
                23 => pen.attrs.italic = false,
                24 => pen.attrs.underline = false,
                25 => pen.attrs.blink = false,
                27 => pen.attrs.reverse = false,
                29 => pen.attrs.strikethrough = false,

                // Foreground colors
                code @ (30..=37 | 90..=97) => {
                    if let Some(color) = TerminalColor::from_sgr_code(code) {
                        pen.fg = color;
                    }
                }
                39 => pen.fg = TerminalColor::DefaultFg,

                // Background colors
                code @ (40..=47 | 100..=107) => {
                    if let Some(color) = TerminalColor::from_sgr_code(code) {
                        pen.bg = color;
                    }
                }
                49 => pen.bg = TerminalColor::DefaultBg,

                // 256-color and RGB color modes
                38 => {
                    if let Some(color) = extended_color(param, &mut iter) {
                        pen.fg = color;
                    }
                }
                48 => {
                    if let Some(color) = extended_color(param, &mut iter) {
                        pen.bg = color;
                    }
                }

                _ => {
                    // Ignore unknown parameters
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::grid::{Cell, CellAttributes};

    fn emulator(rows: u16, cols: u16) -> TerminalEmulator {
        TerminalEmulator::new(TermSize::new(rows, cols).unwrap())
    }

    fn fed(input: &[u8]) -> TerminalEmulator {
        let mut term = emulator(24, 80);
        term.feed(input);
        term
    }

    #[test]
    fn test_hello_crlf() {
        let mut term = fed(b"Hello\r\n");
        assert_eq!(term.cursor(), Cursor { x: 0, y: 1 });

        let grid = term.snapshot();
        assert_eq!(grid.row_text(0), "Hello");
        assert!(grid.row(0).unwrap()[5..].iter().all(|c| *c == Cell::default()));
    }

    #[test]
    fn test_red_text_then_reset() {
        let mut term = fed(b"\x1b[31mRED\x1b[0m!");
        let grid = term.snapshot();
        for col in 0..3 {
            assert_eq!(grid.cell(0, col).unwrap().fg_color, TerminalColor::Red);
        }
        assert_eq!(grid.cell(0, 3).unwrap().ch, '!');
        assert_eq!(grid.cell(0, 3).unwrap().fg_color, TerminalColor::DefaultFg);
        assert_eq!(grid.cell(0, 4).unwrap().fg_color, TerminalColor::DefaultFg);
    }

    #[test]
    fn test_sgr_reset_restores_defaults() {
        let term = fed(b"\x1b[1;4;7;9;3;5;38;5;200;48;2;1;2;3m\x1b[0m");
        assert_eq!(*term.screen().pen(), Pen::default());

        let term = fed(b"\x1b[1;31;44m\x1b[m");
        assert_eq!(*term.screen().pen(), Pen::default());
    }

    #[test]
    fn test_sgr_applies_left_to_right() {
        let term = fed(b"\x1b[1;0m");
        assert!(!term.screen().pen().attrs.bold);

        let term = fed(b"\x1b[0;1m");
        assert!(term.screen().pen().attrs.bold);

        let term = fed(b"\x1b[31;32m");
        assert_eq!(term.screen().pen().fg, TerminalColor::Green);
    }

    #[test]
    fn test_sgr_attributes() {
        let term = fed(b"\x1b[1;4;7m");
        assert_eq!(
            term.screen().pen().attrs,
            CellAttributes {
                bold: true,
                underline: true,
                reverse: true,
                ..CellAttributes::default()
            }
        );

        let term = fed(b"\x1b[1;4;7m\x1b[22;24m");
        assert!(!term.screen().pen().attrs.bold);
        assert!(!term.screen().pen().attrs.underline);
        assert!(term.screen().pen().attrs.reverse);
    }

    #[test]
    fn test_sgr_extended_colors() {
        let term = fed(b"\x1b[38;5;196;48;5;3m");
        assert_eq!(term.screen().pen().fg, TerminalColor::Indexed(196));
        assert_eq!(term.screen().pen().bg, TerminalColor::Yellow);

        let term = fed(b"\x1b[38;2;10;20;30m");
        assert_eq!(term.screen().pen().fg, TerminalColor::Rgb { r: 10, g: 20, b: 30 });

        let term = fed(b"\x1b[48:2::1:2:3m\x1b[38:5:9m");
        assert_eq!(term.screen().pen().bg, TerminalColor::Rgb { r: 1, g: 2, b: 3 });
        assert_eq!(term.screen().pen().fg, TerminalColor::BrightRed);

        let term = fed(b"\x1b[92;101m");
        assert_eq!(term.screen().pen().fg, TerminalColor::BrightGreen);
        assert_eq!(term.screen().pen().bg, TerminalColor::BrightRed);
    }

    #[test]
    fn test_truncated_extended_color_is_harmless() {
        let term = fed(b"\x1b[38;2;10m\x1b[38m\x1b[38;5m");
        assert_eq!(term.screen().pen().fg, TerminalColor::DefaultFg);
    }

    #[test]
    fn test_cursor_positioning() {
        let term = fed(b"\x1b[5;10H");
        assert_eq!(term.cursor(), Cursor { x: 9, y: 4 });

        let term = fed(b"\x1b[H");
        assert_eq!(term.cursor(), Cursor { x: 0, y: 0 });

        let term = fed(b"\x1b[999;999H");
        assert_eq!(term.cursor(), Cursor { x: 79, y: 23 });

        let term = fed(b"\x1b[10;10H\x1b[2A\x1b[3D\x1b[0B\x1b[C");
        assert_eq!(term.cursor(), Cursor { x: 7, y: 8 });

        let term = fed(b"\x1b[3;3H\x1b[20G\x1b[7d");
        assert_eq!(term.cursor(), Cursor { x: 19, y: 6 });
    }

    #[test]
    fn test_erase_sequences() {
        let mut term = fed(b"one\r\ntwo\r\nthree\x1b[2;2H\x1b[K");
        assert_eq!(term.snapshot().text(), "one\nt\nthree");

        term.feed(b"\x1b[J");
        assert_eq!(term.snapshot().text(), "one\nt");

        term.feed(b"\x1b[2J");
        assert_eq!(term.snapshot().text(), "");
    }

    #[test]
    fn test_scroll_region_sequence() {
        let mut term = emulator(4, 4);
        term.feed(b"a\r\nb\r\nc\r\nd");
        term.feed(b"\x1b[2;3r");
        assert_eq!(term.cursor(), Cursor { x: 0, y: 0 });

        term.feed(b"\x1b[3;1H\n");
        assert_eq!(term.snapshot().text(), "a\nc\n\nd");

        term.feed(b"\x1b[r");
        assert_eq!(term.screen().scroll_region(), (0, 3));
    }

    #[test]
    fn test_save_restore_cursor() {
        let term = fed(b"\x1b[3;4H\x1b[31m\x1b7\x1b[H\x1b[0m\x1b8");
        assert_eq!(term.cursor(), Cursor { x: 3, y: 2 });
        assert_eq!(term.screen().pen().fg, TerminalColor::Red);

        let term = fed(b"\x1b[5;6H\x1b[s\x1b[H\x1b[u");
        assert_eq!(term.cursor(), Cursor { x: 5, y: 4 });
    }

    #[test]
    fn test_private_modes() {
        let term = fed(b"\x1b[?25l\x1b[?1h");
        assert!(!term.modes().cursor_visible);
        assert!(term.modes().application_cursor);

        let mut term = emulator(2, 3);
        term.feed(b"\x1b[?7labcdef");
        assert_eq!(term.snapshot().text(), "abf");

        let term = fed(b"\x1b[?1049h\x1b[?2004h\x1b[?1000h");
        assert_eq!(term.modes(), Modes::default());
    }

    #[test]
    fn test_status_reports() {
        let mut term = fed(b"\x1b[3;7H\x1b[6n\x1b[5n");
        assert_eq!(term.take_replies(), b"\x1b[3;7R\x1b[0n".to_vec());
        assert!(term.take_replies().is_empty());

        term.feed(b"\x1b[c");
        assert_eq!(term.take_replies(), b"\x1b[?6c".to_vec());
    }

    #[test]
    fn test_title_and_bell() {
        let mut term = fed(b"\x1b]0;kiosk;shell\x07\x07");
        assert_eq!(term.title(), "kiosk;shell");
        assert!(term.take_bell());
        assert!(!term.take_bell());
        assert_eq!(term.snapshot().text(), "");
    }

    #[test]
    fn test_full_reset() {
        let mut term = fed(b"\x1b]2;t\x07\x1b[31mabc\x1bc");
        assert_eq!(term.snapshot().text(), "");
        assert_eq!(term.title(), "");
        assert_eq!(*term.screen().pen(), Pen::default());
    }

    #[test]
    fn test_malformed_sequences_do_not_mutate() {
        let mut term = emulator(5, 10);
        term.feed(b"\x1b[1;2;3;4$q\x1b[?h\x1b[5?H\x1b#8\x1b[12\x18\x1bP1$r\x1b\\\x1b]52;c;Zm9v\x07");
        assert_eq!(term.snapshot().text(), "");
        assert_eq!(term.cursor(), Cursor { x: 0, y: 0 });
        assert_eq!(*term.screen().pen(), Pen::default());
    }

    #[test]
    fn test_unicode_text() {
        let mut term = fed("naïve ❯ λ".as_bytes());
        assert_eq!(term.snapshot().row_text(0), "naïve ❯ λ");
        assert_eq!(term.cursor(), Cursor { x: 9, y: 0 });
    }

    #[test]
    fn test_chunked_feed_matches_single_feed() {
        let input = "prompt$ \x1b[1;32mls\x1b[0m\r\n\x1b[2;5r\x1b[4;1Hé\x1b[38;2;1;2;3mX\x1b]0;t\x1b\\\
                     \x1b[?25l\x1b7\x1b[10;10H\x1b8\x1b[2K\x1b[@\x1b[P\x1bM\x1b[3Lé❯\r\n"
            .repeat(6)
            .into_bytes();

        let mut whole = emulator(6, 12);
        whole.feed(&input);
        let expected = whole.snapshot();

        for split in 0..input.len() {
            let mut term = emulator(6, 12);
            term.feed(&input[..split]);
            term.feed(&input[split..]);
            assert_eq!(term.snapshot(), expected, "split at {}", split);
        }

        for chunk in [1, 2, 3, 5, 7, 64] {
            let mut term = emulator(6, 12);
            for piece in input.chunks(chunk) {
                term.feed(piece);
            }
            assert_eq!(term.snapshot(), expected, "chunk size {}", chunk);
            assert_eq!(*term.screen().pen(), *whole.screen().pen());
        }
    }

    #[test]
    fn test_cursor_stays_in_bounds_for_arbitrary_input() {
        // Small xorshift generator keeps the test deterministic
        let mut state: u32 = 0x9E37_79B9;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        };

        let alphabet = b"\x1b[];?0123456789:;mHJKABCDrsuLM@PXST\r\n\x08\tx\x07\xc3\xa9";
        let mut term = emulator(7, 9);
        for round in 0..200 {
            let chunk: Vec<u8> = (0..(next() % 64))
                .map(|_| alphabet[next() as usize % alphabet.len()])
                .collect();
            term.feed(&chunk);
            if round % 50 == 49 {
                let rows = (next() % 10 + 1) as u16;
                let cols = (next() % 10 + 1) as u16;
                term.resize(TermSize::new(rows, cols).unwrap());
            }
            let size = term.size();
            let cursor = term.cursor();
            assert!(cursor.x < size.cols && cursor.y < size.rows);
            let grid = term.snapshot();
            assert_eq!(grid.rows(), size.rows);
            assert_eq!(grid.cols(), size.cols);
        }
    }

    #[test]
    fn test_snapshot_reused_until_change() {
        let mut term = fed(b"abc");
        let first = term.snapshot();
        let second = term.snapshot();
        assert!(Arc::ptr_eq(&first, &second));

        term.feed(b"\x1b[31m");
        assert!(Arc::ptr_eq(&first, &term.snapshot()));

        term.feed(b"d");
        let third = term.snapshot();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.row_text(0), "abc");
        assert_eq!(third.row_text(0), "abcd");
    }

    #[test]
    fn test_snapshot_follows_cursor_only_moves() {
        let mut term = fed(b"abc");
        let before = term.snapshot();
        assert_eq!(before.cursor(), Cursor { x: 3, y: 0 });

        term.feed(b"\x08\x08");
        let after = term.snapshot();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.cursor(), Cursor { x: 1, y: 0 });
        assert_eq!(after.row_text(0), "abc");

        for input in [&b"\x1b[10;20H"[..], b"\r", b"\x1b[2A", b"\t", b"\x1b8", b"\n"] {
            term.feed(input);
            assert_eq!(term.snapshot().cursor(), term.cursor(), "after {:?}", input);
        }

        let settled = term.snapshot();
        assert!(Arc::ptr_eq(&settled, &term.snapshot()));
    }

    #[test]
    fn test_resize_through_emulator() {
        let mut term = fed(b"hello\r\nworld");
        term.resize(TermSize::new(1, 3).unwrap());
        assert_eq!(term.snapshot().text(), "hel");
        assert_eq!(term.cursor(), Cursor { x: 2, y: 0 });
    }
}
