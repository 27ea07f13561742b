use crate::error::ResizeError;
use crate::screen::colors::TerminalColor;

const TAB_WIDTH: u16 = 8;

/// Largest accepted row or column count.
pub const MAX_DIMENSION: u16 = 4096;

/// Terminal geometry in character cells. Both dimensions are non-zero and at
/// most [`MAX_DIMENSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl TermSize {
    pub fn new(rows: u16, cols: u16) -> Result<Self, ResizeError> {
        if rows == 0 || cols == 0 || rows > MAX_DIMENSION || cols > MAX_DIMENSION {
            return Err(ResizeError::InvalidGeometry {
                rows: rows.into(),
                cols: cols.into(),
            });
        }
        Ok(Self { rows, cols })
    }
}

/// Layout code computes geometry from pixel sizes and may end up with
/// negative or oversized values.
impl TryFrom<(i32, i32)> for TermSize {
    type Error = ResizeError;

    fn try_from((rows, cols): (i32, i32)) -> Result<Self, Self::Error> {
        let invalid = || ResizeError::InvalidGeometry {
            rows: rows.into(),
            cols: cols.into(),
        };
        let rows = u16::try_from(rows).map_err(|_| invalid())?;
        let cols = u16::try_from(cols).map_err(|_| invalid())?;
        TermSize::new(rows, cols)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub fg_color: TerminalColor,
    pub bg_color: TerminalColor,
    pub attrs: CellAttributes,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            ch: ' ',
            fg_color: TerminalColor::DefaultFg,
            bg_color: TerminalColor::DefaultBg,
            attrs: CellAttributes::default(),
        }
    }
}

impl Cell {
    pub fn new(ch: char) -> Self {
        Self {
            ch,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ch == ' '
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellAttributes {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
    pub blink: bool,
    pub reverse: bool,
}

/// The attributes stamped onto every cell written or erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pen {
    pub fg: TerminalColor,
    pub bg: TerminalColor,
    pub attrs: CellAttributes,
}

impl Default for Pen {
    fn default() -> Self {
        Self {
            fg: TerminalColor::DefaultFg,
            bg: TerminalColor::DefaultBg,
            attrs: CellAttributes::default(),
        }
    }
}

impl Pen {
    pub fn cell(&self, ch: char) -> Cell {
        Cell {
            ch,
            fg_color: self.fg,
            bg_color: self.bg,
            attrs: self.attrs,
        }
    }

    /// Erased cells keep the current background and nothing else.
    pub fn blank(&self) -> Cell {
        Cell {
            bg_color: self.bg,
            ..Cell::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub x: u16,
    pub y: u16,
}

#[derive(Debug, Clone, Copy)]
struct SavedCursor {
    cursor: Cursor,
    pen: Pen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modes {
    pub autowrap: bool,
    pub cursor_visible: bool,
    pub application_cursor: bool,
}

impl Default for Modes {
    fn default() -> Self {
        Self {
            autowrap: true,
            cursor_visible: true,
            application_cursor: false,
        }
    }
}

/// Fixed-size character grid with cursor, pen and scroll region.
///
/// Cells are stored flat, addressed as `row * cols + col`. The cursor always
/// lies inside the grid; a write into the last column leaves the cursor there
/// with a pending wrap that the next printable character resolves.
#[derive(Debug, Clone)]
pub struct ScreenBuffer {
    rows: u16,
    cols: u16,
    cells: Vec<Cell>,
    cursor: Cursor,
    wrap_pending: bool,
    scroll_top: u16,
    scroll_bottom: u16,
    modes: Modes,
    pen: Pen,
    saved: Option<SavedCursor>,
    dirty: bool,
    /// Cursor as of the last `clear_dirty`.
    clean_cursor: Cursor,
}

impl ScreenBuffer {
    pub fn new(size: TermSize) -> Self {
        Self {
            rows: size.rows,
            cols: size.cols,
            cells: vec![Cell::default(); size.rows as usize * size.cols as usize],
            cursor: Cursor::default(),
            wrap_pending: false,
            scroll_top: 0,
            scroll_bottom: size.rows - 1,
            modes: Modes::default(),
            pen: Pen::default(),
            saved: None,
            dirty: true,
            clean_cursor: Cursor::default(),
        }
    }

    pub fn size(&self) -> TermSize {
        TermSize {
            rows: self.rows,
            cols: self.cols,
        }
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    fn index(&self, row: u16, col: u16) -> usize {
        assert!(
            row < self.rows && col < self.cols,
            "cell ({row}, {col}) outside {}x{} grid",
            self.rows,
            self.cols
        );
        row as usize * self.cols as usize + col as usize
    }

    fn row_range(&self, row: u16) -> std::ops::Range<usize> {
        let start = row as usize * self.cols as usize;
        start..start + self.cols as usize
    }

    pub fn get_cell(&self, row: u16, col: u16) -> Cell {
        self.cells[self.index(row, col)]
    }

    pub fn set_cell(&mut self, row: u16, col: u16, cell: Cell) {
        let idx = self.index(row, col);
        self.cells[idx] = cell;
        self.dirty = true;
    }

    pub fn cell_at(&self, row: u16, col: u16) -> Option<&Cell> {
        if row < self.rows && col < self.cols {
            self.cells.get(row as usize * self.cols as usize + col as usize)
        } else {
            None
        }
    }

    pub fn row(&self, index: u16) -> Option<&[Cell]> {
        (index < self.rows).then(|| &self.cells[self.row_range(index)])
    }

    pub fn resize(&mut self, size: TermSize) {
        if size == self.size() {
            return;
        }

        let mut cells = vec![Cell::default(); size.rows as usize * size.cols as usize];
        let keep_rows = self.rows.min(size.rows) as usize;
        let keep_cols = self.cols.min(size.cols) as usize;
        for row in 0..keep_rows {
            let src = row * self.cols as usize;
            let dst = row * size.cols as usize;
            cells[dst..dst + keep_cols].copy_from_slice(&self.cells[src..src + keep_cols]);
        }

        self.cells = cells;
        self.rows = size.rows;
        self.cols = size.cols;
        self.scroll_top = 0;
        self.scroll_bottom = size.rows - 1;
        self.wrap_pending = false;

        // Clamp cursor position
        self.cursor.y = self.cursor.y.min(size.rows - 1);
        self.cursor.x = self.cursor.x.min(size.cols - 1);
        if let Some(saved) = self.saved.as_mut() {
            saved.cursor.y = saved.cursor.y.min(size.rows - 1);
            saved.cursor.x = saved.cursor.x.min(size.cols - 1);
        }

        self.dirty = true;
    }

    /// Back to power-on state, keeping the geometry.
    pub fn reset(&mut self) {
        *self = Self::new(self.size());
    }

    pub fn write_char(&mut self, ch: char) {
        if self.wrap_pending {
            self.wrap_pending = false;
            self.cursor.x = 0;
            self.linefeed();
        }

        let idx = self.index(self.cursor.y, self.cursor.x);
        self.cells[idx] = self.pen.cell(ch);
        self.dirty = true;

        if self.cursor.x + 1 < self.cols {
            self.cursor.x += 1;
        } else if self.modes.autowrap {
            self.wrap_pending = true;
        }
    }

    pub fn linefeed(&mut self) {
        self.wrap_pending = false;
        if self.cursor.y == self.scroll_bottom {
            self.scroll_up(1);
        } else if self.cursor.y + 1 < self.rows {
            self.cursor.y += 1;
        }
    }

    pub fn newline(&mut self) {
        self.carriage_return();
        self.linefeed();
    }

    pub fn reverse_index(&mut self) {
        self.wrap_pending = false;
        if self.cursor.y == self.scroll_top {
            self.scroll_down(1);
        } else if self.cursor.y > 0 {
            self.cursor.y -= 1;
        }
    }

    pub fn carriage_return(&mut self) {
        self.cursor.x = 0;
        self.wrap_pending = false;
    }

    pub fn tab(&mut self) {
        // Move to next tab stop (every 8 characters)
        let next_tab = ((self.cursor.x / TAB_WIDTH) + 1) * TAB_WIDTH;
        self.cursor.x = next_tab.min(self.cols - 1);
        self.wrap_pending = false;
    }

    pub fn backspace(&mut self) {
        if self.cursor.x > 0 {
            self.cursor.x -= 1;
        }
        self.wrap_pending = false;
    }

    /// Scroll the active region up, blanking the rows exposed at its bottom.
    pub fn scroll_up(&mut self, lines: u16) {
        self.scroll_rows_up(self.scroll_top, self.scroll_bottom, lines);
    }

    /// Scroll the active region down, blanking the rows exposed at its top.
    pub fn scroll_down(&mut self, lines: u16) {
        self.scroll_rows_down(self.scroll_top, self.scroll_bottom, lines);
    }

    fn scroll_rows_up(&mut self, top: u16, bottom: u16, lines: u16) {
        let height = bottom - top + 1;
        let lines = lines.min(height);
        if lines == 0 {
            return;
        }
        let cols = self.cols as usize;
        let (top, bottom, lines) = (top as usize, bottom as usize, lines as usize);

        self.cells
            .copy_within((top + lines) * cols..(bottom + 1) * cols, top * cols);
        let blank = self.pen.blank();
        self.cells[(bottom + 1 - lines) * cols..(bottom + 1) * cols].fill(blank);
        self.dirty = true;
    }

    fn scroll_rows_down(&mut self, top: u16, bottom: u16, lines: u16) {
        let height = bottom - top + 1;
        let lines = lines.min(height);
        if lines == 0 {
            return;
        }
        let cols = self.cols as usize;
        let (top, bottom, lines) = (top as usize, bottom as usize, lines as usize);

        self.cells
            .copy_within(top * cols..(bottom + 1 - lines) * cols, (top + lines) * cols);
        let blank = self.pen.blank();
        self.cells[top * cols..(top + lines) * cols].fill(blank);
        self.dirty = true;
    }

    pub fn insert_lines(&mut self, lines: u16) {
        if (self.scroll_top..=self.scroll_bottom).contains(&self.cursor.y) {
            self.scroll_rows_down(self.cursor.y, self.scroll_bottom, lines);
            self.carriage_return();
        }
    }

    pub fn delete_lines(&mut self, lines: u16) {
        if (self.scroll_top..=self.scroll_bottom).contains(&self.cursor.y) {
            self.scroll_rows_up(self.cursor.y, self.scroll_bottom, lines);
            self.carriage_return();
        }
    }

    pub fn insert_chars(&mut self, count: u16) {
        let range = self.row_range(self.cursor.y);
        let x = self.cursor.x as usize;
        let count = (count as usize).min(self.cols as usize - x);
        let row = &mut self.cells[range];
        row.copy_within(x..row.len() - count, x + count);
        row[x..x + count].fill(self.pen.blank());
        self.wrap_pending = false;
        self.dirty = true;
    }

    pub fn delete_chars(&mut self, count: u16) {
        let range = self.row_range(self.cursor.y);
        let x = self.cursor.x as usize;
        let count = (count as usize).min(self.cols as usize - x);
        let row = &mut self.cells[range];
        let len = row.len();
        row.copy_within(x + count..len, x);
        row[len - count..].fill(self.pen.blank());
        self.wrap_pending = false;
        self.dirty = true;
    }

    pub fn erase_chars(&mut self, count: u16) {
        let start = self.index(self.cursor.y, self.cursor.x);
        let count = (count as usize).min((self.cols - self.cursor.x) as usize);
        self.cells[start..start + count].fill(self.pen.blank());
        self.wrap_pending = false;
        self.dirty = true;
    }

    // Cursor movement methods
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn cursor_up(&mut self, lines: u16) {
        let top = if self.cursor.y >= self.scroll_top {
            self.scroll_top
        } else {
            0
        };
        self.cursor.y = self.cursor.y.saturating_sub(lines).max(top);
        self.wrap_pending = false;
    }

    pub fn cursor_down(&mut self, lines: u16) {
        let bottom = if self.cursor.y <= self.scroll_bottom {
            self.scroll_bottom
        } else {
            self.rows - 1
        };
        self.cursor.y = self.cursor.y.saturating_add(lines).min(bottom);
        self.wrap_pending = false;
    }

    pub fn cursor_left(&mut self, cols: u16) {
        self.cursor.x = self.cursor.x.saturating_sub(cols);
        self.wrap_pending = false;
    }

    pub fn cursor_right(&mut self, cols: u16) {
        self.cursor.x = self.cursor.x.saturating_add(cols).min(self.cols - 1);
        self.wrap_pending = false;
    }

    /// Absolute positioning, clamped to the grid.
    pub fn set_cursor(&mut self, row: u16, col: u16) {
        self.cursor.y = row.min(self.rows - 1);
        self.cursor.x = col.min(self.cols - 1);
        self.wrap_pending = false;
    }

    pub fn set_cursor_col(&mut self, col: u16) {
        self.set_cursor(self.cursor.y, col);
    }

    pub fn set_cursor_row(&mut self, row: u16) {
        self.set_cursor(row, self.cursor.x);
    }

    pub fn save_cursor(&mut self) {
        self.saved = Some(SavedCursor {
            cursor: self.cursor,
            pen: self.pen,
        });
    }

    pub fn restore_cursor(&mut self) {
        let saved = self.saved.unwrap_or(SavedCursor {
            cursor: Cursor::default(),
            pen: Pen::default(),
        });
        self.cursor = saved.cursor;
        self.pen = saved.pen;
        self.wrap_pending = false;
    }

    // Screen clearing methods
    pub fn erase_in_display(&mut self, mode: u16) {
        let blank = self.pen.blank();
        let cursor = self.index(self.cursor.y, self.cursor.x);
        match mode {
            0 => self.cells[cursor..].fill(blank),
            1 => self.cells[..=cursor].fill(blank),
            2 | 3 => self.cells.fill(blank),
            _ => return,
        }
        self.dirty = true;
    }

    pub fn erase_in_line(&mut self, mode: u16) {
        let blank = self.pen.blank();
        let range = self.row_range(self.cursor.y);
        let cursor = self.index(self.cursor.y, self.cursor.x);
        match mode {
            0 => self.cells[cursor..range.end].fill(blank),
            1 => self.cells[range.start..=cursor].fill(blank),
            2 => self.cells[range].fill(blank),
            _ => return,
        }
        self.dirty = true;
    }

    // Scroll region methods

    /// Set the scroll region from zero-based inclusive bounds. Regions that
    /// are empty or a single line are ignored. The cursor homes on success.
    pub fn set_scroll_region(&mut self, top: u16, bottom: u16) -> bool {
        let bottom = bottom.min(self.rows - 1);
        if top >= bottom {
            return false;
        }
        self.scroll_top = top;
        self.scroll_bottom = bottom;
        self.set_cursor(0, 0);
        true
    }

    pub fn scroll_region(&self) -> (u16, u16) {
        (self.scroll_top, self.scroll_bottom)
    }

    // Attribute and mode methods
    pub fn pen(&self) -> &Pen {
        &self.pen
    }

    pub fn pen_mut(&mut self) -> &mut Pen {
        &mut self.pen
    }

    pub fn modes(&self) -> Modes {
        self.modes
    }

    pub fn set_autowrap(&mut self, enabled: bool) {
        self.modes.autowrap = enabled;
        if !enabled {
            self.wrap_pending = false;
        }
    }

    pub fn set_cursor_visible(&mut self, visible: bool) {
        if self.modes.cursor_visible != visible {
            self.modes.cursor_visible = visible;
            self.dirty = true;
        }
    }

    pub fn set_application_cursor(&mut self, enabled: bool) {
        self.modes.application_cursor = enabled;
    }

    // Dirty tracking

    /// Whether anything a snapshot shows, cells or cursor, changed since the
    /// last `clear_dirty`.
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.cursor != self.clean_cursor
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
        self.clean_cursor = self.cursor;
    }

    pub fn snapshot(&self) -> Grid {
        Grid {
            rows: self.rows,
            cols: self.cols,
            cells: self.cells.clone(),
            cursor: self.cursor,
            cursor_visible: self.modes.cursor_visible,
        }
    }
}

/// Immutable point-in-time copy of the screen, handed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    rows: u16,
    cols: u16,
    cells: Vec<Cell>,
    cursor: Cursor,
    cursor_visible: bool,
}

impl Grid {
    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn cursor_visible(&self) -> bool {
        self.cursor_visible
    }

    pub fn cell(&self, row: u16, col: u16) -> Option<&Cell> {
        if row < self.rows && col < self.cols {
            self.cells.get(row as usize * self.cols as usize + col as usize)
        } else {
            None
        }
    }

    pub fn row(&self, index: u16) -> Option<&[Cell]> {
        if index >= self.rows {
            return None;
        }
        let start = index as usize * self.cols as usize;
        Some(&self.cells[start..start + self.cols as usize])
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[Cell]> {
        self.cells.chunks(self.cols as usize)
    }

    /// Text of one row with trailing blanks removed.
    pub fn row_text(&self, index: u16) -> String {
        self.row(index)
            .map(|cells| {
                let text: String = cells.iter().map(|c| c.ch).collect();
                text.trim_end().to_string()
            })
            .unwrap_or_default()
    }

    /// Whole screen as text, one line per row, trailing empty rows dropped.
    pub fn text(&self) -> String {
        let mut lines: Vec<String> = (0..self.rows).map(|row| self.row_text(row)).collect();
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        lines.join("\n")
    }
}
