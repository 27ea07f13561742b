//! Key encoding for terminal input
//!
//! Converts logical key presses into the byte sequences an xterm-compatible
//! application expects on its standard input.

/// A key press forwarded to the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Backspace,
    Tab,
    BackTab,
    Escape,
    Up,
    Down,
    Left,
    Right,
    Home,
    End,
    Insert,
    Delete,
    PageUp,
    PageDown,
    F(u8),
    Ctrl(char),
    Alt(char),
}

impl Key {
    /// Encode the key. `application_cursor` is the DECCKM state reported by
    /// the emulator and selects `ESC O` instead of `ESC [` for cursor keys.
    pub fn encode(&self, application_cursor: bool) -> Vec<u8> {
        match *self {
            Key::Char(ch) => ch.to_string().into_bytes(),
            Key::Enter => vec![0x0D],
            Key::Backspace => vec![0x7F],
            Key::Tab => vec![0x09],
            Key::BackTab => b"\x1b[Z".to_vec(),
            Key::Escape => vec![0x1B],

            Key::Up => cursor_key(b'A', application_cursor),
            Key::Down => cursor_key(b'B', application_cursor),
            Key::Right => cursor_key(b'C', application_cursor),
            Key::Left => cursor_key(b'D', application_cursor),
            Key::Home => cursor_key(b'H', application_cursor),
            Key::End => cursor_key(b'F', application_cursor),

            Key::Insert => tilde_key(2),
            Key::Delete => tilde_key(3),
            Key::PageUp => tilde_key(5),
            Key::PageDown => tilde_key(6),

            Key::F(n) => function_key(n),
            Key::Ctrl(ch) => ctrl_char(ch),
            Key::Alt(ch) => {
                let mut bytes = vec![0x1B];
                bytes.extend(ch.to_string().as_bytes());
                bytes
            }
        }
    }
}

fn cursor_key(key: u8, application_cursor: bool) -> Vec<u8> {
    if application_cursor {
        vec![0x1B, b'O', key]
    } else {
        vec![0x1B, b'[', key]
    }
}

fn tilde_key(code: u8) -> Vec<u8> {
    format!("\x1b[{}~", code).into_bytes()
}

/// F1-F12; other numbers produce nothing.
fn function_key(n: u8) -> Vec<u8> {
    match n {
        1 => b"\x1bOP".to_vec(),
        2 => b"\x1bOQ".to_vec(),
        3 => b"\x1bOR".to_vec(),
        4 => b"\x1bOS".to_vec(),
        5 => tilde_key(15),
        6 => tilde_key(17),
        7 => tilde_key(18),
        8 => tilde_key(19),
        9 => tilde_key(20),
        10 => tilde_key(21),
        11 => tilde_key(23),
        12 => tilde_key(24),
        _ => Vec::new(),
    }
}

fn ctrl_char(ch: char) -> Vec<u8> {
    match ch {
        'a'..='z' => vec![ch as u8 - b'a' + 1],
        'A'..='Z' => vec![ch as u8 - b'A' + 1],
        '@' | '`' | ' ' => vec![0x00],
        '[' => vec![0x1B],
        '\\' => vec![0x1C],
        ']' => vec![0x1D],
        '^' | '~' => vec![0x1E],
        '_' | '?' => vec![0x1F],
        // No control form; send the character itself
        _ => ch.to_string().into_bytes(),
    }
}
