//! Resumable VT100/ANSI escape sequence parser.
//!
//! The parser is a table-driven state machine whose state, including any
//! partially received sequence or UTF-8 character, lives in [`Parser`] between
//! calls. Bytes can therefore arrive split at arbitrary points. Recognized
//! actions are reported to a [`Perform`] implementation; malformed input is
//! consumed up to its terminator and dropped.

use tracing::trace;

pub const MAX_PARAMS: usize = 32;
const MAX_INTERMEDIATES: usize = 2;
const MAX_OSC_LEN: usize = 1024;

const REPLACEMENT: char = char::REPLACEMENT_CHARACTER;

/// Receiver of parsed terminal actions.
pub trait Perform {
    /// A printable character.
    fn print(&mut self, c: char);

    /// A C0 control byte.
    fn execute(&mut self, byte: u8);

    /// A complete `CSI ... final` sequence. Private markers (`?`, `>`, ...)
    /// are reported as intermediates. `ignore` is set when the sequence
    /// overflowed or contained bytes in invalid positions.
    fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char);

    /// A two-character (or intermediate-prefixed) escape sequence.
    fn esc_dispatch(&mut self, intermediates: &[u8], ignore: bool, byte: u8);

    /// An operating system command, split on `;`.
    fn osc_dispatch(&mut self, params: &[&[u8]], bell_terminated: bool);
}

/// CSI parameters. Each item yielded by [`Params::iter`] is one
/// `;`-separated parameter together with its `:`-separated sub-parameters.
/// Empty parameters read as 0.
#[derive(Debug, Clone, Copy)]
pub struct Params {
    values: [u16; MAX_PARAMS],
    subparam: [bool; MAX_PARAMS],
    len: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            values: [0; MAX_PARAMS],
            subparam: [false; MAX_PARAMS],
            len: 0,
        }
    }
}

impl Params {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> ParamsIter<'_> {
        ParamsIter {
            params: self,
            pos: 0,
        }
    }

    fn push(&mut self, value: u16, subparam: bool) -> bool {
        if self.len == MAX_PARAMS {
            return false;
        }
        self.values[self.len] = value;
        self.subparam[self.len] = subparam && self.len > 0;
        self.len += 1;
        true
    }
}

pub struct ParamsIter<'a> {
    params: &'a Params,
    pos: usize,
}

impl<'a> Iterator for ParamsIter<'a> {
    type Item = &'a [u16];

    fn next(&mut self) -> Option<Self::Item> {
        let params = self.params;
        if self.pos >= params.len {
            return None;
        }
        let start = self.pos;
        self.pos += 1;
        while self.pos < params.len && params.subparam[self.pos] {
            self.pos += 1;
        }
        Some(&params.values[start..self.pos])
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Intermediates {
    bytes: [u8; MAX_INTERMEDIATES],
    len: usize,
}

impl Intermediates {
    fn push(&mut self, byte: u8) -> bool {
        if self.len == MAX_INTERMEDIATES {
            return false;
        }
        self.bytes[self.len] = byte;
        self.len += 1;
        true
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Accumulator for a CSI sequence in progress.
#[derive(Debug, Default, Clone, Copy)]
struct CsiParam {
    params: Params,
    intermediates: Intermediates,
    current: u16,
    current_is_subparam: bool,
    seen_param: bool,
    in_intermediates: bool,
    ignore: bool,
}

impl CsiParam {
    fn finish_param(&mut self, next_is_subparam: bool) {
        if !self.params.push(self.current, self.current_is_subparam) {
            self.ignore = true;
        }
        self.current = 0;
        self.current_is_subparam = next_is_subparam;
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Ground,
    Escape {
        intermediates: Intermediates,
        ignore: bool,
    },
    CsiParam(CsiParam),
    OscString {
        buffer: Vec<u8>,
        escape: bool,
    },
    /// DCS, SOS, PM and APC payloads: consumed until ST and discarded.
    IgnoredString {
        escape: bool,
    },
}

impl State {
    fn escape() -> Self {
        State::Escape {
            intermediates: Intermediates::default(),
            ignore: false,
        }
    }
}

enum Utf8Step {
    Char(char),
    Pending,
    Invalid { reprocess: bool },
}

/// Incremental UTF-8 decoder for bytes seen in the ground state.
#[derive(Debug, Default)]
struct Utf8Decoder {
    buf: [u8; 4],
    len: usize,
    need: usize,
}

impl Utf8Decoder {
    fn is_pending(&self) -> bool {
        self.len > 0
    }

    fn push(&mut self, byte: u8) -> Utf8Step {
        if self.len == 0 {
            self.need = match byte {
                0xC2..=0xDF => 2,
                0xE0..=0xEF => 3,
                0xF0..=0xF4 => 4,
                _ => return Utf8Step::Invalid { reprocess: false },
            };
            self.buf[0] = byte;
            self.len = 1;
            return Utf8Step::Pending;
        }

        if byte & 0xC0 != 0x80 {
            self.len = 0;
            return Utf8Step::Invalid { reprocess: true };
        }

        self.buf[self.len] = byte;
        self.len += 1;
        if self.len < self.need {
            return Utf8Step::Pending;
        }

        let decoded = std::str::from_utf8(&self.buf[..self.len])
            .ok()
            .and_then(|s| s.chars().next());
        self.len = 0;
        match decoded {
            Some(c) => Utf8Step::Char(c),
            None => Utf8Step::Invalid { reprocess: false },
        }
    }

    /// Drop a partial character, reporting whether there was one.
    fn abort(&mut self) -> bool {
        std::mem::replace(&mut self.len, 0) > 0
    }
}

#[derive(Debug, Default)]
pub struct Parser {
    state: State,
    utf8: Utf8Decoder,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no partial sequence or character is buffered.
    pub fn is_ground(&self) -> bool {
        matches!(self.state, State::Ground) && !self.utf8.is_pending()
    }

    pub fn advance<P: Perform>(&mut self, performer: &mut P, bytes: &[u8]) {
        for &byte in bytes {
            let state = std::mem::take(&mut self.state);
            self.state = self.next_state(state, performer, byte);
        }
    }

    fn next_state<P: Perform>(&mut self, state: State, performer: &mut P, byte: u8) -> State {
        match state {
            State::OscString { buffer, escape } => self.osc_string(performer, buffer, escape, byte),
            State::IgnoredString { escape } => self.ignored_string(performer, escape, byte),

            // CAN and SUB abort any sequence, ESC restarts one
            _ if byte == 0x18 || byte == 0x1A => {
                self.abort_utf8(performer);
                State::Ground
            }
            _ if byte == 0x1B => {
                self.abort_utf8(performer);
                State::escape()
            }

            State::Ground => {
                self.ground(performer, byte);
                State::Ground
            }
            State::Escape {
                intermediates,
                ignore,
            } => Self::escape(performer, intermediates, ignore, byte),
            State::CsiParam(csi) => Self::csi_param(performer, csi, byte),
        }
    }

    fn abort_utf8<P: Perform>(&mut self, performer: &mut P) {
        if self.utf8.abort() {
            performer.print(REPLACEMENT);
        }
    }

    fn ground<P: Perform>(&mut self, performer: &mut P, byte: u8) {
        if self.utf8.is_pending() || byte >= 0x80 {
            match self.utf8.push(byte) {
                Utf8Step::Char(c) => performer.print(c),
                Utf8Step::Pending => {}
                Utf8Step::Invalid { reprocess } => {
                    performer.print(REPLACEMENT);
                    if reprocess {
                        self.ground(performer, byte);
                    }
                }
            }
            return;
        }

        match byte {
            0x00..=0x1F => performer.execute(byte),
            0x7F => {}
            _ => performer.print(byte as char),
        }
    }

    fn escape<P: Perform>(
        performer: &mut P,
        mut intermediates: Intermediates,
        ignore: bool,
        byte: u8,
    ) -> State {
        match byte {
            0x00..=0x1F => {
                performer.execute(byte);
                State::Escape {
                    intermediates,
                    ignore,
                }
            }
            0x20..=0x2F => {
                let ignore = !intermediates.push(byte) || ignore;
                State::Escape {
                    intermediates,
                    ignore,
                }
            }
            b'[' if intermediates.is_empty() => State::CsiParam(CsiParam::default()),
            b']' if intermediates.is_empty() => State::OscString {
                buffer: Vec::new(),
                escape: false,
            },
            b'P' | b'X' | b'^' | b'_' if intermediates.is_empty() => {
                State::IgnoredString { escape: false }
            }
            0x30..=0x7E => {
                performer.esc_dispatch(intermediates.as_slice(), ignore, byte);
                State::Ground
            }
            0x7F => State::Escape {
                intermediates,
                ignore,
            },
            _ => {
                trace!("Discarding escape sequence ending in {:#04x}", byte);
                State::Ground
            }
        }
    }

    fn csi_param<P: Perform>(performer: &mut P, mut csi: CsiParam, byte: u8) -> State {
        match byte {
            0x00..=0x1F => performer.execute(byte),
            b'0'..=b'9' => {
                if csi.in_intermediates {
                    csi.ignore = true;
                } else {
                    csi.current = csi
                        .current
                        .saturating_mul(10)
                        .saturating_add(u16::from(byte - b'0'));
                    csi.seen_param = true;
                }
            }
            b';' | b':' => {
                if csi.in_intermediates {
                    csi.ignore = true;
                } else {
                    csi.finish_param(byte == b':');
                    csi.seen_param = true;
                }
            }
            // Private markers are only valid as the first byte
            0x3C..=0x3F => {
                if csi.seen_param || csi.in_intermediates || !csi.intermediates.push(byte) {
                    csi.ignore = true;
                }
                csi.seen_param = true;
            }
            0x20..=0x2F => {
                csi.in_intermediates = true;
                if !csi.intermediates.push(byte) {
                    csi.ignore = true;
                }
            }
            0x40..=0x7E => {
                csi.finish_param(false);
                performer.csi_dispatch(
                    &csi.params,
                    csi.intermediates.as_slice(),
                    csi.ignore,
                    byte as char,
                );
                return State::Ground;
            }
            0x7F => {}
            _ => csi.ignore = true,
        }
        State::CsiParam(csi)
    }

    fn osc_string<P: Perform>(
        &mut self,
        performer: &mut P,
        mut buffer: Vec<u8>,
        escape: bool,
        byte: u8,
    ) -> State {
        if escape {
            dispatch_osc(performer, &buffer, false);
            if byte == b'\\' {
                return State::Ground;
            }
            // Unterminated string followed by a fresh escape sequence
            return self.next_state(State::escape(), performer, byte);
        }

        match byte {
            0x07 => {
                dispatch_osc(performer, &buffer, true);
                State::Ground
            }
            0x1B => State::OscString {
                buffer,
                escape: true,
            },
            0x18 | 0x1A => State::Ground,
            0x00..=0x1F => State::OscString {
                buffer,
                escape: false,
            },
            _ => {
                if buffer.len() < MAX_OSC_LEN {
                    buffer.push(byte);
                }
                State::OscString {
                    buffer,
                    escape: false,
                }
            }
        }
    }

    fn ignored_string<P: Perform>(&mut self, performer: &mut P, escape: bool, byte: u8) -> State {
        if escape {
            if byte == b'\\' {
                return State::Ground;
            }
            return self.next_state(State::escape(), performer, byte);
        }

        match byte {
            0x07 | 0x18 | 0x1A => State::Ground,
            0x1B => State::IgnoredString { escape: true },
            _ => State::IgnoredString { escape: false },
        }
    }
}

fn dispatch_osc<P: Perform>(performer: &mut P, buffer: &[u8], bell_terminated: bool) {
    let params: Vec<&[u8]> = buffer.split(|b| *b == b';').collect();
    performer.osc_dispatch(&params, bell_terminated);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Action {
        Print(char),
        Execute(u8),
        Csi(Vec<Vec<u16>>, Vec<u8>, bool, char),
        Esc(Vec<u8>, u8),
        Osc(Vec<Vec<u8>>, bool),
    }

    #[derive(Default)]
    struct Recorder {
        actions: Vec<Action>,
    }

    impl Perform for Recorder {
        fn print(&mut self, c: char) {
            self.actions.push(Action::Print(c));
        }

        fn execute(&mut self, byte: u8) {
            self.actions.push(Action::Execute(byte));
        }

        fn csi_dispatch(&mut self, params: &Params, intermediates: &[u8], ignore: bool, action: char) {
            let params = params.iter().map(|p| p.to_vec()).collect();
            self.actions
                .push(Action::Csi(params, intermediates.to_vec(), ignore, action));
        }

        fn esc_dispatch(&mut self, intermediates: &[u8], _ignore: bool, byte: u8) {
            self.actions.push(Action::Esc(intermediates.to_vec(), byte));
        }

        fn osc_dispatch(&mut self, params: &[&[u8]], bell_terminated: bool) {
            let params = params.iter().map(|p| p.to_vec()).collect();
            self.actions.push(Action::Osc(params, bell_terminated));
        }
    }

    fn parse(bytes: &[u8]) -> Vec<Action> {
        let mut parser = Parser::new();
        let mut recorder = Recorder::default();
        parser.advance(&mut recorder, bytes);
        recorder.actions
    }

    #[test]
    fn test_plain_text_and_controls() {
        assert_eq!(
            parse(b"a\r\n\x07"),
            vec![
                Action::Print('a'),
                Action::Execute(b'\r'),
                Action::Execute(b'\n'),
                Action::Execute(0x07),
            ]
        );
    }

    #[test]
    fn test_csi_params() {
        assert_eq!(
            parse(b"\x1b[12;;5H"),
            vec![Action::Csi(vec![vec![12], vec![0], vec![5]], vec![], false, 'H')]
        );
        assert_eq!(parse(b"\x1b[m"), vec![Action::Csi(vec![vec![0]], vec![], false, 'm')]);
    }

    #[test]
    fn test_csi_private_marker_and_subparams() {
        assert_eq!(
            parse(b"\x1b[?25l"),
            vec![Action::Csi(vec![vec![25]], vec![b'?'], false, 'l')]
        );
        assert_eq!(
            parse(b"\x1b[38:2::1:2:3m"),
            vec![Action::Csi(vec![vec![38, 2, 0, 1, 2, 3]], vec![], false, 'm')]
        );
        // A marker after parameters makes the sequence invalid
        assert_eq!(
            parse(b"\x1b[1?h"),
            vec![Action::Csi(vec![vec![1]], vec![], true, 'h')]
        );
    }

    #[test]
    fn test_too_many_params_flags_ignore() {
        let mut seq = b"\x1b[".to_vec();
        for _ in 0..40 {
            seq.extend_from_slice(b"1;");
        }
        seq.push(b'm');
        let actions = parse(&seq);
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::Csi(_, _, true, 'm')));
    }

    #[test]
    fn test_huge_param_saturates() {
        assert_eq!(
            parse(b"\x1b[99999999999A"),
            vec![Action::Csi(vec![vec![u16::MAX]], vec![], false, 'A')]
        );
    }

    #[test]
    fn test_escape_dispatch() {
        assert_eq!(
            parse(b"\x1b7\x1b(B"),
            vec![Action::Esc(vec![], b'7'), Action::Esc(vec![b'('], b'B')]
        );
    }

    #[test]
    fn test_osc_terminators() {
        assert_eq!(
            parse(b"\x1b]0;title\x07x"),
            vec![
                Action::Osc(vec![b"0".to_vec(), b"title".to_vec()], true),
                Action::Print('x'),
            ]
        );
        assert_eq!(
            parse(b"\x1b]2;a;b\x1b\\"),
            vec![Action::Osc(
                vec![b"2".to_vec(), b"a".to_vec(), b"b".to_vec()],
                false
            )]
        );
    }

    #[test]
    fn test_osc_interrupted_by_new_sequence() {
        assert_eq!(
            parse(b"\x1b]0;t\x1b[2J"),
            vec![
                Action::Osc(vec![b"0".to_vec(), b"t".to_vec()], false),
                Action::Csi(vec![vec![2]], vec![], false, 'J'),
            ]
        );
    }

    #[test]
    fn test_osc_length_is_bounded() {
        let mut seq = b"\x1b]0;".to_vec();
        seq.extend(std::iter::repeat(b'x').take(10 * MAX_OSC_LEN));
        seq.push(0x07);
        let actions = parse(&seq);
        match &actions[..] {
            [Action::Osc(params, true)] => {
                let total: usize = params.iter().map(|p| p.len()).sum();
                assert!(total <= MAX_OSC_LEN);
            }
            other => panic!("unexpected actions: {:?}", other),
        }
    }

    #[test]
    fn test_dcs_is_discarded() {
        assert_eq!(parse(b"\x1bPq#0;1\x1b\\ok"), vec![Action::Print('o'), Action::Print('k')]);
    }

    #[test]
    fn test_cancel_aborts_sequence() {
        assert_eq!(parse(b"\x1b[12\x18A"), vec![Action::Print('A')]);
    }

    #[test]
    fn test_utf8_decoding() {
        assert_eq!(
            parse("é❯".as_bytes()),
            vec![Action::Print('é'), Action::Print('❯')]
        );
        assert_eq!(
            parse(b"\xffa\xc3"),
            vec![Action::Print(REPLACEMENT), Action::Print('a')]
        );
        assert_eq!(
            parse(b"\xe2\x9dX"),
            vec![Action::Print(REPLACEMENT), Action::Print('X')]
        );
    }

    #[test]
    fn test_split_at_every_boundary_matches_whole() {
        let input = "ab\x1b[1;31mé\x1b]0;x\x07\x1b[?25h❯\r\n\x1bPzz\x1b\\\x1b(0q".as_bytes();
        let whole = parse(input);

        for split in 0..=input.len() {
            let mut parser = Parser::new();
            let mut recorder = Recorder::default();
            parser.advance(&mut recorder, &input[..split]);
            parser.advance(&mut recorder, &input[split..]);
            assert_eq!(recorder.actions, whole, "split at {}", split);
        }

        let mut parser = Parser::new();
        let mut recorder = Recorder::default();
        for byte in input {
            parser.advance(&mut recorder, std::slice::from_ref(byte));
        }
        assert_eq!(recorder.actions, whole);
        assert!(parser.is_ground());
    }

    #[test]
    fn test_partial_sequence_is_retained() {
        let mut parser = Parser::new();
        let mut recorder = Recorder::default();
        parser.advance(&mut recorder, b"\x1b[3");
        assert!(recorder.actions.is_empty());
        assert!(!parser.is_ground());
        parser.advance(&mut recorder, b"1m");
        assert_eq!(
            recorder.actions,
            vec![Action::Csi(vec![vec![31]], vec![], false, 'm')]
        );
    }
}
