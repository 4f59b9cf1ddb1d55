//! The line editor proper: prompt, edit buffer, history, and a redisplay
//! that can be saved away and restored around foreign terminal output.
//!
//! All rendering goes through a caller-supplied `Write` (the redirector's
//! direct channel in production, a byte sink in tests). The editor never
//! reads descriptors itself; the worker feeds it input bytes one at a time.

use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
};

use crate::common::RestoreMode;
use crate::system::term::TermAttrs;

use super::quoting::char_is_quoted;

pub(crate) const DEFAULT_PROMPT: &str = "rush> ";

/// What a fed input byte amounted to.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FeedOutcome {
    /// Nothing user-visible yet (pending escape sequence, cursor motion).
    Continue,
    /// The user accepted a complete line.
    Line(String),
    /// Ctrl-D on an empty line.
    Eof,
    /// Tab: the host must supply completion candidates.
    Complete(CompletionRequest),
}

/// A completion request at (buffer, text, start, end).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    /// The whole edit buffer at request time.
    pub buffer: String,
    /// The word being completed, `buffer[start..end]`.
    pub text: String,
    /// Byte offset of the word start.
    pub start: usize,
    /// Byte offset of the word end (the point).
    pub end: usize,
}

#[derive(Debug, Clone)]
struct SavedLine {
    line: String,
    point: usize,
}

/// Multi-byte input in flight: escape sequences and UTF-8 scalars arrive one
/// byte at a time.
enum PendingInput {
    None,
    Esc,
    Csi(Vec<u8>),
    Utf8 { buf: [u8; 4], len: usize, need: usize },
}

pub(crate) struct LineEdit {
    prompt: String,
    buffer: String,
    point: usize,
    history: Vec<String>,
    /// Cursor into `history`; `history.len()` means "editing a fresh line".
    history_pos: usize,
    /// The fresh line stashed while browsing history.
    stash: Option<String>,
    history_path: Option<PathBuf>,
    saved: Option<SavedLine>,
    pending: PendingInput,
    /// Terminal modes to put back when leaving raw mode.
    cooked: Option<TermAttrs>,
}

impl LineEdit {
    pub(crate) fn new() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.into(),
            buffer: String::new(),
            point: 0,
            history: Vec::new(),
            history_pos: 0,
            stash: None,
            history_path: None,
            saved: None,
            pending: PendingInput::None,
            cooked: None,
        }
    }

    /// Enter raw mode (when stdin is a terminal) and show the prompt.
    pub(crate) fn install(&mut self, out: &mut dyn Write) {
        let stdin = io::stdin();
        if let Ok(attrs) = TermAttrs::get(&stdin) {
            if attrs.make_raw().set(&stdin, RestoreMode::Drain).is_ok() {
                self.cooked = Some(attrs);
            }
        }
        self.redisplay(out);
    }

    /// Leave raw mode, restoring the modes seen at install time.
    pub(crate) fn deinstall(&mut self) {
        if let Some(attrs) = self.cooked.take() {
            let _ = attrs.set(&io::stdin(), RestoreMode::Drain);
        }
    }

    pub(crate) fn set_prompt(&mut self, prompt: String, out: &mut dyn Write) {
        self.prompt = prompt;
        self.redisplay(out);
    }

    /// Redraw the whole line and park the cursor at the point.
    pub(crate) fn redisplay(&self, out: &mut dyn Write) {
        let _ = write!(out, "\r\x1b[2K{}{}", self.prompt, self.buffer);
        let behind = self.buffer[self.point..].chars().count();
        if behind > 0 {
            let _ = write!(out, "\x1b[{behind}D");
        }
        let _ = out.flush();
    }

    /// Save the visible line and blank it so foreign output starts at
    /// column zero. Idempotent until [`LineEdit::restore`].
    pub(crate) fn save(&mut self, out: &mut dyn Write) {
        if self.saved.is_some() {
            return;
        }
        self.saved = Some(SavedLine {
            line: self.buffer.clone(),
            point: self.point,
        });
        self.buffer.clear();
        self.point = 0;
        let _ = write!(out, "\r\x1b[2K");
        let _ = out.flush();
    }

    /// Put back the line and point saved by [`LineEdit::save`].
    pub(crate) fn restore(&mut self, out: &mut dyn Write) {
        let Some(saved) = self.saved.take() else {
            return;
        };
        self.buffer = saved.line;
        self.point = saved.point;
        self.redisplay(out);
    }

    /// Abandon the current line: fresh prompt on a fresh row.
    pub(crate) fn clear_line(&mut self, out: &mut dyn Write) {
        self.buffer.clear();
        self.point = 0;
        self.history_pos = self.history.len();
        self.stash = None;
        self.pending = PendingInput::None;
        let _ = out.write_all(b"\r\n");
        self.redisplay(out);
    }

    /// Blank the prompt and line without saving, for `pause`.
    pub(crate) fn hide(&mut self, out: &mut dyn Write) {
        self.buffer.clear();
        self.point = 0;
        let _ = write!(out, "\r\x1b[2K");
        let _ = out.flush();
    }

    fn prev_boundary(&self, mut index: usize) -> usize {
        if index == 0 {
            return 0;
        }
        index -= 1;
        while index > 0 && !self.buffer.is_char_boundary(index) {
            index -= 1;
        }
        index
    }

    fn next_boundary(&self, index: usize) -> usize {
        let mut next = index + 1;
        while next < self.buffer.len() && !self.buffer.is_char_boundary(next) {
            next += 1;
        }
        next.min(self.buffer.len())
    }

    fn insert_text(&mut self, text: &str, out: &mut dyn Write) {
        self.buffer.insert_str(self.point, text);
        self.point += text.len();
        self.redisplay(out);
    }

    fn accept_line(&mut self, out: &mut dyn Write) -> String {
        let line = std::mem::take(&mut self.buffer);
        self.point = 0;
        self.history_pos = self.history.len();
        self.stash = None;
        let _ = out.write_all(b"\r\n");
        let _ = out.flush();
        line
    }

    fn history_up(&mut self, out: &mut dyn Write) {
        if self.history_pos == 0 {
            return;
        }
        if self.history_pos == self.history.len() {
            self.stash = Some(self.buffer.clone());
        }
        self.history_pos -= 1;
        self.buffer = self.history[self.history_pos].clone();
        self.point = self.buffer.len();
        self.redisplay(out);
    }

    fn history_down(&mut self, out: &mut dyn Write) {
        if self.history_pos >= self.history.len() {
            return;
        }
        self.history_pos += 1;
        self.buffer = if self.history_pos == self.history.len() {
            self.stash.take().unwrap_or_default()
        } else {
            self.history[self.history_pos].clone()
        };
        self.point = self.buffer.len();
        self.redisplay(out);
    }

    /// The start of the word under completion: scan back to the first
    /// unquoted whitespace.
    fn completion_word_start(&self) -> usize {
        let bytes = self.buffer.as_bytes();
        let mut start = self.point;
        while start > 0 {
            let prev = self.prev_boundary(start);
            let byte = bytes[prev];
            if (byte == b' ' || byte == b'\t') && !char_is_quoted(bytes, prev) {
                break;
            }
            start = prev;
        }
        start
    }

    /// Process one input byte.
    pub(crate) fn feed(&mut self, byte: u8, out: &mut dyn Write) -> FeedOutcome {
        match std::mem::replace(&mut self.pending, PendingInput::None) {
            PendingInput::Esc => {
                if byte == b'[' {
                    self.pending = PendingInput::Csi(Vec::new());
                }
                // Other escape pairs (alt-keys) are ignored.
                return FeedOutcome::Continue;
            }
            PendingInput::Csi(mut seq) => {
                if (0x40..=0x7E).contains(&byte) {
                    self.handle_csi(&seq, byte, out);
                } else {
                    seq.push(byte);
                    self.pending = PendingInput::Csi(seq);
                }
                return FeedOutcome::Continue;
            }
            PendingInput::Utf8 { mut buf, mut len, need } => {
                if byte & 0xC0 == 0x80 {
                    buf[len] = byte;
                    len += 1;
                    if len == need {
                        if let Ok(text) = std::str::from_utf8(&buf[..len]) {
                            let text = text.to_string();
                            self.insert_text(&text, out);
                        }
                    } else {
                        self.pending = PendingInput::Utf8 { buf, len, need };
                    }
                }
                // A malformed sequence is dropped silently.
                return FeedOutcome::Continue;
            }
            PendingInput::None => {}
        }

        match byte {
            0x01 => {
                // Ctrl-A
                self.point = 0;
                self.redisplay(out);
            }
            0x02 => {
                // Ctrl-B
                self.point = self.prev_boundary(self.point);
                self.redisplay(out);
            }
            0x04 => {
                // Ctrl-D: EOF on an empty line, delete otherwise
                if self.buffer.is_empty() {
                    return FeedOutcome::Eof;
                }
                if self.point < self.buffer.len() {
                    let next = self.next_boundary(self.point);
                    self.buffer.replace_range(self.point..next, "");
                    self.redisplay(out);
                }
            }
            0x05 => {
                // Ctrl-E
                self.point = self.buffer.len();
                self.redisplay(out);
            }
            0x06 => {
                // Ctrl-F
                self.point = self.next_boundary(self.point);
                self.redisplay(out);
            }
            0x08 | 0x7F => {
                // Backspace
                if self.point > 0 {
                    let prev = self.prev_boundary(self.point);
                    self.buffer.replace_range(prev..self.point, "");
                    self.point = prev;
                    self.redisplay(out);
                }
            }
            0x09 => {
                // Tab
                let start = self.completion_word_start();
                return FeedOutcome::Complete(CompletionRequest {
                    buffer: self.buffer.clone(),
                    text: self.buffer[start..self.point].to_string(),
                    start,
                    end: self.point,
                });
            }
            0x0B => {
                // Ctrl-K
                self.buffer.truncate(self.point);
                self.redisplay(out);
            }
            0x0C => {
                // Ctrl-L
                let _ = out.write_all(b"\x1b[H\x1b[2J");
                self.redisplay(out);
            }
            0x0D | 0x0A => {
                return FeedOutcome::Line(self.accept_line(out));
            }
            0x15 => {
                // Ctrl-U
                self.buffer.replace_range(..self.point, "");
                self.point = 0;
                self.redisplay(out);
            }
            0x17 => {
                // Ctrl-W: rub out the word before the point
                let mut start = self.point;
                while start > 0 && self.buffer.as_bytes()[self.prev_boundary(start)] == b' ' {
                    start = self.prev_boundary(start);
                }
                while start > 0 && self.buffer.as_bytes()[self.prev_boundary(start)] != b' ' {
                    start = self.prev_boundary(start);
                }
                self.buffer.replace_range(start..self.point, "");
                self.point = start;
                self.redisplay(out);
            }
            0x1B => {
                self.pending = PendingInput::Esc;
            }
            _ if byte >= 0x20 && byte < 0x7F => {
                let ch = byte as char;
                let mut tmp = [0u8; 4];
                let text = ch.encode_utf8(&mut tmp).to_string();
                self.insert_text(&text, out);
            }
            _ if byte >= 0xC2 => {
                let need = if byte >= 0xF0 {
                    4
                } else if byte >= 0xE0 {
                    3
                } else {
                    2
                };
                let mut buf = [0u8; 4];
                buf[0] = byte;
                self.pending = PendingInput::Utf8 { buf, len: 1, need };
            }
            _ => {}
        }

        FeedOutcome::Continue
    }

    fn handle_csi(&mut self, params: &[u8], final_byte: u8, out: &mut dyn Write) {
        match (params, final_byte) {
            (_, b'A') => self.history_up(out),
            (_, b'B') => self.history_down(out),
            (_, b'C') => {
                self.point = self.next_boundary(self.point);
                self.redisplay(out);
            }
            (_, b'D') => {
                self.point = self.prev_boundary(self.point);
                self.redisplay(out);
            }
            (_, b'H') => {
                self.point = 0;
                self.redisplay(out);
            }
            (_, b'F') => {
                self.point = self.buffer.len();
                self.redisplay(out);
            }
            (params, b'~') if params == b"3" => {
                // Delete
                if self.point < self.buffer.len() {
                    let next = self.next_boundary(self.point);
                    self.buffer.replace_range(self.point..next, "");
                    self.redisplay(out);
                }
            }
            _ => {}
        }
    }

    /// Replace the completed word and list the surviving candidates.
    pub(crate) fn apply_completion(
        &mut self,
        request: &CompletionRequest,
        replacement: &str,
        candidates: &[String],
        out: &mut dyn Write,
    ) {
        if candidates.len() > 1 {
            let _ = out.write_all(b"\r\n");
            let _ = out.write_all(candidates.join("  ").as_bytes());
            let _ = out.write_all(b"\r\n");
        }

        // The buffer cannot have changed since the request: the worker is
        // blocked inside the completion wait.
        if self.buffer.get(request.start..request.end).is_some() {
            self.buffer
                .replace_range(request.start..request.end, replacement);
            self.point = request.start + replacement.len();
        }
        self.redisplay(out);
    }

    /// Append a line to the history unless it repeats the most recent
    /// entry; optionally rewrite the history file.
    pub(crate) fn add_history(&mut self, line: &str, write: bool) -> io::Result<bool> {
        if self.history.last().is_some_and(|last| last == line) {
            self.history_pos = self.history.len();
            return Ok(false);
        }
        self.history.push(line.to_string());
        self.history_pos = self.history.len();

        if write {
            if let Some(path) = self.history_path.clone() {
                self.write_history_file(&path)?;
            }
        }
        Ok(true)
    }

    /// Load history entries from `path`, remembering it for later writes.
    /// Returns whether the file existed.
    pub(crate) fn read_history_file(&mut self, path: PathBuf) -> io::Result<bool> {
        self.history_path = Some(path.clone());
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.history_pos = self.history.len();
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        self.history
            .extend(contents.lines().map(|line| line.to_string()));
        self.history_pos = self.history.len();
        Ok(true)
    }

    /// Write all history entries to `path`, remembering it for later
    /// writes.
    pub(crate) fn write_history_file(&mut self, path: &PathBuf) -> io::Result<()> {
        self.history_path = Some(path.clone());
        let mut contents = self.history.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        fs::write(path, contents)
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &str {
        &self.buffer
    }

    #[cfg(test)]
    pub(crate) fn point(&self) -> usize {
        self.point
    }

    #[cfg(test)]
    pub(crate) fn history(&self) -> &[String] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{CompletionRequest, FeedOutcome, LineEdit};

    fn feed_str(editor: &mut LineEdit, input: &str) -> Vec<FeedOutcome> {
        let mut sink = Vec::new();
        input
            .bytes()
            .map(|byte| editor.feed(byte, &mut sink))
            .filter(|outcome| *outcome != FeedOutcome::Continue)
            .collect()
    }

    #[test]
    fn typing_and_accepting_a_line() {
        let mut editor = LineEdit::new();
        let outcomes = feed_str(&mut editor, "ls\r");
        assert_eq!(outcomes, vec![FeedOutcome::Line("ls".into())]);
        assert_eq!(editor.buffer(), "");
        assert_eq!(editor.point(), 0);
    }

    #[test]
    fn backspace_and_motion() {
        let mut editor = LineEdit::new();
        let mut sink = Vec::new();
        feed_str(&mut editor, "cart");
        editor.feed(0x7F, &mut sink); // backspace -> "car"
        editor.feed(0x01, &mut sink); // ctrl-a
        assert_eq!(editor.point(), 0);
        editor.feed(0x04, &mut sink); // ctrl-d deletes 'c'
        assert_eq!(editor.buffer(), "ar");
        editor.feed(0x05, &mut sink); // ctrl-e
        assert_eq!(editor.point(), 2);
    }

    #[test]
    fn eof_only_on_empty_line() {
        let mut editor = LineEdit::new();
        let mut sink = Vec::new();
        assert_eq!(editor.feed(0x04, &mut sink), FeedOutcome::Eof);

        feed_str(&mut editor, "x");
        assert_eq!(editor.feed(0x04, &mut sink), FeedOutcome::Continue);
    }

    #[test]
    fn utf8_input_is_accumulated() {
        let mut editor = LineEdit::new();
        let mut sink = Vec::new();
        for byte in "héllo".bytes() {
            editor.feed(byte, &mut sink);
        }
        assert_eq!(editor.buffer(), "héllo");
        // Backspace removes the whole trailing character.
        for _ in 0..4 {
            editor.feed(0x7F, &mut sink);
        }
        assert_eq!(editor.buffer(), "h");
    }

    #[test]
    fn arrow_keys_browse_history() {
        let mut editor = LineEdit::new();
        editor.add_history("first", false).unwrap();
        editor.add_history("second", false).unwrap();

        let mut sink = Vec::new();
        feed_str(&mut editor, "draft");
        for byte in b"\x1b[A" {
            editor.feed(*byte, &mut sink);
        }
        assert_eq!(editor.buffer(), "second");
        for byte in b"\x1b[A" {
            editor.feed(*byte, &mut sink);
        }
        assert_eq!(editor.buffer(), "first");
        for byte in b"\x1b[B\x1b[B" {
            editor.feed(*byte, &mut sink);
        }
        // Back down to the stashed draft.
        assert_eq!(editor.buffer(), "draft");
    }

    #[test]
    fn save_and_restore_round_trip() {
        let mut editor = LineEdit::new();
        let mut sink = Vec::new();
        feed_str(&mut editor, "echo hi");
        editor.feed(0x02, &mut sink); // ctrl-b
        let point = editor.point();

        editor.save(&mut sink);
        assert_eq!(editor.buffer(), "");
        // A second save while saved is a no-op.
        editor.save(&mut sink);

        editor.restore(&mut sink);
        assert_eq!(editor.buffer(), "echo hi");
        assert_eq!(editor.point(), point);
    }

    #[test]
    fn save_restore_with_no_line_in_progress() {
        let mut editor = LineEdit::new();
        let mut sink = Vec::new();
        editor.save(&mut sink);
        editor.restore(&mut sink);
        assert_eq!(editor.buffer(), "");
        assert_eq!(editor.point(), 0);
    }

    #[test]
    fn completion_request_word_extraction() {
        let mut editor = LineEdit::new();
        let outcomes = feed_str(&mut editor, "git sta\t");
        assert_eq!(
            outcomes,
            vec![FeedOutcome::Complete(CompletionRequest {
                buffer: "git sta".into(),
                text: "sta".into(),
                start: 4,
                end: 7,
            })]
        );
    }

    #[test]
    fn completion_word_respects_quoting() {
        // The escaped space does not break the word.
        let mut editor = LineEdit::new();
        let outcomes = feed_str(&mut editor, "cat my\\ fi\t");
        let FeedOutcome::Complete(request) = &outcomes[0] else {
            panic!("expected completion");
        };
        assert_eq!(request.text, r"my\ fi");
        assert_eq!(request.start, 4);
    }

    #[test]
    fn apply_completion_inserts_prefix() {
        let mut editor = LineEdit::new();
        let mut sink = Vec::new();
        let outcomes = feed_str(&mut editor, "git sta\t");
        let FeedOutcome::Complete(request) = &outcomes[0] else {
            panic!("expected completion");
        };

        editor.apply_completion(
            request,
            "stat",
            &["status".into(), "stats".into()],
            &mut sink,
        );
        assert_eq!(editor.buffer(), "git stat");
        assert_eq!(editor.point(), 8);
        // Both candidates were listed for the user.
        let shown = String::from_utf8_lossy(&sink);
        assert!(shown.contains("status  stats"));
    }

    #[test]
    fn history_dedups_consecutive() {
        let mut editor = LineEdit::new();
        assert!(editor.add_history("ls", false).unwrap());
        assert!(!editor.add_history("ls", false).unwrap());
        assert!(editor.add_history("pwd", false).unwrap());
        assert!(editor.add_history("ls", false).unwrap());
        assert_eq!(editor.history(), ["ls", "pwd", "ls"]);
    }

    #[test]
    fn history_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history");

        let mut editor = LineEdit::new();
        editor.add_history("one", false).unwrap();
        editor.add_history("two", false).unwrap();
        editor.write_history_file(&path).unwrap();

        let mut other = LineEdit::new();
        assert!(other.read_history_file(path.clone()).unwrap());
        assert_eq!(other.history(), ["one", "two"]);

        // `write` on add_history rewrites the remembered file.
        other.add_history("three", true).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "one\ntwo\nthree\n");
    }

    #[test]
    fn read_history_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut editor = LineEdit::new();
        assert!(!editor
            .read_history_file(dir.path().join("nope"))
            .unwrap());
    }

    #[test]
    fn redisplay_parks_cursor() {
        let mut editor = LineEdit::new();
        let mut sink = Vec::new();
        feed_str(&mut editor, "abc");
        editor.feed(0x02, &mut sink); // ctrl-b

        sink.clear();
        editor.redisplay(&mut sink);
        let shown = String::from_utf8_lossy(&sink);
        assert!(shown.contains("rush> abc"));
        assert!(shown.ends_with("\x1b[1D"));
    }
}
