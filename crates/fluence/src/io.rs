//! Host text I/O hooks.
//!
//! Script-visible console output and input route through these traits so
//! embedders (and tests) can capture or script them. The CLI uses the
//! standard-stream implementations.

use std::collections::VecDeque;
use std::io::{BufRead, Write as _};

/// Sink for console output produced by the `print`/`printl` intrinsics.
pub trait PrintWriter {
    /// Writes a chunk of already formatted text, no terminator added.
    fn stdout_write(&mut self, output: &str);

    /// Writes a single terminator or separator character.
    fn stdout_push(&mut self, end: char);
}

/// Default writer targeting the process stdout.
#[derive(Debug, Default)]
pub struct StdPrint;

impl PrintWriter for StdPrint {
    fn stdout_write(&mut self, output: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(output.as_bytes());
    }

    fn stdout_push(&mut self, end: char) {
        let mut stdout = std::io::stdout().lock();
        let mut buffer = [0u8; 4];
        let _ = stdout.write_all(end.encode_utf8(&mut buffer).as_bytes());
        if end == '\n' {
            let _ = stdout.flush();
        }
    }
}

/// Captures output into a string, for tests and embedders.
#[derive(Debug, Default)]
pub struct CollectStringPrint {
    buffer: String,
}

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.buffer
    }

    /// Consumes the collected output.
    #[must_use]
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}

impl PrintWriter for CollectStringPrint {
    fn stdout_write(&mut self, output: &str) {
        self.buffer.push_str(output);
    }

    fn stdout_push(&mut self, end: char) {
        self.buffer.push(end);
    }
}

/// Discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn stdout_write(&mut self, _output: &str) {}

    fn stdout_push(&mut self, _end: char) {}
}

/// Source of console input for the `readl` intrinsic.
pub trait LineReader {
    /// Reads one line, without the trailing newline. `None` at end of input.
    fn read_line(&mut self) -> Option<String>;
}

/// Default reader over the process stdin.
#[derive(Debug, Default)]
pub struct StdLineReader;

impl LineReader for StdLineReader {
    fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line).ok()?;
        if read == 0 {
            return None;
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }
}

/// Feeds a fixed script of input lines, for tests and embedders.
#[derive(Debug, Default)]
pub struct ScriptedLines {
    lines: VecDeque<String>,
}

impl ScriptedLines {
    /// Splits `input` on newlines into the line queue.
    #[must_use]
    pub fn new(input: &str) -> Self {
        Self {
            lines: input.lines().map(str::to_owned).collect(),
        }
    }
}

impl LineReader for ScriptedLines {
    fn read_line(&mut self) -> Option<String> {
        self.lines.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_print_accumulates() {
        let mut print = CollectStringPrint::new();
        print.stdout_write("Result: ");
        print.stdout_write("7");
        print.stdout_push('\n');
        assert_eq!(print.output(), "Result: 7\n");
        assert_eq!(print.take(), "Result: 7\n");
        assert_eq!(print.output(), "");
    }

    #[test]
    fn scripted_lines_drain_in_order() {
        let mut input = ScriptedLines::new("3\n4\n+\n");
        assert_eq!(input.read_line().as_deref(), Some("3"));
        assert_eq!(input.read_line().as_deref(), Some("4"));
        assert_eq!(input.read_line().as_deref(), Some("+"));
        assert_eq!(input.read_line(), None);
    }
}
