//! Public, formatted failure context.
//!
//! Lex and parse failures abort compilation and surface directly as a
//! [`Diagnostic`]. Runtime failures travel internally as
//! [`RunError`](crate::error::RunError)s; when one escapes every handler the
//! VM elaborates it into a `Diagnostic` carrying the faulting site, the last
//! executed instruction, snapshots of the locals and operand stack, the
//! demangled call-stack trace, and kind-specific hints.

use std::fmt;

use crate::error::ErrorKind;

/// Which pipeline stage produced the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Phase {
    Lex,
    Parse,
    Runtime,
}

/// A resolved source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for CodeLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// One call-stack entry, innermost last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Demangled function name (`<main>` for the top level).
    pub function: String,
    pub loc: CodeLoc,
}

/// A fully formatted failure.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub phase: Phase,
    /// Runtime error kind; `None` for lex/parse failures.
    pub kind: Option<ErrorKind>,
    pub message: String,
    pub loc: Option<CodeLoc>,
    /// The faulty source line, verbatim.
    pub source_line: Option<String>,
    /// The last executed instruction, formatted (runtime only).
    pub last_instruction: Option<String>,
    /// Name/value snapshot of the faulting frame's locals.
    pub locals: Vec<(String, String)>,
    /// Display snapshot of the operand stack, bottom first.
    pub operand_stack: Vec<String>,
    /// Call-stack trace, outermost first.
    pub trace: Vec<StackFrame>,
    /// Kind-specific elaborations (e.g. near-miss signatures).
    pub hints: Vec<String>,
}

impl Diagnostic {
    pub(crate) fn lex(message: impl Into<String>, loc: CodeLoc, source_line: String) -> Self {
        Self {
            phase: Phase::Lex,
            kind: None,
            message: message.into(),
            loc: Some(loc),
            source_line: Some(source_line),
            last_instruction: None,
            locals: Vec::new(),
            operand_stack: Vec::new(),
            trace: Vec::new(),
            hints: Vec::new(),
        }
    }

    pub(crate) fn parse(message: impl Into<String>, loc: Option<CodeLoc>, source_line: Option<String>) -> Self {
        Self {
            phase: Phase::Parse,
            kind: None,
            message: message.into(),
            loc,
            source_line,
            last_instruction: None,
            locals: Vec::new(),
            operand_stack: Vec::new(),
            trace: Vec::new(),
            hints: Vec::new(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => writeln!(f, "{} error ({kind}): {}", self.phase, self.message)?,
            None => writeln!(f, "{} error: {}", self.phase, self.message)?,
        }
        if let Some(loc) = &self.loc {
            writeln!(f, "  --> {loc}")?;
        }
        if let Some(line) = &self.source_line {
            writeln!(f, "   | {line}")?;
            if let Some(loc) = &self.loc {
                let pad = " ".repeat(loc.column.saturating_sub(1) as usize);
                writeln!(f, "   | {pad}^")?;
            }
        }
        if let Some(instr) = &self.last_instruction {
            writeln!(f, "  last instruction: {instr}")?;
        }
        if !self.trace.is_empty() {
            writeln!(f, "  call stack:")?;
            for frame in &self.trace {
                writeln!(f, "    {} at {}", frame.function, frame.loc)?;
            }
        }
        if !self.locals.is_empty() {
            writeln!(f, "  locals:")?;
            for (name, value) in &self.locals {
                writeln!(f, "    {name} = {value}")?;
            }
        }
        if !self.operand_stack.is_empty() {
            writeln!(f, "  operand stack: [{}]", self.operand_stack.join(", "))?;
        }
        for hint in &self.hints {
            writeln!(f, "  hint: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_location_and_hints() {
        let mut diag = Diagnostic::parse(
            "unexpected token `}`",
            Some(CodeLoc {
                file: "demo.fl".to_owned(),
                line: 3,
                column: 5,
            }),
            Some("    }".to_owned()),
        );
        diag.hints.push("did you forget a `{`?".to_owned());
        let text = diag.to_string();
        assert!(text.contains("Parse error"));
        assert!(text.contains("demo.fl:3:5"));
        assert!(text.contains("hint: did you forget"));
    }
}
