//! Lexer: scans source text into tokens with position metadata.
//!
//! The scanner is a stateful cursor. Most of the work is mundane; the
//! non-trivial part is longest-match disambiguation of the multi-character
//! operator families. For the `<`- and `|`-prefixed families a candidate
//! table sorted by descending length is tested against the upcoming
//! characters, so `<||==|` never lexes as `<` `||` `==` `|`. The
//! `<n|`-family assignment operators capture their digit count as a literal.
//!
//! Newlines and semicolons normalize into a synthetic `Eol` token;
//! consecutive `Eol`s collapse. `#` starts a line comment, `#*` a nesting
//! block comment, and `#IF` (checked before comment handling) produces a
//! token for the conditional-parse gate.

use strum::IntoStaticStr;

/// A half-open range of token indices in the parser's token buffer.
///
/// Used wherever a span of tokens must be replayed later: unique-assignment
/// right-hand sides, broadcast call templates, trait default field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TokenRange {
    pub start: usize,
    pub end: usize,
}

/// Token kinds, including the full pipeline operator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoStaticStr)]
pub(crate) enum TokenKind {
    // Atoms
    Ident,
    Number,
    Str,
    FStr,
    CharLit,

    // Keywords
    Func,
    If,
    Else,
    Unless,
    While,
    Until,
    Loop,
    For,
    In,
    Return,
    Break,
    Continue,
    Nil,
    True,
    False,
    Is,
    Not,
    Struct,
    Enum,
    Match,
    Rest,
    SelfKw,
    Space,
    Use,
    Solid,
    Ref,
    Throw,
    Impl,
    Times,
    As,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Question,

    // Simple operators
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power,
    Bang,
    Amp,
    BitPipe,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    AmpEq,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    AndAnd,
    OrOr,
    PlusPlus,
    MinusMinus,

    // Structure operators
    Arrow,
    FatArrow,
    Train,
    TrainEnd,
    Compose,
    Swap,
    Flip,
    QuestionColon,
    DotDot,

    // Pipes
    PipeOp,
    OptPipe,
    GuardPipe,
    MapPipe,
    ReducePipe,
    ScanPipe,

    // Assignment family
    SeqAssign,
    SeqAssignNil,
    ChainAssignAll,
    ChainAssignN,
    OptionalAssignN,
    UniqueChainAssignN,
    OptionalUniqueAssignN,

    // Collective comparisons (conjunction)
    CollEq,
    CollNeq,
    CollLt,
    CollLe,
    CollGt,
    CollGe,
    GuardAnd,
    // Collective comparisons (disjunction)
    CollOrEq,
    CollOrNeq,
    CollOrLt,
    CollOrLe,
    CollOrGt,
    CollOrGe,
    GuardOr,

    // Dot family (the lexer folds the opening paren into the call forms)
    DotAnd,
    DotOr,
    DotInc,
    DotDec,
    DotPlusEq,
    DotMinusEq,
    DotStarEq,
    DotSlashEq,
    DotPercentEq,

    // Conditional parse gate
    HashIf,

    Eol,
    Eof,
}

/// Parsed literal payload carried by some tokens.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Char(char),
    /// Raw f-string body, expanded by the parser.
    FBody(String),
    /// The `n` captured inside the `<n|` assignment family.
    Count(u32),
}

/// One lexed token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub text: Box<str>,
    pub literal: Option<Literal>,
    pub line: u32,
    pub column: u32,
    pub file_index: u16,
}

impl Token {
    pub fn count(&self) -> u32 {
        match self.literal {
            Some(Literal::Count(n)) => n,
            _ => unreachable!("token {:?} carries no count literal", self.kind),
        }
    }
}

/// Lexing failure with position context.
#[derive(Debug, Clone)]
pub(crate) struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub excerpt: String,
}

/// `<`-family operators, longest first. Tested after the digit form `<n|`.
const LESS_OPS: &[(&str, TokenKind)] = &[
    ("<||??|", TokenKind::GuardOr),
    ("<||==|", TokenKind::CollOrEq),
    ("<||!=|", TokenKind::CollOrNeq),
    ("<||<=|", TokenKind::CollOrLe),
    ("<||>=|", TokenKind::CollOrGe),
    ("<||<|", TokenKind::CollOrLt),
    ("<||>|", TokenKind::CollOrGt),
    ("<<=|", TokenKind::CollLe),
    ("<>=|", TokenKind::CollGe),
    ("<==|", TokenKind::CollEq),
    ("<!=|", TokenKind::CollNeq),
    ("<~?|", TokenKind::SeqAssignNil),
    ("<??|", TokenKind::GuardAnd),
    ("<<-", TokenKind::TrainEnd),
    ("<<|", TokenKind::CollLt),
    ("<>|", TokenKind::CollGt),
    ("<~|", TokenKind::SeqAssign),
    ("<=", TokenKind::LessEq),
    ("<|", TokenKind::ChainAssignAll),
    ("<", TokenKind::Less),
];

/// `|`-family operators, longest first.
const PIPE_OPS: &[(&str, TokenKind)] = &[
    ("|>>=", TokenKind::ReducePipe),
    ("|>>", TokenKind::MapPipe),
    ("|??", TokenKind::GuardPipe),
    ("|~>", TokenKind::ScanPipe),
    ("|>", TokenKind::PipeOp),
    ("|?", TokenKind::OptPipe),
    ("||", TokenKind::OrOr),
    ("|", TokenKind::BitPipe),
];

/// Dot-family operators, longest first. The call forms include `(`.
const DOT_OPS: &[(&str, TokenKind)] = &[
    (".and(", TokenKind::DotAnd),
    (".or(", TokenKind::DotOr),
    (".++(", TokenKind::DotInc),
    (".--(", TokenKind::DotDec),
    (".+=", TokenKind::DotPlusEq),
    (".-=", TokenKind::DotMinusEq),
    (".*=", TokenKind::DotStarEq),
    ("./=", TokenKind::DotSlashEq),
    (".%=", TokenKind::DotPercentEq),
    ("..", TokenKind::DotDot),
    (".", TokenKind::Dot),
];

fn keyword(text: &str) -> Option<TokenKind> {
    Some(match text {
        "func" => TokenKind::Func,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "unless" => TokenKind::Unless,
        "while" => TokenKind::While,
        "until" => TokenKind::Until,
        "loop" => TokenKind::Loop,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "return" => TokenKind::Return,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "nil" => TokenKind::Nil,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "is" => TokenKind::Is,
        "not" => TokenKind::Not,
        "struct" => TokenKind::Struct,
        "enum" => TokenKind::Enum,
        "match" => TokenKind::Match,
        "rest" => TokenKind::Rest,
        "self" => TokenKind::SelfKw,
        "space" => TokenKind::Space,
        "use" => TokenKind::Use,
        "solid" => TokenKind::Solid,
        "ref" => TokenKind::Ref,
        "throw" => TokenKind::Throw,
        "impl" => TokenKind::Impl,
        "times" => TokenKind::Times,
        "as" => TokenKind::As,
        _ => return None,
    })
}

/// Stateful scanner over one source file.
pub(crate) struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    file_index: u16,
    last_was_eol: bool,
}

impl Lexer {
    pub fn new(source: &str, file_index: u16) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            file_index,
            // Swallow leading blank lines.
            last_was_eol: true,
        }
    }

    /// Lexes the whole source into a token vector terminated by `Eof`.
    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    /// True when the upcoming characters match `pattern` exactly.
    fn matches(&self, pattern: &str) -> bool {
        pattern.chars().enumerate().all(|(i, p)| self.peek_at(i) == Some(p))
    }

    fn advance_by(&mut self, n: usize) {
        for _ in 0..n {
            self.advance();
        }
    }

    fn error(&self, message: impl Into<String>) -> LexError {
        LexError {
            message: message.into(),
            line: self.line,
            column: self.column,
            excerpt: self.current_line_excerpt(),
        }
    }

    /// The text of the line the cursor is on, for error display.
    fn current_line_excerpt(&self) -> String {
        let mut start = self.pos.min(self.chars.len());
        while start > 0 && self.chars[start - 1] != '\n' {
            start -= 1;
        }
        let mut end = self.pos.min(self.chars.len());
        while end < self.chars.len() && self.chars[end] != '\n' {
            end += 1;
        }
        self.chars[start..end].iter().collect()
    }

    fn token(&self, kind: TokenKind, text: impl Into<Box<str>>, literal: Option<Literal>, line: u32, column: u32) -> Token {
        Token {
            kind,
            text: text.into(),
            literal,
            line,
            column,
            file_index: self.file_index,
        }
    }

    /// Scans and returns the next token.
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        loop {
            let (line, column) = (self.line, self.column);
            let Some(c) = self.peek() else {
                return Ok(self.token(TokenKind::Eof, "", None, line, column));
            };

            match c {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                '\n' | ';' => {
                    self.advance();
                    if !self.last_was_eol {
                        self.last_was_eol = true;
                        return Ok(self.token(TokenKind::Eol, if c == ';' { ";" } else { "\n" }, None, line, column));
                    }
                }
                '#' => {
                    if self.matches("#IF") && self.peek_at(3).is_some_and(|c| c.is_whitespace()) {
                        self.advance_by(3);
                        self.last_was_eol = false;
                        return Ok(self.token(TokenKind::HashIf, "#IF", None, line, column));
                    }
                    if self.matches("#*") {
                        self.skip_block_comment()?;
                    } else {
                        while self.peek().is_some_and(|c| c != '\n') {
                            self.advance();
                        }
                    }
                }
                _ => {
                    let token = self.lex_nontrivial(line, column)?;
                    self.last_was_eol = false;
                    return Ok(token);
                }
            }
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), LexError> {
        self.advance_by(2);
        let mut depth = 1usize;
        while depth > 0 {
            if self.peek().is_none() {
                return Err(self.error("unterminated block comment"));
            }
            if self.matches("#*") {
                depth += 1;
                self.advance_by(2);
            } else if self.matches("*#") {
                depth -= 1;
                self.advance_by(2);
            } else {
                self.advance();
            }
        }
        Ok(())
    }

    fn lex_nontrivial(&mut self, line: u32, column: u32) -> Result<Token, LexError> {
        let c = self.peek().expect("caller checked non-empty");

        if c.is_ascii_digit() {
            return self.lex_number(line, column);
        }
        if c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
            // `.5` lexes as `0.5`.
            return self.lex_number(line, column);
        }
        if c == 'f' && self.peek_at(1) == Some('"') {
            self.advance();
            return self.lex_fstring(line, column);
        }
        if c.is_ascii_alphabetic() || c == '_' {
            return Ok(self.lex_ident(line, column));
        }

        match c {
            '"' => self.lex_string(line, column),
            '\'' => self.lex_char(line, column),
            '(' => Ok(self.single(TokenKind::LParen, line, column)),
            ')' => Ok(self.single(TokenKind::RParen, line, column)),
            '[' => Ok(self.single(TokenKind::LBracket, line, column)),
            ']' => Ok(self.single(TokenKind::RBracket, line, column)),
            '{' => Ok(self.single(TokenKind::LBrace, line, column)),
            '}' => Ok(self.single(TokenKind::RBrace, line, column)),
            ',' => Ok(self.single(TokenKind::Comma, line, column)),
            ':' => Ok(self.single(TokenKind::Colon, line, column)),
            '<' => Ok(self.lex_less_family(line, column)),
            '|' => Ok(self.lex_table(PIPE_OPS, line, column)),
            '.' => Ok(self.lex_table(DOT_OPS, line, column)),
            '-' => Ok(self.lex_choice(&[("->>", TokenKind::Train), ("->", TokenKind::Arrow), ("--", TokenKind::MinusMinus), ("-=", TokenKind::MinusEq), ("-", TokenKind::Minus)], line, column)),
            '>' => Ok(self.lex_choice(&[("><", TokenKind::Swap), (">=", TokenKind::GreaterEq), (">", TokenKind::Greater)], line, column)),
            '=' => Ok(self.lex_choice(&[("==", TokenKind::EqEq), ("=>", TokenKind::FatArrow), ("=", TokenKind::Assign)], line, column)),
            '!' => Ok(self.lex_choice(&[("!!", TokenKind::Flip), ("!=", TokenKind::NotEq), ("!", TokenKind::Bang)], line, column)),
            '+' => Ok(self.lex_choice(&[("++", TokenKind::PlusPlus), ("+=", TokenKind::PlusEq), ("+", TokenKind::Plus)], line, column)),
            '*' => Ok(self.lex_choice(&[("**", TokenKind::Power), ("*=", TokenKind::StarEq), ("*", TokenKind::Star)], line, column)),
            '/' => Ok(self.lex_choice(&[("/=", TokenKind::SlashEq), ("/", TokenKind::Slash)], line, column)),
            '%' => Ok(self.lex_choice(&[("%=", TokenKind::PercentEq), ("%", TokenKind::Percent)], line, column)),
            '&' => Ok(self.lex_choice(&[("&&", TokenKind::AndAnd), ("&=", TokenKind::AmpEq), ("&", TokenKind::Amp)], line, column)),
            '~' => {
                if self.matches("~>") {
                    self.advance_by(2);
                    Ok(self.token(TokenKind::Compose, "~>", None, line, column))
                } else {
                    Err(self.error("unexpected character `~`"))
                }
            }
            '?' => Ok(self.lex_choice(&[("?:", TokenKind::QuestionColon), ("?", TokenKind::Question)], line, column)),
            _ => Err(self.error(format!("unexpected character `{c}`"))),
        }
    }

    fn single(&mut self, kind: TokenKind, line: u32, column: u32) -> Token {
        let c = self.advance().expect("caller checked non-empty");
        self.token(kind, c.to_string(), None, line, column)
    }

    /// Tries patterns in order (callers list them longest first).
    fn lex_choice(&mut self, table: &[(&str, TokenKind)], line: u32, column: u32) -> Token {
        for &(pattern, kind) in table {
            if self.matches(pattern) {
                self.advance_by(pattern.chars().count());
                return self.token(kind, pattern, None, line, column);
            }
        }
        unreachable!("lex_choice tables end with a single-character fallback")
    }

    fn lex_table(&mut self, table: &[(&str, TokenKind)], line: u32, column: u32) -> Token {
        self.lex_choice(table, line, column)
    }

    /// The `<` family: first the digit forms (`<n|`, `<n?|`, `<n|?`, `<n!|`,
    /// `<n!?|`, `<n?!|`), then the longest-match operator table, falling back
    /// to plain `Less`.
    fn lex_less_family(&mut self, line: u32, column: u32) -> Token {
        if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            let mut len = 1;
            while self.peek_at(len).is_some_and(|c| c.is_ascii_digit()) {
                len += 1;
            }
            let digits: String = (1..len).map(|i| self.peek_at(i).expect("digit scanned")).collect();
            let suffix_kinds: &[(&str, TokenKind)] = &[
                ("!?|", TokenKind::OptionalUniqueAssignN),
                ("?!|", TokenKind::OptionalUniqueAssignN),
                ("!|", TokenKind::UniqueChainAssignN),
                ("?|", TokenKind::OptionalAssignN),
                ("|?", TokenKind::OptionalAssignN),
                ("|", TokenKind::ChainAssignN),
            ];
            for &(suffix, kind) in suffix_kinds {
                let whole: String = std::iter::once('<')
                    .chain(digits.chars())
                    .chain(suffix.chars())
                    .collect();
                if self.matches(&whole) {
                    self.advance_by(whole.chars().count());
                    let n: u32 = digits.parse().expect("digit run parses");
                    return self.token(kind, whole, Some(Literal::Count(n)), line, column);
                }
            }
            // Not an assignment form after all: emit `<` and leave the digits.
            self.advance();
            return self.token(TokenKind::Less, "<", None, line, column);
        }
        self.lex_choice(LESS_OPS, line, column)
    }

    fn lex_ident(&mut self, line: u32, column: u32) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        match keyword(&text) {
            Some(kind) => self.token(kind, text, None, line, column),
            None => self.token(TokenKind::Ident, text, None, line, column),
        }
    }

    fn lex_number(&mut self, line: u32, column: u32) -> Result<Token, LexError> {
        let mut text = String::new();
        let mut digits = String::new();
        let mut is_float = false;

        if self.peek() == Some('.') {
            // Synthetic leading zero for `.5`.
            digits.push_str("0.");
            text.push('.');
            self.advance();
            is_float = true;
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                text.push(c);
                self.advance();
            } else if c == '_' {
                // Cosmetic separator.
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if !is_float && self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            digits.push('.');
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    digits.push(c);
                    text.push(c);
                    self.advance();
                } else if c == '_' {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let mut offset = 1;
            if matches!(self.peek_at(1), Some('+' | '-')) {
                offset = 2;
            }
            if self.peek_at(offset).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                for _ in 0..offset {
                    let c = self.advance().expect("exponent prefix scanned");
                    digits.push(c);
                    text.push(c);
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        digits.push(c);
                        text.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
            }
        }

        if self.peek() == Some('f') && !self.peek_at(1).is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            text.push('f');
            self.advance();
            let value: f32 = digits.parse().map_err(|_| self.error(format!("invalid number `{text}`")))?;
            return Ok(self.token(TokenKind::Number, text, Some(Literal::Float(value)), line, column));
        }

        if is_float {
            let value: f64 = digits.parse().map_err(|_| self.error(format!("invalid number `{text}`")))?;
            return Ok(self.token(TokenKind::Number, text, Some(Literal::Double(value)), line, column));
        }

        let literal = match digits.parse::<i32>() {
            Ok(v) => Literal::Int(v),
            Err(_) => match digits.parse::<i64>() {
                Ok(v) => Literal::Long(v),
                Err(_) => return Err(self.error(format!("integer literal `{text}` out of range"))),
            },
        };
        Ok(self.token(TokenKind::Number, text, Some(literal), line, column))
    }

    fn lex_escape(&mut self) -> Result<char, LexError> {
        let Some(c) = self.advance() else {
            return Err(self.error("unterminated escape sequence"));
        };
        match c {
            '\\' => Ok('\\'),
            '"' => Ok('"'),
            '\'' => Ok('\''),
            'n' => Ok('\n'),
            't' => Ok('\t'),
            'r' => Ok('\r'),
            '0' => Ok('\0'),
            'u' => {
                if self.advance() != Some('{') {
                    return Err(self.error("expected `{` after \\u"));
                }
                let mut hex = String::new();
                loop {
                    match self.advance() {
                        Some('}') => break,
                        Some(h) if h.is_ascii_hexdigit() => hex.push(h),
                        _ => return Err(self.error("invalid \\u{...} escape")),
                    }
                }
                u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| self.error(format!("invalid unicode scalar \\u{{{hex}}}")))
            }
            other => Err(self.error(format!("invalid escape `\\{other}`"))),
        }
    }

    fn lex_string(&mut self, line: u32, column: u32) -> Result<Token, LexError> {
        self.advance();
        let mut value = String::new();
        loop {
            match self.advance() {
                None | Some('\n') => return Err(self.error("unterminated string literal")),
                Some('"') => break,
                Some('\\') => value.push(self.lex_escape()?),
                Some(c) => value.push(c),
            }
        }
        Ok(self.token(TokenKind::Str, value.clone(), Some(Literal::Str(value)), line, column))
    }

    /// F-strings keep their raw body; the parser expands `{…}` spans with a
    /// nested sub-lexer.
    fn lex_fstring(&mut self, line: u32, column: u32) -> Result<Token, LexError> {
        self.advance();
        let mut raw = String::new();
        loop {
            match self.advance() {
                None | Some('\n') => return Err(self.error("unterminated f-string literal")),
                Some('"') => break,
                Some('\\') => {
                    raw.push('\\');
                    match self.advance() {
                        None => return Err(self.error("unterminated f-string literal")),
                        Some(c) => raw.push(c),
                    }
                }
                Some(c) => raw.push(c),
            }
        }
        Ok(self.token(TokenKind::FStr, raw.clone(), Some(Literal::FBody(raw)), line, column))
    }

    fn lex_char(&mut self, line: u32, column: u32) -> Result<Token, LexError> {
        self.advance();
        let c = match self.advance() {
            None | Some('\n') => return Err(self.error("unterminated character literal")),
            Some('\\') => self.lex_escape()?,
            Some(c) => c,
        };
        if self.advance() != Some('\'') {
            return Err(self.error("character literal must contain exactly one character"));
        }
        Ok(self.token(TokenKind::CharLit, c.to_string(), Some(Literal::Char(c)), line, column))
    }
}

/// Unescapes a raw f-string literal chunk with the string-literal escape set.
pub(crate) fn unescape_fstring_chunk(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source, 0)
            .tokenize()
            .expect("lex succeeds")
            .into_iter()
            .map(|t| t.kind)
            .filter(|&k| k != TokenKind::Eof)
            .collect()
    }

    fn single_op(source: &str) -> Token {
        let tokens = Lexer::new(source, 0).tokenize().expect("lex succeeds");
        assert_eq!(tokens.len(), 2, "`{source}` should lex to one token, got {tokens:?}");
        tokens.into_iter().next().expect("one token")
    }

    #[test]
    fn every_operator_lexes_to_exactly_one_token() {
        let table: &[(&str, TokenKind)] = &[
            ("<", TokenKind::Less),
            ("<=", TokenKind::LessEq),
            ("<|", TokenKind::ChainAssignAll),
            ("<==|", TokenKind::CollEq),
            ("<!=|", TokenKind::CollNeq),
            ("<<|", TokenKind::CollLt),
            ("<<=|", TokenKind::CollLe),
            ("<>|", TokenKind::CollGt),
            ("<>=|", TokenKind::CollGe),
            ("<??|", TokenKind::GuardAnd),
            ("<||==|", TokenKind::CollOrEq),
            ("<||!=|", TokenKind::CollOrNeq),
            ("<||<|", TokenKind::CollOrLt),
            ("<||<=|", TokenKind::CollOrLe),
            ("<||>|", TokenKind::CollOrGt),
            ("<||>=|", TokenKind::CollOrGe),
            ("<||??|", TokenKind::GuardOr),
            ("<~|", TokenKind::SeqAssign),
            ("<~?|", TokenKind::SeqAssignNil),
            ("|", TokenKind::BitPipe),
            ("|>", TokenKind::PipeOp),
            ("|?", TokenKind::OptPipe),
            ("|??", TokenKind::GuardPipe),
            ("|>>", TokenKind::MapPipe),
            ("|>>=", TokenKind::ReducePipe),
            ("|~>", TokenKind::ScanPipe),
            ("||", TokenKind::OrOr),
            ("->", TokenKind::Arrow),
            ("=>", TokenKind::FatArrow),
            ("->>", TokenKind::Train),
            ("<<-", TokenKind::TrainEnd),
            ("~>", TokenKind::Compose),
            ("><", TokenKind::Swap),
            ("!!", TokenKind::Flip),
            ("?:", TokenKind::QuestionColon),
            ("**", TokenKind::Power),
            ("..", TokenKind::DotDot),
            ("++", TokenKind::PlusPlus),
            ("--", TokenKind::MinusMinus),
            ("+=", TokenKind::PlusEq),
            ("-=", TokenKind::MinusEq),
            ("*=", TokenKind::StarEq),
            ("/=", TokenKind::SlashEq),
            ("%=", TokenKind::PercentEq),
            ("&=", TokenKind::AmpEq),
            ("==", TokenKind::EqEq),
            ("!=", TokenKind::NotEq),
            (">=", TokenKind::GreaterEq),
            ("&&", TokenKind::AndAnd),
            (".+=", TokenKind::DotPlusEq),
            (".-=", TokenKind::DotMinusEq),
            (".*=", TokenKind::DotStarEq),
            ("./=", TokenKind::DotSlashEq),
            (".%=", TokenKind::DotPercentEq),
        ];
        for &(source, kind) in table {
            let token = single_op(source);
            assert_eq!(token.kind, kind, "operator `{source}`");
            assert_eq!(&*token.text, source, "operator `{source}` must consume itself exactly");
        }
    }

    #[test]
    fn dot_call_forms_fold_the_paren() {
        assert_eq!(kinds(".and(a)"), vec![TokenKind::DotAnd, TokenKind::Ident, TokenKind::RParen]);
        assert_eq!(kinds(".++(x)"), vec![TokenKind::DotInc, TokenKind::Ident, TokenKind::RParen]);
    }

    #[test]
    fn chain_assign_digit_forms() {
        let token = single_op("<2|");
        assert_eq!(token.kind, TokenKind::ChainAssignN);
        assert_eq!(token.count(), 2);

        let token = single_op("<10?|");
        assert_eq!(token.kind, TokenKind::OptionalAssignN);
        assert_eq!(token.count(), 10);

        // Alternative spelling of the optional form.
        let token = single_op("<3|?");
        assert_eq!(token.kind, TokenKind::OptionalAssignN);

        let token = single_op("<2!|");
        assert_eq!(token.kind, TokenKind::UniqueChainAssignN);

        let token = single_op("<2!?|");
        assert_eq!(token.kind, TokenKind::OptionalUniqueAssignN);
        let token = single_op("<2?!|");
        assert_eq!(token.kind, TokenKind::OptionalUniqueAssignN);
    }

    #[test]
    fn less_digit_without_bar_falls_back_to_comparison() {
        assert_eq!(kinds("a<2"), vec![TokenKind::Ident, TokenKind::Less, TokenKind::Number]);
        assert_eq!(
            kinds("a < 2"),
            vec![TokenKind::Ident, TokenKind::Less, TokenKind::Number]
        );
    }

    #[test]
    fn longest_match_wins() {
        // Each prefix of a longer operator must not split it.
        assert_eq!(kinds("<||==|").len(), 1);
        assert_eq!(kinds("|>>=").len(), 1);
        assert_eq!(kinds("<<=|").len(), 1);
        // But genuinely separate tokens still split.
        assert_eq!(kinds("a<=b"), vec![TokenKind::Ident, TokenKind::LessEq, TokenKind::Ident]);
    }

    #[test]
    fn numbers() {
        let t = single_op("42");
        assert_eq!(t.literal, Some(Literal::Int(42)));
        let t = single_op("1_000_000");
        assert_eq!(t.literal, Some(Literal::Int(1_000_000)));
        let t = single_op("5000000000");
        assert_eq!(t.literal, Some(Literal::Long(5_000_000_000)));
        let t = single_op("2.5");
        assert_eq!(t.literal, Some(Literal::Double(2.5)));
        let t = single_op(".5");
        assert_eq!(t.literal, Some(Literal::Double(0.5)));
        let t = single_op("1e3");
        assert_eq!(t.literal, Some(Literal::Double(1000.0)));
        let t = single_op("1.5f");
        assert_eq!(t.literal, Some(Literal::Float(1.5)));
    }

    #[test]
    fn strings_chars_and_escapes() {
        let t = single_op(r#""a\nb""#);
        assert_eq!(t.literal, Some(Literal::Str("a\nb".to_owned())));
        let t = single_op(r"'\t'");
        assert_eq!(t.literal, Some(Literal::Char('\t')));
        let t = single_op(r#""\u{1F600}""#);
        assert_eq!(t.literal, Some(Literal::Str("\u{1F600}".to_owned())));
    }

    #[test]
    fn fstring_keeps_raw_body() {
        let t = single_op(r#"f"x = {x + 1}!""#);
        assert_eq!(t.kind, TokenKind::FStr);
        assert_eq!(t.literal, Some(Literal::FBody("x = {x + 1}!".to_owned())));
    }

    #[test]
    fn eols_collapse_and_semicolons_normalize() {
        assert_eq!(
            kinds("a\n\n\nb;;c"),
            vec![
                TokenKind::Ident,
                TokenKind::Eol,
                TokenKind::Ident,
                TokenKind::Eol,
                TokenKind::Ident,
            ]
        );
    }

    #[test]
    fn comments_nest() {
        assert_eq!(kinds("a #* outer #* inner *# still *# b"), vec![TokenKind::Ident, TokenKind::Ident]);
        assert_eq!(kinds("a # trailing\nb"), vec![TokenKind::Ident, TokenKind::Eol, TokenKind::Ident]);
    }

    #[test]
    fn hash_if_token() {
        assert_eq!(kinds("#IF DEBUG {"), vec![TokenKind::HashIf, TokenKind::Ident, TokenKind::LBrace]);
    }

    #[test]
    fn unterminated_string_is_a_lex_error() {
        let err = Lexer::new("\"abc", 0).tokenize().unwrap_err();
        assert!(err.message.contains("unterminated"));
        assert_eq!(err.line, 1);
    }
}
