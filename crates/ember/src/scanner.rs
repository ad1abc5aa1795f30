//! The scanner: source text to tokens, on demand.
//!
//! Tokens borrow their lexemes from the source buffer. String interpolation
//! is handled here: on `${` inside a string the scanner emits an
//! `Interpolation` token covering the text so far and switches back to
//! normal scanning; the matching `}` resumes string scanning. The compiler
//! stitches the pieces into a concatenation.

/// Maximum nesting depth of `${…}` interpolation.
const MAX_INTERPOLATION_DEPTH: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Minus,
    Plus,
    Colon,
    Semicolon,
    Slash,
    Star,
    Percent,
    // One or two character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    // Literals.
    Identifier,
    String,
    /// A string segment terminated by `${`; more of the string follows.
    Interpolation,
    Int,
    Float,
    // Keywords.
    And,
    Async,
    Await,
    Case,
    Catch,
    Class,
    Default,
    Else,
    False,
    Finally,
    For,
    Fun,
    If,
    Namespace,
    Nil,
    Or,
    Print,
    Return,
    Static,
    Super,
    Switch,
    This,
    Throw,
    Trait,
    True,
    Try,
    Val,
    Var,
    While,
    With,
    Yield,
    // Sentinels.
    Error,
    Eof,
}

/// One token. For `Error` tokens the lexeme is the error message.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: u32,
}

impl<'src> Token<'src> {
    pub fn synthetic(lexeme: &'src str) -> Self {
        Self { kind: TokenKind::Identifier, lexeme, line: 0 }
    }
}

/// Scanner state over a source buffer.
#[derive(Debug)]
pub(crate) struct Scanner<'src> {
    source: &'src str,
    start: usize,
    current: usize,
    line: u32,
    interpolation_depth: u8,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Self { source, start: 0, current: 0, line: 1, interpolation_depth: 0 }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        if let Some(error) = self.skip_whitespace() {
            return error;
        }
        self.start = self.current;
        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => {
                if self.interpolation_depth > 0 {
                    // Closing an interpolation: resume scanning the string.
                    self.interpolation_depth -= 1;
                    self.start = self.current;
                    return self.string();
                }
                self.make_token(TokenKind::RightBrace)
            }
            b'[' => self.make_token(TokenKind::LeftBracket),
            b']' => self.make_token(TokenKind::RightBracket),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'-' => self.make_token(TokenKind::Minus),
            b'+' => self.make_token(TokenKind::Plus),
            b':' => self.make_token(TokenKind::Colon),
            b';' => self.make_token(TokenKind::Semicolon),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'%' => self.make_token(TokenKind::Percent),
            b'!' => {
                let kind = if self.match_byte(b'=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.make_token(kind)
            }
            b'=' => {
                let kind = if self.match_byte(b'=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.make_token(kind)
            }
            b'<' => {
                let kind = if self.match_byte(b'=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.make_token(kind)
            }
            b'>' => {
                let kind =
                    if self.match_byte(b'=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.make_token(kind)
            }
            b'"' => {
                self.start = self.current;
                self.string()
            }
            b'`' => self.keyword_identifier(),
            _ if c.is_ascii_digit() => self.number(),
            _ if is_identifier_start(c) => self.identifier(),
            _ => self.error_token("Unexpected character."),
        }
    }

    // === Character helpers ===

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> u8 {
        let byte = self.source.as_bytes()[self.current];
        self.current += 1;
        byte
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() { 0 } else { self.source.as_bytes()[self.current] }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.source.len() {
            0
        } else {
            self.source.as_bytes()[self.current + 1]
        }
    }

    fn peek_previous(&self) -> u8 {
        if self.current == 0 { 0 } else { self.source.as_bytes()[self.current - 1] }
    }

    fn match_byte(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.peek() != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token { kind, lexeme: &self.source[self.start..self.current], line: self.line }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token { kind: TokenKind::Error, lexeme: message, line: self.line }
    }

    /// Skips whitespace, line comments, and nested block comments.
    /// Returns an error token for an unterminated block comment.
    fn skip_whitespace(&mut self) -> Option<Token<'src>> {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.current += 1;
                }
                b'\n' => {
                    self.line += 1;
                    self.current += 1;
                }
                b'/' => {
                    if self.peek_next() == b'/' {
                        while self.peek() != b'\n' && !self.is_at_end() {
                            self.current += 1;
                        }
                    } else if self.peek_next() == b'*' {
                        self.current += 2;
                        let mut depth = 1u32;
                        while depth > 0 {
                            if self.is_at_end() {
                                return Some(self.error_token("Unterminated block comment."));
                            }
                            match self.peek() {
                                b'\n' => self.line += 1,
                                b'/' if self.peek_next() == b'*' => {
                                    depth += 1;
                                    self.current += 1;
                                }
                                b'*' if self.peek_next() == b'/' => {
                                    depth -= 1;
                                    self.current += 1;
                                }
                                _ => {}
                            }
                            self.current += 1;
                        }
                    } else {
                        return None;
                    }
                }
                _ => return None,
            }
        }
    }

    // === Literals ===

    fn string(&mut self) -> Token<'src> {
        while !self.is_at_end() && (self.peek() != b'"' || self.peek_previous() == b'\\') {
            if self.peek() == b'\n' {
                self.line += 1;
            } else if self.peek() == b'$' && self.peek_next() == b'{' {
                if self.interpolation_depth >= MAX_INTERPOLATION_DEPTH {
                    return self.error_token("Interpolation may only nest 15 levels deep.");
                }
                self.interpolation_depth += 1;
                let token = Token {
                    kind: TokenKind::Interpolation,
                    lexeme: &self.source[self.start..self.current],
                    line: self.line,
                };
                self.current += 2;
                return token;
            }
            self.current += 1;
        }

        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }
        let token = Token {
            kind: TokenKind::String,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        };
        // Consume the closing quote.
        self.current += 1;
        token
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.current += 1;
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.current += 1;
            while self.peek().is_ascii_digit() {
                self.current += 1;
            }
            return self.make_token(TokenKind::Float);
        }
        self.make_token(TokenKind::Int)
    }

    fn identifier(&mut self) -> Token<'src> {
        while is_identifier_continue(self.peek()) {
            self.current += 1;
        }
        self.make_token(self.identifier_kind())
    }

    /// A backtick-delimited identifier: the quoted text is the name, so
    /// keywords can be used as plain identifiers.
    fn keyword_identifier(&mut self) -> Token<'src> {
        self.start = self.current;
        while self.peek() != b'`' && !self.is_at_end() {
            if self.peek() == b'\n' {
                return self.error_token("Keyword identifiers may not span lines.");
            }
            self.current += 1;
        }
        if self.is_at_end() {
            return self.error_token("Unterminated keyword identifier.");
        }
        let token = Token {
            kind: TokenKind::Identifier,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        };
        self.current += 1;
        token
    }

    /// Keyword recognition: switch on the first letter, then verify the rest.
    fn identifier_kind(&self) -> TokenKind {
        let lexeme = &self.source[self.start..self.current];
        let bytes = lexeme.as_bytes();
        match bytes[0] {
            b'a' => match bytes.get(1) {
                Some(b'n') => check_keyword(lexeme, "and", TokenKind::And),
                Some(b's') => check_keyword(lexeme, "async", TokenKind::Async),
                Some(b'w') => check_keyword(lexeme, "await", TokenKind::Await),
                _ => TokenKind::Identifier,
            },
            b'c' => match bytes.get(1) {
                Some(b'a') => match bytes.get(2) {
                    Some(b's') => check_keyword(lexeme, "case", TokenKind::Case),
                    Some(b't') => check_keyword(lexeme, "catch", TokenKind::Catch),
                    _ => TokenKind::Identifier,
                },
                Some(b'l') => check_keyword(lexeme, "class", TokenKind::Class),
                _ => TokenKind::Identifier,
            },
            b'd' => check_keyword(lexeme, "default", TokenKind::Default),
            b'e' => check_keyword(lexeme, "else", TokenKind::Else),
            b'f' => match bytes.get(1) {
                Some(b'a') => check_keyword(lexeme, "false", TokenKind::False),
                Some(b'i') => check_keyword(lexeme, "finally", TokenKind::Finally),
                Some(b'o') => check_keyword(lexeme, "for", TokenKind::For),
                Some(b'u') => check_keyword(lexeme, "fun", TokenKind::Fun),
                _ => TokenKind::Identifier,
            },
            b'i' => check_keyword(lexeme, "if", TokenKind::If),
            b'n' => match bytes.get(1) {
                Some(b'a') => check_keyword(lexeme, "namespace", TokenKind::Namespace),
                Some(b'i') => check_keyword(lexeme, "nil", TokenKind::Nil),
                _ => TokenKind::Identifier,
            },
            b'o' => check_keyword(lexeme, "or", TokenKind::Or),
            b'p' => check_keyword(lexeme, "print", TokenKind::Print),
            b'r' => check_keyword(lexeme, "return", TokenKind::Return),
            b's' => match bytes.get(1) {
                Some(b't') => check_keyword(lexeme, "static", TokenKind::Static),
                Some(b'u') => check_keyword(lexeme, "super", TokenKind::Super),
                Some(b'w') => check_keyword(lexeme, "switch", TokenKind::Switch),
                _ => TokenKind::Identifier,
            },
            b't' => match bytes.get(1) {
                Some(b'h') => match bytes.get(2) {
                    Some(b'i') => check_keyword(lexeme, "this", TokenKind::This),
                    Some(b'r') => check_keyword(lexeme, "throw", TokenKind::Throw),
                    _ => TokenKind::Identifier,
                },
                Some(b'r') => match bytes.get(2) {
                    Some(b'a') => check_keyword(lexeme, "trait", TokenKind::Trait),
                    Some(b'u') => check_keyword(lexeme, "true", TokenKind::True),
                    Some(b'y') => check_keyword(lexeme, "try", TokenKind::Try),
                    _ => TokenKind::Identifier,
                },
                _ => TokenKind::Identifier,
            },
            b'v' => match bytes.get(1) {
                Some(b'a') => match bytes.get(2) {
                    Some(b'l') => check_keyword(lexeme, "val", TokenKind::Val),
                    Some(b'r') => check_keyword(lexeme, "var", TokenKind::Var),
                    _ => TokenKind::Identifier,
                },
                _ => TokenKind::Identifier,
            },
            b'w' => match bytes.get(1) {
                Some(b'h') => check_keyword(lexeme, "while", TokenKind::While),
                Some(b'i') => check_keyword(lexeme, "with", TokenKind::With),
                _ => TokenKind::Identifier,
            },
            b'y' => check_keyword(lexeme, "yield", TokenKind::Yield),
            _ => TokenKind::Identifier,
        }
    }
}

fn check_keyword(lexeme: &str, keyword: &str, kind: TokenKind) -> TokenKind {
    if lexeme == keyword { kind } else { TokenKind::Identifier }
}

fn is_identifier_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_identifier_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut out = Vec::new();
        loop {
            let token = scanner.scan_token();
            let kind = token.kind;
            out.push(kind);
            if kind == TokenKind::Eof || kind == TokenKind::Error {
                return out;
            }
        }
    }

    #[test]
    fn scans_punctuation_and_numbers() {
        assert_eq!(
            kinds("1 + 2.5 * x;"),
            vec![
                TokenKind::Int,
                TokenKind::Plus,
                TokenKind::Float,
                TokenKind::Star,
                TokenKind::Identifier,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn float_requires_digit_after_dot() {
        // `1.` scans as Int then Dot, not as a float literal.
        assert_eq!(
            kinds("1.foo"),
            vec![TokenKind::Int, TokenKind::Dot, TokenKind::Identifier, TokenKind::Eof]
        );
    }

    #[test]
    fn recognizes_keywords_and_near_misses() {
        assert_eq!(kinds("class")[0], TokenKind::Class);
        assert_eq!(kinds("classes")[0], TokenKind::Identifier);
        assert_eq!(kinds("trait")[0], TokenKind::Trait);
        assert_eq!(kinds("try")[0], TokenKind::Try);
        assert_eq!(kinds("yield")[0], TokenKind::Yield);
        assert_eq!(kinds("namespace")[0], TokenKind::Namespace);
        assert_eq!(kinds("val")[0], TokenKind::Val);
        assert_eq!(kinds("await")[0], TokenKind::Await);
    }

    #[test]
    fn backtick_identifier_carries_keyword_text() {
        let mut scanner = Scanner::new("`class`");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Identifier);
        assert_eq!(token.lexeme, "class");
    }

    #[test]
    fn interpolation_splits_string_into_segments() {
        let mut scanner = Scanner::new(r#""a ${x} b""#);
        let first = scanner.scan_token();
        assert_eq!(first.kind, TokenKind::Interpolation);
        assert_eq!(first.lexeme, "a ");
        let x = scanner.scan_token();
        assert_eq!(x.kind, TokenKind::Identifier);
        let rest = scanner.scan_token();
        assert_eq!(rest.kind, TokenKind::String);
        assert_eq!(rest.lexeme, " b");
        assert_eq!(scanner.scan_token().kind, TokenKind::Eof);
    }

    #[test]
    fn nested_block_comments_track_lines() {
        let mut scanner = Scanner::new("/* outer /* inner\n */ still */ x");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Identifier);
        assert_eq!(token.line, 2);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let mut scanner = Scanner::new("\"oops");
        let token = scanner.scan_token();
        assert_eq!(token.kind, TokenKind::Error);
        assert_eq!(token.lexeme, "Unterminated string.");
    }
}
