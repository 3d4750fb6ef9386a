//! Hand-rolled lexer for karst source text.
//!
//! The [`Lexer`] consumes a source string and produces a flat `Vec<Token>`
//! ending in an [`TokenKind::Eof`] sentinel.  Tokens carry [`SourceLoc`]s for
//! precise error reporting.
//!
//! The surface syntax is s-expressions, so the token set is tiny: parens, the
//! `'` quote sugar, numbers, strings, and symbols.  `;` starts a comment that
//! runs to end-of-line.
//!
//! Lexer errors are collected into a list rather than aborting, so a single
//! pass can report every malformed literal.  Call [`lex`] to get both the
//! token stream and the error list.

use std::rc::Rc;

use crate::token::{SourceLoc, Token, TokenKind};

/// A non-fatal lexical error.  Scanning continues after recording one.
#[derive(Debug, Clone)]
pub struct LexError {
    pub message: String,
    pub loc: SourceLoc,
}

/// Characters that terminate a symbol or number.
fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '\'' | '"' | ';')
}

// ─────────────────────────────────────────────────────────────────────────────
// Lexer struct
// ─────────────────────────────────────────────────────────────────────────────

/// The karst lexical scanner.  Construct with [`Lexer::new`], consume with
/// [`Lexer::scan`].
pub struct Lexer<'src> {
    /// Iterator over the remaining characters.
    chars: std::str::Chars<'src>,
    /// One character of lookahead, or `None` at EOF.
    current: Option<char>,
    /// Shared filename for every produced location.
    file: Rc<str>,
    /// Current source line (1-indexed).
    line: u32,
    /// Current source column in chars (1-indexed).
    col: u32,
    /// Accumulated lex errors.
    errors: Vec<LexError>,
}

impl<'src> Lexer<'src> {
    pub fn new(src: &'src str, file: &str) -> Self {
        let mut chars = src.chars();
        let current = chars.next();
        Self {
            chars,
            current,
            file: Rc::from(file),
            line: 1,
            col: 1,
            errors: Vec::new(),
        }
    }

    /// Run the full scan, returning `(tokens, errors)`.
    pub fn scan(mut self) -> (Vec<Token>, Vec<LexError>) {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            let loc = self.here();
            let Some(c) = self.current else {
                tokens.push(Token::new(TokenKind::Eof, loc));
                break;
            };
            match c {
                '(' => {
                    self.advance();
                    tokens.push(Token::new(TokenKind::LParen, loc));
                }
                ')' => {
                    self.advance();
                    tokens.push(Token::new(TokenKind::RParen, loc));
                }
                '\'' => {
                    self.advance();
                    tokens.push(Token::new(TokenKind::Quote, loc));
                }
                '"' => {
                    if let Some(s) = self.scan_string(&loc) {
                        tokens.push(Token::new(TokenKind::Str(s), loc));
                    }
                }
                _ => tokens.push(self.scan_atom(loc)),
            }
        }
        (tokens, self.errors)
    }

    // ── Cursor helpers ───────────────────────────────────────────────────────

    #[inline]
    fn here(&self) -> SourceLoc {
        SourceLoc::new(self.file.clone(), self.line, self.col)
    }

    /// Consume the current character, updating line/column counters.
    fn advance(&mut self) -> Option<char> {
        let result = self.current;
        self.current = self.chars.next();
        if let Some(ch) = result {
            if ch == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        result
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.current {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some(';') => {
                    while self.current.map(|c| c != '\n').unwrap_or(false) {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    // ── Literals ─────────────────────────────────────────────────────────────

    /// Scan a string literal.  The opening quote has not been consumed yet.
    /// Returns `None` (and records an error) on an unterminated string.
    fn scan_string(&mut self, start: &SourceLoc) -> Option<String> {
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.advance() {
                None => {
                    self.errors.push(LexError {
                        message: "unterminated string literal".to_string(),
                        loc: start.clone(),
                    });
                    return None;
                }
                Some('"') => return Some(text),
                Some('\\') => match self.advance() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('"') => text.push('"'),
                    Some('\\') => text.push('\\'),
                    Some('0') => text.push('\0'),
                    Some(other) => {
                        self.errors.push(LexError {
                            message: format!("unknown escape sequence `\\{other}`"),
                            loc: self.here(),
                        });
                    }
                    None => {
                        self.errors.push(LexError {
                            message: "unterminated string literal".to_string(),
                            loc: start.clone(),
                        });
                        return None;
                    }
                },
                Some(c) => text.push(c),
            }
        }
    }

    /// Scan a number or symbol.  Anything that *looks* numeric (leading
    /// digit, or a sign/dot followed by a digit) must parse as f64; all other
    /// delimiter-free runs are symbols.
    fn scan_atom(&mut self, loc: SourceLoc) -> Token {
        let mut text = String::new();
        while let Some(c) = self.current {
            if is_delimiter(c) {
                break;
            }
            text.push(c);
            self.advance();
        }

        let mut chars = text.chars();
        let first = chars.next().unwrap_or('\0');
        let second = chars.next();
        let looks_numeric = first.is_ascii_digit()
            || (matches!(first, '+' | '-' | '.') && second.map_or(false, |c| c.is_ascii_digit()));

        if looks_numeric {
            match text.parse::<f64>() {
                Ok(n) => Token::new(TokenKind::Number(n), loc),
                Err(_) => {
                    self.errors.push(LexError {
                        message: format!("malformed number `{text}`"),
                        loc: loc.clone(),
                    });
                    Token::new(TokenKind::Number(0.0), loc)
                }
            }
        } else {
            Token::new(TokenKind::Symbol(text), loc)
        }
    }
}

/// Lex a whole source string, returning `(tokens, errors)`.
pub fn lex(src: &str, file: &str) -> (Vec<Token>, Vec<LexError>) {
    Lexer::new(src, file).scan()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
