//! Raw tokenizer: turns a source buffer into a flat stream of `Token`s.
//!
//! Implements exactly the lexical grammar in spec.md §6: identifiers
//! `[A-Za-z_][A-Za-z0-9_]*`, pp-numbers, punctuators, character/string
//! literals with the `L u U u8` prefixes and `\n \t \0 \\ \' \" \xHH \OOO`
//! escapes, and `#` at the start of a logical line introducing a
//! directive. No digraphs or trigraphs (explicit non-goal). Adjacent
//! string literal concatenation happens later, in the preprocessor
//! output stage (spec.md §6), not here.

use std::rc::Rc;

use crate::error::CompileError;
use crate::token::{intern, Encoding, SourcePos, Token, TokenKind};

pub struct Lexer {
    src: Vec<u8>,
    pos: usize,
    line: u32,
    column: u32,
    path: Rc<str>,
    first_of_line: bool,
}

const PUNCTUATORS: &[&str] = &[
    "...", "<<=", ">>=", "->", "++", "--", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "*=",
    "/=", "%=", "+=", "-=", "&=", "^=", "|=", "##", "[", "]", "(", ")", "{", "}", ".", "-", "+",
    "*", "&", "!", "~", "/", "%", "<", ">", "=", "^", "|", ":", ";", ",", "?", "#",
];

impl Lexer {
    pub fn new(source: &str, path: impl Into<Rc<str>>) -> Self {
        Lexer {
            src: source.as_bytes().to_vec(),
            pos: 0,
            line: 1,
            column: 1,
            path: path.into(),
            first_of_line: true,
        }
    }

    fn peek(&self) -> u8 {
        *self.src.get(self.pos).unwrap_or(&0)
    }

    fn peek_at(&self, offset: usize) -> u8 {
        *self.src.get(self.pos + offset).unwrap_or(&0)
    }

    fn bump(&mut self) -> u8 {
        let c = self.peek();
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    fn pos_here(&self) -> SourcePos {
        SourcePos::new(self.path.clone(), self.line, self.column)
    }

    fn skip_line_comment(&mut self) {
        while self.peek() != b'\n' && self.peek() != 0 {
            self.bump();
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), CompileError> {
        let start = self.pos_here();
        self.bump();
        self.bump();
        loop {
            if self.peek() == 0 && self.pos >= self.src.len() {
                return Err(CompileError::diag(start, "unterminated comment"));
            }
            if self.peek() == b'*' && self.peek_at(1) == b'/' {
                self.bump();
                self.bump();
                return Ok(());
            }
            self.bump();
        }
    }

    /// Skip whitespace and comments, returning whether any whitespace
    /// (including a comment, which the standard treats as a single
    /// space) was consumed, and whether a newline was crossed.
    fn skip_trivia(&mut self) -> Result<(bool, bool), CompileError> {
        let mut saw_space = false;
        let mut saw_newline = false;
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' => {
                    self.bump();
                    saw_space = true;
                }
                b'\n' => {
                    self.bump();
                    saw_space = true;
                    saw_newline = true;
                }
                b'\\' if self.peek_at(1) == b'\n' => {
                    // Line splice.
                    self.bump();
                    self.bump();
                    saw_space = true;
                }
                b'/' if self.peek_at(1) == b'/' => {
                    self.skip_line_comment();
                    saw_space = true;
                }
                b'/' if self.peek_at(1) == b'*' => {
                    self.skip_block_comment()?;
                    saw_space = true;
                }
                _ => break,
            }
        }
        Ok((saw_space, saw_newline))
    }

    fn is_ident_start(c: u8) -> bool {
        c.is_ascii_alphabetic() || c == b'_'
    }

    fn is_ident_cont(c: u8) -> bool {
        c.is_ascii_alphanumeric() || c == b'_'
    }

    fn lex_ident_or_prefixed_literal(&mut self) -> Result<Token, CompileError> {
        let start = self.pos_here();
        let begin = self.pos;

        // String/char literal prefixes: L, u, U, u8.
        if matches!(self.peek(), b'L' | b'u' | b'U') {
            let save = self.pos;
            let (save_line, save_col) = (self.line, self.column);
            let mut text = String::new();
            text.push(self.bump() as char);
            if text == "u" && self.peek() == b'8' {
                text.push(self.bump() as char);
            }
            if self.peek() == b'"' {
                return self.lex_string(start, Self::encoding_for(&text));
            }
            if self.peek() == b'\'' {
                return self.lex_char(start, Self::encoding_for(&text));
            }
            self.pos = save;
            self.line = save_line;
            self.column = save_col;
        }

        while Self::is_ident_cont(self.peek()) {
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[begin..self.pos]).unwrap();
        Ok(Token::new(TokenKind::Identifier, intern(text), start))
    }

    fn encoding_for(prefix: &str) -> Encoding {
        match prefix {
            "L" => Encoding::Wide,
            "u" => Encoding::Char16,
            "U" => Encoding::Char32,
            "u8" => Encoding::Utf8,
            _ => Encoding::None,
        }
    }

    /// pp-number: `[.]?[0-9]([.0-9A-Za-z]|[eEpP][+-])*`
    fn lex_number(&mut self) -> Result<Token, CompileError> {
        let start = self.pos_here();
        let begin = self.pos;
        if self.peek() == b'.' {
            self.bump();
        }
        self.bump(); // leading digit
        loop {
            match self.peek() {
                b'e' | b'E' | b'p' | b'P' if matches!(self.peek_at(1), b'+' | b'-') => {
                    self.bump();
                    self.bump();
                }
                c if c == b'.' || c.is_ascii_alphanumeric() => {
                    self.bump();
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.src[begin..self.pos]).unwrap();
        Ok(Token::new(TokenKind::Number, intern(text), start))
    }

    fn read_escape(&mut self, start: &SourcePos) -> Result<u8, CompileError> {
        self.bump(); // consume backslash
        let c = self.bump();
        Ok(match c {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => b'\0',
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'v' => 0x0b,
            b'x' => {
                let mut v: u32 = 0;
                while self.peek().is_ascii_hexdigit() {
                    v = v * 16 + (self.bump() as char).to_digit(16).unwrap();
                }
                v as u8
            }
            c if c.is_ascii_digit() => {
                let mut v: u32 = (c - b'0') as u32;
                for _ in 0..2 {
                    if self.peek().is_ascii_digit() && self.peek() < b'8' {
                        v = v * 8 + (self.bump() - b'0') as u32;
                    }
                }
                v as u8
            }
            other => {
                return Err(CompileError::diag(
                    start.clone(),
                    format!("unknown escape sequence '\\{}'", other as char),
                ))
            }
        })
    }

    fn lex_string(&mut self, start: SourcePos, enc: Encoding) -> Result<Token, CompileError> {
        self.bump(); // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                0 if self.pos >= self.src.len() => {
                    return Err(CompileError::diag(start, "unterminated string literal"))
                }
                b'"' => {
                    self.bump();
                    break;
                }
                b'\\' => bytes.push(self.read_escape(&start)?),
                _ => bytes.push(self.bump()),
            }
        }
        // The raw text is kept (for `#` stringification); the decoded
        // byte payload is carried in the token kind.
        let raw: String = bytes.iter().map(|&b| b as char).collect();
        Ok(Token::new(TokenKind::StringLiteral(bytes, enc), intern(&raw), start))
    }

    fn lex_char(&mut self, start: SourcePos, enc: Encoding) -> Result<Token, CompileError> {
        self.bump(); // opening quote
        let mut value: i64 = 0;
        let mut any = false;
        loop {
            match self.peek() {
                0 if self.pos >= self.src.len() => {
                    return Err(CompileError::diag(start, "unterminated character constant"))
                }
                b'\'' => {
                    self.bump();
                    break;
                }
                b'\\' => {
                    value = self.read_escape(&start)? as i64;
                    any = true;
                }
                _ => {
                    value = self.bump() as i64;
                    any = true;
                }
            }
        }
        if !any {
            return Err(CompileError::diag(start, "empty character constant"));
        }
        Ok(Token::new(
            TokenKind::CharConstant(value, enc),
            intern(&value.to_string()),
            start,
        ))
    }

    fn lex_punctuator(&mut self) -> Result<Token, CompileError> {
        let start = self.pos_here();
        let remaining = &self.src[self.pos..];
        for p in PUNCTUATORS {
            if remaining.starts_with(p.as_bytes()) {
                for _ in 0..p.len() {
                    self.bump();
                }
                return Ok(Token::new(TokenKind::Punctuator, intern(p), start));
            }
        }
        let c = self.bump();
        Err(CompileError::diag(
            start,
            format!("stray character '{}' in program", c as char),
        ))
    }

    /// Produce the next raw token, or `Eof` at end of input.
    pub fn next_token(&mut self) -> Result<Token, CompileError> {
        let (saw_space, saw_newline) = self.skip_trivia()?;
        if saw_newline {
            self.first_of_line = true;
        }

        if self.pos >= self.src.len() {
            let mut t = Token::new(TokenKind::Eof, intern(""), self.pos_here());
            t.first_of_line = self.first_of_line;
            t.preceded_by_space = saw_space;
            return Ok(t);
        }

        let c = self.peek();
        let is_directive_start = c == b'#' && self.first_of_line;

        let mut tok = if Self::is_ident_start(c) {
            self.lex_ident_or_prefixed_literal()?
        } else if c.is_ascii_digit() || (c == b'.' && self.peek_at(1).is_ascii_digit()) {
            self.lex_number()?
        } else if c == b'"' {
            self.lex_string(self.pos_here(), Encoding::None)?
        } else if c == b'\'' {
            self.lex_char(self.pos_here(), Encoding::None)?
        } else {
            self.lex_punctuator()?
        };

        if is_directive_start {
            tok.kind = TokenKind::DirectiveStart;
        }
        tok.first_of_line = self.first_of_line;
        tok.preceded_by_space = saw_space;
        self.first_of_line = false;
        Ok(tok)
    }

    /// Lex a header-name token (`<...>` or `"..."`) immediately following
    /// an `#include`. Must be called by the caller at the right moment
    /// since `<`/`"` are ambiguous with other productions in general
    /// context.
    pub fn next_header_name(&mut self) -> Result<Token, CompileError> {
        self.skip_trivia()?;
        let start = self.pos_here();
        let (close, system) = match self.peek() {
            b'<' => (b'>', true),
            b'"' => (b'"', false),
            _ => return self.next_token(),
        };
        self.bump();
        let begin = self.pos;
        while self.peek() != close {
            if self.pos >= self.src.len() {
                return Err(CompileError::diag(start, "unterminated header name"));
            }
            self.bump();
        }
        let text = std::str::from_utf8(&self.src[begin..self.pos]).unwrap().to_string();
        self.bump();
        let mut tok = Token::new(TokenKind::HeaderName { system }, intern(&text), start);
        tok.first_of_line = false;
        Ok(tok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(src: &str) -> Vec<Token> {
        let mut lx = Lexer::new(src, "test.c");
        let mut out = Vec::new();
        loop {
            let t = lx.next_token().unwrap();
            let eof = t.is_eof();
            out.push(t);
            if eof {
                break;
            }
        }
        out
    }

    #[test]
    fn lexes_identifiers_and_numbers() {
        let toks = lex_all("int x = 42;");
        let texts: Vec<String> = toks
            .iter()
            .filter(|t| !t.is_eof())
            .map(|t| t.text_str().to_string())
            .collect();
        assert_eq!(texts, vec!["int", "x", "=", "42", ";"]);
    }

    #[test]
    fn directive_start_detected() {
        let toks = lex_all("#define X 1\n");
        assert!(matches!(toks[0].kind, TokenKind::DirectiveStart));
        assert!(toks[1].is_ident_named("define"));
    }

    #[test]
    fn string_escape_embeds_nul() {
        let toks = lex_all(r#""ABC\0\0\0DEF""#);
        match &toks[0].kind {
            TokenKind::StringLiteral(bytes, _) => {
                assert_eq!(bytes, b"ABC\0\0\0DEF");
            }
            _ => panic!("expected string literal"),
        }
    }

    #[test]
    fn line_comment_becomes_whitespace() {
        let toks = lex_all("a // comment\nb");
        assert!(toks[1].preceded_by_space);
        assert!(toks[1].first_of_line);
    }

    #[test]
    fn multi_char_punctuators_prefer_longest_match() {
        let toks = lex_all("a <<= b");
        assert_eq!(&*toks[1].text_str(), "<<=");
    }
}
