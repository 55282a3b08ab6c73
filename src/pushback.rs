//! Pushback layer over the raw lexer: file-inclusion stack, `#pragma once`
//! suppression, and `#line` adjustments.
//!
//! Grounded on `original_source/src/preprocessor/directives.c`'s file-level
//! `next()`/`push()` pair and its `line_diff`/`new_filename` statics —
//! spec.md §9 asks that these become fields of an owning object instead of
//! module statics, which is what `TokenStream` is.

use std::collections::HashSet;
use std::rc::Rc;

use crate::error::CompileError;
use crate::lexer::Lexer;
use crate::token::Token;

struct FileFrame {
    lexer: Lexer,
    canonical_path: Rc<str>,
    /// `#line`-introduced offset and filename override, active only
    /// while this frame is the current one; cleared when it is popped
    /// or a new file is pushed (spec.md §4.1).
    line_delta: i64,
    filename_override: Option<Rc<str>>,
}

pub struct TokenStream {
    stack: Vec<FileFrame>,
    pushed: [Option<Token>; 2],
    pushed_len: usize,
    once_seen: HashSet<String>,
}

impl TokenStream {
    pub fn new(source: &str, path: impl Into<Rc<str>>) -> Self {
        let path: Rc<str> = path.into();
        TokenStream {
            stack: vec![FileFrame {
                lexer: Lexer::new(source, path.clone()),
                canonical_path: path,
                line_delta: 0,
                filename_override: None,
            }],
            pushed: [None, None],
            pushed_len: 0,
            once_seen: HashSet::new(),
        }
    }

    /// Push an included file's source on top of the stack. Any `#line`
    /// adjustment on the including file stays recorded on its frame and
    /// simply isn't visible while the included file is active.
    pub fn push_include(&mut self, source: &str, canonical_path: String) -> Result<(), CompileError> {
        if self.once_seen.contains(&canonical_path) {
            return Ok(());
        }
        let path: Rc<str> = canonical_path.clone().into();
        self.stack.push(FileFrame {
            lexer: Lexer::new(source, path.clone()),
            canonical_path: path,
            line_delta: 0,
            filename_override: None,
        });
        Ok(())
    }

    pub fn disable_current_path(&mut self) {
        if let Some(top) = self.stack.last() {
            self.once_seen.insert(top.canonical_path.to_string());
        }
    }

    pub fn set_line_adjustment(&mut self, new_line: i64, filename: Option<Rc<str>>, current_line: u32) {
        if let Some(top) = self.stack.last_mut() {
            top.line_delta = new_line - current_line as i64 - 1;
            if let Some(f) = filename {
                top.filename_override = Some(f);
            }
        }
    }

    pub fn push(&mut self, t: Token) {
        assert!(self.pushed_len < 2, "pushed too many tokens");
        self.pushed[self.pushed_len] = Some(t);
        self.pushed_len += 1;
    }

    /// Lex a `<...>`/`"..."` header-name token from the current frame.
    /// Only valid to call immediately after consuming an `#include`
    /// identifier, before any other token has been pulled.
    pub fn next_header_name(&mut self) -> Result<Token, CompileError> {
        assert!(self.pushed_len == 0, "header name requested with pending pushback");
        let top = self.stack.last_mut().expect("token stream has no active frame");
        let mut tok = top.lexer.next_header_name()?;
        if top.line_delta != 0 {
            tok.pos.line = (tok.pos.line as i64 + top.line_delta).max(0) as u32;
        }
        if let Some(f) = top.filename_override.clone() {
            tok.pos.path = f;
        }
        Ok(tok)
    }

    /// The canonical path of the file currently being read, for resolving
    /// `#include "..."` relative to the including file's directory.
    pub fn current_path(&self) -> &str {
        &self.stack.last().expect("token stream has no active frame").canonical_path
    }

    pub fn next(&mut self) -> Result<Token, CompileError> {
        if self.pushed_len > 0 {
            self.pushed_len -= 1;
            return Ok(self.pushed[self.pushed_len].take().unwrap());
        }

        loop {
            let top = match self.stack.last_mut() {
                Some(t) => t,
                None => {
                    // Exhausted every frame: synthesize EOF from an empty lexer.
                    let mut empty = Lexer::new("", "<eof>");
                    return empty.next_token();
                }
            };
            let mut tok = top.lexer.next_token()?;
            if tok.is_eof() && self.stack.len() > 1 {
                self.stack.pop();
                continue;
            }
            let line_delta = top.line_delta;
            let filename_override = top.filename_override.clone();
            if line_delta != 0 {
                tok.pos.line = (tok.pos.line as i64 + line_delta).max(0) as u32;
            }
            if let Some(f) = filename_override {
                tok.pos.path = f;
            }
            return Ok(tok);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_next_returns_same_token() {
        let mut ts = TokenStream::new("a b c", "t.c");
        let t = ts.next().unwrap();
        ts.push(t.clone());
        let t2 = ts.next().unwrap();
        assert_eq!(t.text_str(), t2.text_str());
    }

    #[test]
    fn include_pops_back_to_parent() {
        let mut ts = TokenStream::new("a", "outer.c");
        ts.push_include("b", "inner.c".to_string()).unwrap();
        let first = ts.next().unwrap();
        assert_eq!(&*first.text_str(), "b");
        let second = ts.next().unwrap();
        assert_eq!(&*second.text_str(), "a");
    }

    #[test]
    fn pragma_once_suppresses_reinclusion() {
        let mut ts = TokenStream::new("a", "outer.c");
        ts.disable_current_path_for_test("inner.c");
        ts.push_include("b", "inner.c".to_string()).unwrap();
        let first = ts.next().unwrap();
        assert_eq!(&*first.text_str(), "a");
    }

    impl TokenStream {
        fn disable_current_path_for_test(&mut self, path: &str) {
            self.once_seen.insert(path.to_string());
        }
    }

    #[test]
    fn line_directive_shifts_reported_line() {
        let mut ts = TokenStream::new("a\nb\nc", "t.c");
        let _ = ts.next().unwrap(); // a, line 1
        ts.set_line_adjustment(100, None, 1);
        let t = ts.next().unwrap(); // b, originally line 2
        assert_eq!(t.pos.line, 100);
    }
}
