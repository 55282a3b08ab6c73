//! Macro table and expansion: object-like and function-like macros,
//! `#`/`##`, `__VA_ARGS__`, and hide-set bookkeeping.
//!
//! Grounded on `original_source/src/preprocessor/directives.c`'s
//! `directiver_define` (parameter-list and replacement-list parsing) and
//! the macro-expansion description in spec.md §4.2. Hide sets follow the
//! simplified rule spec.md gives explicitly ("the name being expanded is
//! added to the hide_set of the output"), not the full Dave Prosser
//! intersection algorithm.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::CompileError;
use crate::lexer::Lexer;
use crate::token::{intern, resolve, Encoding, HideSet, Symbol, Token, TokenKind};

#[derive(Debug, Clone)]
pub struct Define {
    pub name: Symbol,
    pub func_like: bool,
    pub variadic: bool,
    pub params: Vec<Symbol>,
    pub replacement: Vec<Token>,
}

#[derive(Debug, Default)]
pub struct DefineMap {
    map: HashMap<Symbol, Define>,
}

impl DefineMap {
    pub fn new() -> Self {
        DefineMap::default()
    }

    pub fn insert(&mut self, def: Define) {
        self.map.insert(def.name, def);
    }

    pub fn remove(&mut self, name: Symbol) {
        self.map.remove(&name);
    }

    pub fn get(&self, name: Symbol) -> Option<&Define> {
        self.map.get(&name)
    }

    pub fn is_defined(&self, name: Symbol) -> bool {
        self.map.contains_key(&name)
    }
}

/// A pull source for tokens used during macro expansion: either the live
/// preprocessor stream (for ordinary text) or a fixed in-memory buffer
/// (for `#if` lines and macro arguments, which are closed worlds).
pub trait Cursor {
    fn next(&mut self) -> Result<Token, CompileError>;
    fn push(&mut self, t: Token);
}

/// A closed-world token buffer, used for macro arguments and `#if` lines.
pub struct VecCursor {
    buf: VecDeque<Token>,
    eof_pos: crate::token::SourcePos,
}

impl VecCursor {
    pub fn new(tokens: Vec<Token>, eof_pos: crate::token::SourcePos) -> Self {
        VecCursor {
            buf: tokens.into(),
            eof_pos,
        }
    }
}

impl Cursor for VecCursor {
    fn next(&mut self) -> Result<Token, CompileError> {
        Ok(self
            .buf
            .pop_front()
            .unwrap_or_else(|| Token::new(TokenKind::Eof, intern(""), self.eof_pos.clone())))
    }

    fn push(&mut self, t: Token) {
        self.buf.push_front(t);
    }
}

fn param_index(def: &Define, t: &Token) -> Option<usize> {
    if !t.is_ident() {
        return None;
    }
    if let Some(i) = def.params.iter().position(|&p| p == t.text) {
        return Some(i);
    }
    if def.variadic && &*t.text_str() == "__VA_ARGS__" {
        return Some(def.params.len());
    }
    None
}

/// Collect a function-like macro's argument list. The opening `(` has
/// already been consumed by the caller.
pub fn collect_arguments<C: Cursor>(cursor: &mut C, def: &Define) -> Result<Vec<Vec<Token>>, CompileError> {
    let named = def.params.len();
    let mut args: Vec<Vec<Token>> = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0i32;

    loop {
        let t = cursor.next()?;
        if t.is_eof() {
            return Err(CompileError::diag(t.pos, "unterminated macro argument list"));
        }
        if t.is_punct("(") {
            depth += 1;
            current.push(t);
        } else if t.is_punct(")") {
            if depth == 0 {
                args.push(current);
                break;
            }
            depth -= 1;
            current.push(t);
        } else if t.is_punct(",") && depth == 0 && !(def.variadic && args.len() >= named) {
            args.push(std::mem::take(&mut current));
        } else {
            current.push(t);
        }
    }

    if named == 0 && !def.variadic && args.len() == 1 && args[0].is_empty() {
        args.clear();
    }
    Ok(args)
}

fn stringify(toks: &[Token]) -> String {
    let mut s = String::new();
    for (i, t) in toks.iter().enumerate() {
        if i > 0 && t.preceded_by_space {
            s.push(' ');
        }
        match &t.kind {
            TokenKind::StringLiteral(bytes, _) => {
                s.push('"');
                for &b in bytes {
                    if b == b'"' || b == b'\\' {
                        s.push('\\');
                    }
                    s.push(b as char);
                }
                s.push('"');
            }
            _ => s.push_str(&t.text_str()),
        }
    }
    s
}

fn paste(lhs: &Token, rhs: Option<&Token>) -> Result<Token, CompileError> {
    let rhs = match rhs {
        None => return Ok(lhs.clone()),
        Some(r) => r,
    };
    let combined = format!("{}{}", lhs.text_str(), rhs.text_str());
    let mut lx = Lexer::new(&combined, lhs.pos.path.clone());
    let mut pasted = lx
        .next_token()
        .map_err(|_| CompileError::diag(lhs.pos.clone(), format!("invalid token pasting '{}'", combined)))?;
    pasted.pos = lhs.pos.clone();
    Ok(pasted)
}

/// Substitute a macro's replacement list against its (already-parsed,
/// not-yet-expanded) arguments, handling `#`, `##`, and `__VA_ARGS__`.
pub fn substitute(
    def: &Define,
    args: &[Vec<Token>],
    defines: &DefineMap,
    invocation_hide: &Rc<HideSet>,
) -> Result<Vec<Token>, CompileError> {
    let new_hide = invocation_hide.with(def.name);
    let repl = &def.replacement;
    let mut out: Vec<Token> = Vec::new();
    let mut i = 0usize;

    while i < repl.len() {
        let t = &repl[i];

        if t.is_punct("#") && i + 1 < repl.len() {
            if let Some(idx) = param_index(def, &repl[i + 1]) {
                let text = stringify(args.get(idx).map(|v| v.as_slice()).unwrap_or(&[]));
                out.push(Token::new(
                    TokenKind::StringLiteral(text.clone().into_bytes(), Encoding::None),
                    intern(&text),
                    t.pos.clone(),
                ));
                i += 2;
                continue;
            }
        }

        if t.is_punct("##") {
            let rhs_tok = &repl[i + 1];
            let rhs_tokens: Vec<Token> = if let Some(idx) = param_index(def, rhs_tok) {
                args.get(idx).cloned().unwrap_or_default()
            } else {
                vec![rhs_tok.clone()]
            };
            let lhs = out.pop();
            match lhs {
                Some(lhs) => {
                    let pasted = paste(&lhs, rhs_tokens.first())?;
                    out.push(pasted);
                    out.extend(rhs_tokens.into_iter().skip(1));
                }
                None => out.extend(rhs_tokens),
            }
            i += 2;
            continue;
        }

        if let Some(idx) = param_index(def, t) {
            let followed_by_paste = i + 1 < repl.len() && repl[i + 1].is_punct("##");
            let preceded_by_paste = i > 0 && repl[i - 1].is_punct("##");
            let arg = args.get(idx).cloned().unwrap_or_default();
            if followed_by_paste || preceded_by_paste {
                out.extend(arg);
            } else {
                let expanded = expand_token_list(arg, defines)?;
                out.extend(expanded);
            }
            i += 1;
            continue;
        }

        out.push(t.clone());
        i += 1;
    }

    for t in out.iter_mut() {
        t.hide_set = HideSet::union(&t.hide_set, &new_hide);
    }
    Ok(out)
}

/// Fully macro-expand a single identifier occurrence, pulling further
/// tokens from `cursor` as needed (function-like argument lists, and any
/// trailing tokens required to keep rescanning the replacement).
pub fn expand_identifier<C: Cursor>(
    cursor: &mut C,
    defines: &DefineMap,
    tok: Token,
) -> Result<Vec<Token>, CompileError> {
    let def = match defines.get(tok.text) {
        Some(d) => d.clone(),
        None => return Ok(vec![tok]),
    };

    if !def.func_like {
        let replaced = substitute(&def, &[], defines, &tok.hide_set)?;
        return rescan(cursor, defines, replaced);
    }

    let next = cursor.next()?;
    if !next.is_punct("(") {
        cursor.push(next);
        return Ok(vec![tok]);
    }
    let args = collect_arguments(cursor, &def)?;
    let replaced = substitute(&def, &args, defines, &tok.hide_set)?;
    rescan(cursor, defines, replaced)
}

/// Re-scan a freshly substituted token list: expand any macro-name heads
/// it still contains, recursively, stopping once every token it produced
/// has been accounted for (function-like lookahead may legitimately pull
/// a few tokens beyond that boundary, e.g. `(` found further downstream).
fn rescan<C: Cursor>(cursor: &mut C, defines: &DefineMap, tokens: Vec<Token>) -> Result<Vec<Token>, CompileError> {
    let mut budget = tokens.len();
    for t in tokens.into_iter().rev() {
        cursor.push(t);
    }

    let mut out = Vec::new();
    while budget > 0 {
        let t = cursor.next()?;
        budget = budget.saturating_sub(1);
        if t.is_ident() && !t.hide_set.contains(t.text) && defines.is_defined(t.text) {
            let expanded = expand_identifier(cursor, defines, t)?;
            out.extend(expanded);
        } else {
            out.push(t);
        }
    }
    Ok(out)
}

/// Fully expand a standalone, already-collected token list (macro
/// arguments, `#if` lines, `#line` payloads). Mirrors the original's
/// `expand_token_list` operating over a fixed `buffer`.
pub fn expand_token_list(tokens: Vec<Token>, defines: &DefineMap) -> Result<Vec<Token>, CompileError> {
    let eof_pos = tokens
        .last()
        .map(|t| t.pos.clone())
        .unwrap_or_else(|| crate::token::SourcePos::new("<macro>", 0, 0));
    let mut cursor = VecCursor::new(tokens, eof_pos);
    let mut out = Vec::new();
    loop {
        let t = cursor.next()?;
        if t.is_eof() {
            break;
        }
        if t.is_ident() && !t.hide_set.contains(t.text) && defines.is_defined(t.text) {
            out.extend(expand_identifier(&mut cursor, defines, t)?);
        } else {
            out.push(t);
        }
    }
    Ok(out)
}

pub fn resolve_symbol(sym: Symbol) -> Rc<str> {
    resolve(sym)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SourcePos;

    fn tok(kind: TokenKind, text: &str) -> Token {
        Token::new(kind, intern(text), SourcePos::new("t.c", 1, 1))
    }

    fn ident(s: &str) -> Token {
        tok(TokenKind::Identifier, s)
    }

    fn punct(s: &str) -> Token {
        tok(TokenKind::Punctuator, s)
    }

    fn num(s: &str) -> Token {
        tok(TokenKind::Number, s)
    }

    #[test]
    fn object_like_expansion() {
        let mut defines = DefineMap::new();
        defines.insert(Define {
            name: intern("FOO"),
            func_like: false,
            variadic: false,
            params: vec![],
            replacement: vec![num("1"), punct("+"), num("2")],
        });
        let out = expand_token_list(vec![ident("FOO")], &defines).unwrap();
        let texts: Vec<_> = out.iter().map(|t| t.text_str().to_string()).collect();
        assert_eq!(texts, vec!["1", "+", "2"]);
    }

    #[test]
    fn function_like_square_macro() {
        let mut defines = DefineMap::new();
        let x = intern("x");
        defines.insert(Define {
            name: intern("SQ"),
            func_like: true,
            variadic: false,
            params: vec![x],
            replacement: vec![
                punct("("),
                punct("("),
                ident("x"),
                punct(")"),
                punct("*"),
                punct("("),
                ident("x"),
                punct(")"),
                punct(")"),
            ],
        });
        let input = vec![
            ident("SQ"),
            punct("("),
            num("3"),
            punct("+"),
            num("1"),
            punct(")"),
        ];
        let out = expand_token_list(input, &defines).unwrap();
        let texts: Vec<_> = out.iter().map(|t| t.text_str().to_string()).collect();
        assert_eq!(
            texts,
            vec!["(", "(", "3", "+", "1", ")", "*", "(", "3", "+", "1", ")", ")"]
        );
    }

    #[test]
    fn recursive_macro_does_not_loop() {
        let mut defines = DefineMap::new();
        defines.insert(Define {
            name: intern("REC"),
            func_like: false,
            variadic: false,
            params: vec![],
            replacement: vec![ident("REC"), num("1")],
        });
        let out = expand_token_list(vec![ident("REC")], &defines).unwrap();
        let texts: Vec<_> = out.iter().map(|t| t.text_str().to_string()).collect();
        assert_eq!(texts, vec!["REC", "1"]);
    }

    #[test]
    fn stringify_operator() {
        let mut defines = DefineMap::new();
        let x = intern("x");
        defines.insert(Define {
            name: intern("STR"),
            func_like: true,
            variadic: false,
            params: vec![x],
            replacement: vec![punct("#"), ident("x")],
        });
        let input = vec![ident("STR"), punct("("), ident("hello"), punct(")")];
        let out = expand_token_list(input, &defines).unwrap();
        assert_eq!(out.len(), 1);
        match &out[0].kind {
            TokenKind::StringLiteral(bytes, _) => assert_eq!(bytes, b"hello"),
            _ => panic!("expected string literal"),
        }
    }

    #[test]
    fn paste_operator() {
        let mut defines = DefineMap::new();
        let (a, b) = (intern("a"), intern("b"));
        defines.insert(Define {
            name: intern("CAT"),
            func_like: true,
            variadic: false,
            params: vec![a, b],
            replacement: vec![ident("a"), punct("##"), ident("b")],
        });
        let input = vec![
            ident("CAT"),
            punct("("),
            ident("foo"),
            punct(","),
            ident("bar"),
            punct(")"),
        ];
        let out = expand_token_list(input, &defines).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&*out[0].text_str(), "foobar");
    }

    #[test]
    fn variadic_macro_collects_remaining_args() {
        let mut defines = DefineMap::new();
        defines.insert(Define {
            name: intern("LOG"),
            func_like: true,
            variadic: true,
            params: vec![],
            replacement: vec![ident("__VA_ARGS__")],
        });
        let input = vec![
            ident("LOG"),
            punct("("),
            num("1"),
            punct(","),
            num("2"),
            punct(")"),
        ];
        let out = expand_token_list(input, &defines).unwrap();
        let texts: Vec<_> = out.iter().map(|t| t.text_str().to_string()).collect();
        assert_eq!(texts, vec!["1", ",", "2"]);
    }
}
