//! Token representation, source positions, and string interning.
//!
//! Grounded on `original_source/src/preprocessor/token_list.h` and the
//! lexical grammar in spec.md §6. Interning turns repeated identifier and
//! string spellings into cheap `Symbol` copies so the preprocessor can
//! compare token text by integer equality during macro expansion.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// An interned string. Equality is by content (two `Symbol`s with the
/// same text always carry the same id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(pub u32);

#[derive(Debug, Default)]
pub struct Interner {
    map: HashMap<Rc<str>, u32>,
    strings: Vec<Rc<str>>,
}

impl Interner {
    pub fn new() -> Self {
        Interner::default()
    }

    pub fn intern(&mut self, s: &str) -> Symbol {
        if let Some(&id) = self.map.get(s) {
            return Symbol(id);
        }
        let id = self.strings.len() as u32;
        let rc: Rc<str> = Rc::from(s);
        self.strings.push(rc.clone());
        self.map.insert(rc, id);
        Symbol(id)
    }

    pub fn resolve(&self, sym: Symbol) -> &str {
        &self.strings[sym.0 as usize]
    }
}

thread_local! {
    static GLOBAL: RefCell<Interner> = RefCell::new(Interner::new());
}

/// Intern a string against the thread-local interner. Token text, macro
/// names and identifiers all funnel through here so that equal spellings
/// always collapse to the same `Symbol`.
pub fn intern(s: &str) -> Symbol {
    GLOBAL.with(|i| i.borrow_mut().intern(s))
}

pub fn resolve(sym: Symbol) -> Rc<str> {
    GLOBAL.with(|i| Rc::from(i.borrow().resolve(sym)))
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", resolve(*self))
    }
}

/// A position in (possibly `#line`-adjusted) source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePos {
    pub path: Rc<str>,
    pub line: u32,
    pub column: u32,
}

impl SourcePos {
    pub fn new(path: impl Into<Rc<str>>, line: u32, column: u32) -> Self {
        SourcePos {
            path: path.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.path, self.line, self.column)
    }
}

/// String-literal encoding prefix, per spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    None,
    Wide,  // L
    Char16, // u
    Char32, // U
    Utf8,  // u8
}

impl Encoding {
    /// Widening promotes the weaker encoding to the stronger one when
    /// adjacent string literals are concatenated (spec.md §6).
    pub fn promote(self, other: Encoding) -> Encoding {
        use Encoding::*;
        match (self, other) {
            (None, x) => x,
            (x, None) => x,
            (x, y) if x == y => x,
            // Any wide prefix wins over a plainer one; mixing distinct
            // wide encodings is a constraint violation the parser
            // reports, not something resolved here.
            (_, y) => y,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier,
    Number,
    CharConstant(i64, Encoding),
    StringLiteral(Vec<u8>, Encoding),
    Punctuator,
    DirectiveStart,
    HeaderName { system: bool },
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: Symbol,
    pub pos: SourcePos,
    pub first_of_line: bool,
    pub preceded_by_space: bool,
    /// Macro names already expanded on this token's path; prevents
    /// recursive re-expansion (spec.md §4.2, "hide set").
    pub hide_set: Rc<HideSet>,
}

/// A persistent (structurally shared) set of macro names. Cheap to clone
/// and union since expansion only ever grows it.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct HideSet(pub Vec<Symbol>);

impl HideSet {
    pub fn empty() -> Rc<HideSet> {
        Rc::new(HideSet(Vec::new()))
    }

    pub fn contains(&self, name: Symbol) -> bool {
        self.0.contains(&name)
    }

    pub fn with(self: &Rc<Self>, name: Symbol) -> Rc<HideSet> {
        if self.contains(name) {
            return self.clone();
        }
        let mut v = self.0.clone();
        v.push(name);
        Rc::new(HideSet(v))
    }

    /// Union used when pasting tokens from two hide sets together (the
    /// intersection rule from the standard macro-expansion algorithm is
    /// intentionally not implemented; spec.md only requires that a
    /// macro's own name be hidden in its output, which union preserves).
    pub fn union(a: &Rc<HideSet>, b: &Rc<HideSet>) -> Rc<HideSet> {
        let mut v = a.0.clone();
        for &s in &b.0 {
            if !v.contains(&s) {
                v.push(s);
            }
        }
        Rc::new(HideSet(v))
    }
}

impl Token {
    pub fn new(kind: TokenKind, text: Symbol, pos: SourcePos) -> Self {
        Token {
            kind,
            text,
            pos,
            first_of_line: false,
            preceded_by_space: false,
            hide_set: HideSet::empty(),
        }
    }

    pub fn text_str(&self) -> Rc<str> {
        resolve(self.text)
    }

    pub fn is_ident(&self) -> bool {
        matches!(self.kind, TokenKind::Identifier)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }

    pub fn is_punct(&self, spelling: &str) -> bool {
        matches!(self.kind, TokenKind::Punctuator) && &*self.text_str() == spelling
    }

    pub fn is_ident_named(&self, name: &str) -> bool {
        self.is_ident() && &*self.text_str() == name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let a = intern("foo");
        let b = intern("foo");
        let c = intern("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&*resolve(a), "foo");
    }

    #[test]
    fn hide_set_is_persistent() {
        let empty = HideSet::empty();
        let x = intern("X");
        let y = intern("Y");
        let with_x = empty.with(x);
        let with_xy = with_x.with(y);
        assert!(!empty.contains(x));
        assert!(with_x.contains(x));
        assert!(!with_x.contains(y));
        assert!(with_xy.contains(x) && with_xy.contains(y));
    }

    #[test]
    fn encoding_promotion_prefers_wide() {
        assert_eq!(Encoding::None.promote(Encoding::Wide), Encoding::Wide);
        assert_eq!(Encoding::Wide.promote(Encoding::None), Encoding::Wide);
        assert_eq!(Encoding::None.promote(Encoding::None), Encoding::None);
    }
}
