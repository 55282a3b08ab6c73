//! Constant-expression evaluator for `#if`/`#elif` lines.
//!
//! Grounded on `original_source/src/preprocessor/directives.c`'s
//! `eval_constant_expr` family (precedence-climbing over the same operator
//! table C itself uses) and spec.md §4.3. `defined` is resolved before
//! the line is macro-expanded, exactly as in the original, so that
//! `defined(FOO)` can't itself be hijacked by a macro named `FOO`.

use crate::error::CompileError;
use crate::pp::define::{expand_token_list, DefineMap};
use crate::token::{intern, SourcePos, Token, TokenKind};

/// Replace every `defined X` / `defined(X)` occurrence in a `#if` line
/// with a `1` or `0` token, before macro expansion runs.
pub fn resolve_defined(tokens: &[Token], defines: &DefineMap) -> Result<Vec<Token>, CompileError> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0;
    while i < tokens.len() {
        let t = &tokens[i];
        if t.is_ident_named("defined") {
            let (name_tok, consumed) = if i + 1 < tokens.len() && tokens[i + 1].is_punct("(") {
                if i + 2 >= tokens.len() || !tokens[i + 2].is_ident() {
                    return Err(CompileError::diag(t.pos.clone(), "operator \"defined\" requires an identifier"));
                }
                if i + 3 >= tokens.len() || !tokens[i + 3].is_punct(")") {
                    return Err(CompileError::diag(t.pos.clone(), "missing ')' after \"defined\""));
                }
                (&tokens[i + 2], 4)
            } else if i + 1 < tokens.len() && tokens[i + 1].is_ident() {
                (&tokens[i + 1], 2)
            } else {
                return Err(CompileError::diag(t.pos.clone(), "operator \"defined\" requires an identifier"));
            };
            let value = if defines.is_defined(name_tok.text) { "1" } else { "0" };
            out.push(Token::new(TokenKind::Number, intern(value), t.pos.clone()));
            i += consumed;
        } else {
            out.push(t.clone());
            i += 1;
        }
    }
    Ok(out)
}

/// Evaluate a fully macro-expanded `#if` token line to its truth value.
/// Undefined identifiers remaining after expansion evaluate to `0`, per
/// the C standard.
pub fn evaluate(tokens: &[Token], defines: &DefineMap) -> Result<bool, CompileError> {
    let with_defined = resolve_defined(tokens, defines)?;
    let expanded = expand_token_list(with_defined, defines)?;
    let normalized: Vec<Token> = expanded
        .into_iter()
        .map(|t| {
            if t.is_ident() {
                Token::new(TokenKind::Number, intern("0"), t.pos.clone())
            } else {
                t
            }
        })
        .collect();
    if normalized.is_empty() {
        return Err(CompileError::diag(
            SourcePos::new("<if>", 0, 0),
            "#if with no expression",
        ));
    }
    let mut p = Parser {
        toks: &normalized,
        pos: 0,
    };
    let v = p.parse_conditional(true)?;
    if p.pos != p.toks.len() {
        return Err(CompileError::diag(p.cur().pos.clone(), "extra tokens in #if expression"));
    }
    Ok(v != 0)
}

struct Parser<'a> {
    toks: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn cur(&self) -> &Token {
        &self.toks[self.pos.min(self.toks.len() - 1)]
    }

    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn peek_punct(&self, s: &str) -> bool {
        !self.at_end() && self.toks[self.pos].is_punct(s)
    }

    fn bump(&mut self) -> &Token {
        let t = &self.toks[self.pos];
        self.pos += 1;
        t
    }

    /// `live` is false while evaluating a branch whose value is discarded
    /// (the false side of `? :`, or the short-circuited side of `&&`/`||`);
    /// division/modulo by zero there is tolerated rather than fatal,
    /// matching the original's short-circuit suppression.
    fn parse_conditional(&mut self, live: bool) -> Result<i64, CompileError> {
        let cond = self.parse_binary(0, live)?;
        if self.peek_punct("?") {
            self.bump();
            let then_live = live && cond != 0;
            let then_val = self.parse_conditional(then_live)?;
            if !self.peek_punct(":") {
                return Err(CompileError::diag(self.cur().pos.clone(), "expected ':' in conditional expression"));
            }
            self.bump();
            let else_live = live && cond == 0;
            let else_val = self.parse_conditional(else_live)?;
            return Ok(if cond != 0 { then_val } else { else_val });
        }
        Ok(cond)
    }

    fn binop_prec(s: &str) -> Option<u8> {
        Some(match s {
            "||" => 1,
            "&&" => 2,
            "|" => 3,
            "^" => 4,
            "&" => 5,
            "==" | "!=" => 6,
            "<" | ">" | "<=" | ">=" => 7,
            "<<" | ">>" => 8,
            "+" | "-" => 9,
            "*" | "/" | "%" => 10,
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_prec: u8, live: bool) -> Result<i64, CompileError> {
        let mut lhs = self.parse_unary(live)?;
        loop {
            if self.at_end() || !matches!(self.toks[self.pos].kind, TokenKind::Punctuator) {
                break;
            }
            let op = self.toks[self.pos].text_str();
            let prec = match Self::binop_prec(&op) {
                Some(p) if p >= min_prec => p,
                _ => break,
            };
            self.bump();
            let rhs_live = match &*op {
                "&&" => live && lhs != 0,
                "||" => live && lhs == 0,
                _ => live,
            };
            let rhs = self.parse_binary(prec + 1, rhs_live)?;
            lhs = Self::apply_binop(&op, lhs, rhs, live, self.cur())?;
        }
        Ok(lhs)
    }

    fn apply_binop(op: &str, lhs: i64, rhs: i64, live: bool, at: &Token) -> Result<i64, CompileError> {
        Ok(match op {
            "||" => ((lhs != 0) || (rhs != 0)) as i64,
            "&&" => ((lhs != 0) && (rhs != 0)) as i64,
            "|" => lhs | rhs,
            "^" => lhs ^ rhs,
            "&" => lhs & rhs,
            "==" => (lhs == rhs) as i64,
            "!=" => (lhs != rhs) as i64,
            "<" => (lhs < rhs) as i64,
            ">" => (lhs > rhs) as i64,
            "<=" => (lhs <= rhs) as i64,
            ">=" => (lhs >= rhs) as i64,
            "<<" => lhs.wrapping_shl(rhs as u32 & 63),
            ">>" => lhs.wrapping_shr(rhs as u32 & 63),
            "+" => lhs.wrapping_add(rhs),
            "-" => lhs.wrapping_sub(rhs),
            "*" => lhs.wrapping_mul(rhs),
            "/" => {
                if rhs == 0 {
                    if live {
                        return Err(CompileError::diag(at.pos.clone(), "division by zero in #if expression"));
                    }
                    0
                } else {
                    lhs.wrapping_div(rhs)
                }
            }
            "%" => {
                if rhs == 0 {
                    if live {
                        return Err(CompileError::diag(at.pos.clone(), "division by zero in #if expression"));
                    }
                    0
                } else {
                    lhs.wrapping_rem(rhs)
                }
            }
            _ => unreachable!("unhandled binary operator {op}"),
        })
    }

    fn parse_unary(&mut self, live: bool) -> Result<i64, CompileError> {
        if self.at_end() {
            return Err(CompileError::diag(
                SourcePos::new("<if>", 0, 0),
                "unexpected end of #if expression",
            ));
        }
        if self.peek_punct("!") {
            self.bump();
            let v = self.parse_unary(live)?;
            return Ok((v == 0) as i64);
        }
        if self.peek_punct("-") {
            self.bump();
            let v = self.parse_unary(live)?;
            return Ok(v.wrapping_neg());
        }
        if self.peek_punct("+") {
            self.bump();
            return self.parse_unary(live);
        }
        if self.peek_punct("~") {
            self.bump();
            let v = self.parse_unary(live)?;
            return Ok(!v);
        }
        if self.peek_punct("(") {
            self.bump();
            let v = self.parse_conditional(live)?;
            if !self.peek_punct(")") {
                return Err(CompileError::diag(self.cur().pos.clone(), "expected ')'"));
            }
            self.bump();
            return Ok(v);
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<i64, CompileError> {
        let t = self.bump().clone();
        match &t.kind {
            TokenKind::Number => parse_pp_number(&t),
            TokenKind::CharConstant(v, _) => Ok(*v),
            _ => Err(CompileError::diag(t.pos.clone(), format!("invalid token '{}' in #if expression", t.text_str()))),
        }
    }
}

fn parse_pp_number(t: &Token) -> Result<i64, CompileError> {
    let s = t.text_str();
    let trimmed = s.trim_end_matches(|c: char| matches!(c, 'u' | 'U' | 'l' | 'L'));
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else if trimmed.len() > 1 && trimmed.starts_with('0') && trimmed.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        i64::from_str_radix(&trimmed[1..], 8)
    } else {
        trimmed.parse::<i64>()
    };
    parsed.map_err(|_| CompileError::diag(t.pos.clone(), format!("invalid integer constant '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SourcePos;

    fn lex_line(src: &str) -> Vec<Token> {
        let mut lx = crate::lexer::Lexer::new(src, "t.c");
        let mut out = Vec::new();
        loop {
            let t = lx.next_token().unwrap();
            if t.is_eof() {
                break;
            }
            out.push(t);
        }
        out
    }

    #[test]
    fn simple_arithmetic_true() {
        let defines = DefineMap::new();
        let toks = lex_line("1+2*3==7");
        assert!(evaluate(&toks, &defines).unwrap());
    }

    #[test]
    fn simple_arithmetic_false() {
        let defines = DefineMap::new();
        let toks = lex_line("1+2*3==9");
        assert!(!evaluate(&toks, &defines).unwrap());
    }

    #[test]
    fn defined_checks_macro_table() {
        let mut defines = DefineMap::new();
        defines.insert(crate::pp::define::Define {
            name: intern("FOO"),
            func_like: false,
            variadic: false,
            params: vec![],
            replacement: vec![],
        });
        let toks = lex_line("defined(FOO)");
        assert!(evaluate(&toks, &defines).unwrap());
        let toks2 = lex_line("defined BAR");
        assert!(!evaluate(&toks2, &defines).unwrap());
    }

    #[test]
    fn short_circuit_suppresses_division_by_zero() {
        let defines = DefineMap::new();
        let toks = lex_line("0 && (1/0)");
        assert!(!evaluate(&toks, &defines).unwrap());
        let toks2 = lex_line("1 || (1/0)");
        assert!(evaluate(&toks2, &defines).unwrap());
    }

    #[test]
    fn ternary_picks_live_branch_only() {
        let defines = DefineMap::new();
        let toks = lex_line("1 ? 5 : (1/0)");
        let mut p = Parser { toks: &toks, pos: 0 };
        assert_eq!(p.parse_conditional(true).unwrap(), 5);
    }

    #[test]
    fn division_by_zero_in_live_branch_is_fatal() {
        let defines = DefineMap::new();
        let toks = lex_line("1/0");
        assert!(evaluate(&toks, &defines).is_err());
    }
}
