//! ccrs: a small x86-64 System V C compiler core.
//!
//! The pipeline is preprocess → parse (with constant folding and
//! initializer expansion along the way) → lower to IR → emit a
//! relocatable ELF64 object, matching spec.md §2's six-component
//! pipeline (A–F). [`compile_translation_unit`] drives the whole thing;
//! [`preprocess_to_string`] exposes just the first stage for `ccrs
//! preprocess` / `-E`-style use.
//!
//! # Example
//!
//! ```rust,ignore
//! use ccrs::{compile_translation_unit, config::CompilerConfig};
//!
//! let source = "int main(void) { return 42; }";
//! let object_bytes = compile_translation_unit(source, "t.c", &CompilerConfig::new())?;
//! # Ok::<(), ccrs::error::CompileError>(())
//! ```

pub mod ast;
pub mod codegen;
pub mod config;
pub mod constant;
pub mod error;
pub mod ir;
pub mod ir_builder;
pub mod lexer;
pub mod object;
pub mod parser;
pub mod pp;
pub mod pushback;
pub mod rodata;
pub mod token;
pub mod types;

pub use config::CompilerConfig;
pub use error::{CompileError, Warning, WarningSink};
pub use types::TypeInterner;

/// Runs the full pipeline on `source` and returns a relocatable ELF64
/// object (component F's output). `path` is used only for diagnostics
/// (`SourcePos::path`).
pub fn compile_translation_unit(
    source: &str,
    path: &str,
    config: &CompilerConfig,
) -> Result<Vec<u8>, CompileError> {
    let mut interner = TypeInterner::new();
    let (unit, warnings) = parser::parse(source, path.to_string(), config, &mut interner)?;
    for w in warnings.warnings() {
        tracing::warn!("{}", w);
    }

    let mut rodata = rodata::RodataRegistry::new();
    let module = ir_builder::build_module(&unit, &mut interner, &mut rodata)?;

    tracing::debug!(functions = module.functions.len(), "emitting object");
    codegen::emit_object(&unit, &module, &rodata, config)
}

/// Runs only the preprocessor (component A/B: pushback + macro
/// expansion) and reconstructs the expanded token stream as text, the
/// way `cc -E` does. Directives are consumed; their effects (macro
/// expansion, conditional inclusion) are visible in the output, the
/// directives themselves are not.
pub fn preprocess_to_string(source: &str, path: &str, config: &CompilerConfig) -> Result<String, CompileError> {
    let mut pp = pp::Preprocessor::new(source, path.to_string(), config);
    let mut out = String::new();
    let mut last_line = 0u32;
    loop {
        let tok = pp.next()?;
        if tok.is_eof() {
            break;
        }
        if tok.first_of_line && last_line != 0 {
            out.push('\n');
        } else if tok.preceded_by_space && !out.is_empty() {
            out.push(' ');
        }
        last_line = tok.pos.line;
        out.push_str(&token::resolve(tok.text));
    }
    if !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_expands_object_macros() {
        let out = preprocess_to_string("#define N 3\nint x = N;\n", "t.c", &CompilerConfig::new()).unwrap();
        assert!(out.contains("int x = 3 ;") || out.contains("int x = 3;"));
    }

    #[test]
    fn preprocess_drops_inactive_branch() {
        let src = "#if 0\nint dead;\n#else\nint alive;\n#endif\n";
        let out = preprocess_to_string(src, "t.c", &CompilerConfig::new()).unwrap();
        assert!(out.contains("alive"));
        assert!(!out.contains("dead"));
    }
}
