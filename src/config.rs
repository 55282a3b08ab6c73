//! Compiler configuration: include search paths, command-line macro
//! definitions, and code-model selection.
//!
//! Grounded on the teacher's `CompilerConfig` builder pattern
//! (`config.rs`): a plain `Default`-derived struct with `with_*` builder
//! methods, rather than a `clap`-parsed struct directly, so library
//! callers can build a config without going through argv.

use std::path::PathBuf;

/// Affects only which relocation kind references to `.rodata`/`.data`
/// use when the linker can't guarantee a nearby placement (spec.md's
/// Open Question on code models): `Small` assumes the final image fits
/// in the low 2GB and emits `R_X86_64_PC32`; `Large` always goes through
/// a `R_X86_64_64` absolute relocation instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeModel {
    #[default]
    Small,
    Large,
}

/// Configuration for one compilation: how `#include` is resolved,
/// predefined/undefined macros from the command line, output shape.
#[derive(Debug, Clone, Default)]
pub struct CompilerConfig {
    /// `-I dir`: searched in order, after the including file's own
    /// directory for quoted includes.
    pub include_dirs: Vec<PathBuf>,

    /// `-D name=value` (or `-D name`, treated as `-D name=1`).
    pub defines: Vec<(String, String)>,

    /// `-U name`: removes a definition that a later `-D`, or the source
    /// itself, would otherwise pick up; applied after all `-D`s in the
    /// order given, matching the original's left-to-right processing.
    pub undefines: Vec<String>,

    pub code_model: CodeModel,

    /// Output object file path. `None` lets the caller pick (e.g. the CLI
    /// derives it from the input file name).
    pub output_path: Option<PathBuf>,
}

impl CompilerConfig {
    pub fn new() -> Self {
        CompilerConfig::default()
    }

    pub fn with_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    pub fn with_include_dirs(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.include_dirs.extend(dirs);
        self
    }

    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.push((name.into(), value.into()));
        self
    }

    /// Parse a `-D` argument of the form `NAME` or `NAME=VALUE`.
    pub fn with_define_arg(self, arg: &str) -> Self {
        match arg.split_once('=') {
            Some((name, value)) => self.with_define(name, value),
            None => self.with_define(arg, "1"),
        }
    }

    pub fn with_undefine(mut self, name: impl Into<String>) -> Self {
        self.undefines.push(name.into());
        self
    }

    pub fn with_code_model(mut self, model: CodeModel) -> Self {
        self.code_model = model;
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_defines_and_dirs() {
        let config = CompilerConfig::new()
            .with_include_dir("/usr/include")
            .with_define("DEBUG", "1")
            .with_undefine("NDEBUG");

        assert_eq!(config.include_dirs, vec![PathBuf::from("/usr/include")]);
        assert_eq!(config.defines, vec![("DEBUG".to_string(), "1".to_string())]);
        assert_eq!(config.undefines, vec!["NDEBUG".to_string()]);
    }

    #[test]
    fn define_arg_splits_on_equals() {
        let config = CompilerConfig::new()
            .with_define_arg("FOO=bar")
            .with_define_arg("BAZ");
        assert_eq!(
            config.defines,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("BAZ".to_string(), "1".to_string())
            ]
        );
    }

    #[test]
    fn default_code_model_is_small() {
        assert_eq!(CompilerConfig::new().code_model, CodeModel::Small);
    }
}
