//! ccrs CLI
//!
//! Command-line front end for the `ccrs` compiler core: `build` runs the
//! full pipeline to a relocatable ELF64 object, `preprocess` emits the
//! macro-expanded token stream (`cc -E` style), `completions` generates
//! shell completion scripts.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser as ClapParser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};

use ccrs::config::{CodeModel, CompilerConfig};

#[derive(ClapParser)]
#[command(name = "ccrs")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "ccrs - a small x86-64 System V C compiler", long_about = None)]
struct Cli {
    /// Enable debug logging (equivalent to RUST_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CodeModelArg {
    Small,
    Large,
}

impl From<CodeModelArg> for CodeModel {
    fn from(value: CodeModelArg) -> Self {
        match value {
            CodeModelArg::Small => CodeModel::Small,
            CodeModelArg::Large => CodeModel::Large,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a C source file to a relocatable ELF64 object
    Build {
        /// Input C source file
        input: PathBuf,

        /// Output object path (defaults to input filename with a .o extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Additional `#include` search directory, may be repeated
        #[arg(short = 'I', value_name = "DIR")]
        include_dirs: Vec<PathBuf>,

        /// Predefine a macro: `NAME` or `NAME=VALUE`, may be repeated
        #[arg(short = 'D', value_name = "NAME[=VALUE]")]
        defines: Vec<String>,

        /// Undefine a macro, may be repeated
        #[arg(short = 'U', value_name = "NAME")]
        undefines: Vec<String>,

        /// Code model used for label/address materialization (default: small)
        #[arg(long, value_enum)]
        code_model: Option<CodeModelArg>,
    },

    /// Preprocess a C source file and print the expanded token stream
    Preprocess {
        /// Input C source file
        input: PathBuf,

        /// Write preprocessed output here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short = 'I', value_name = "DIR")]
        include_dirs: Vec<PathBuf>,

        #[arg(short = 'D', value_name = "NAME[=VALUE]")]
        defines: Vec<String>,

        #[arg(short = 'U', value_name = "NAME")]
        undefines: Vec<String>,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(io::stderr)
        .init();

    let result = match cli.command {
        Commands::Build {
            input,
            output,
            include_dirs,
            defines,
            undefines,
            code_model,
        } => run_build(
            &input,
            output,
            include_dirs,
            defines,
            undefines,
            code_model.map(CodeModel::from).unwrap_or(CodeModel::Small),
        ),
        Commands::Preprocess {
            input,
            output,
            include_dirs,
            defines,
            undefines,
        } => run_preprocess(&input, output, include_dirs, defines, undefines),
        Commands::Completions { shell } => {
            run_completions(shell);
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn build_config(include_dirs: Vec<PathBuf>, defines: Vec<String>, undefines: Vec<String>) -> CompilerConfig {
    let mut config = CompilerConfig::new().with_include_dirs(include_dirs);
    for d in &defines {
        config = config.with_define_arg(d);
    }
    for u in undefines {
        config = config.with_undefine(u);
    }
    config
}

fn run_build(
    input: &std::path::Path,
    output: Option<PathBuf>,
    include_dirs: Vec<PathBuf>,
    defines: Vec<String>,
    undefines: Vec<String>,
    code_model: CodeModel,
) -> Result<()> {
    let source = fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let mut config = build_config(include_dirs, defines, undefines).with_code_model(code_model);
    let output = output.unwrap_or_else(|| input.with_extension("o"));
    config = config.with_output_path(output.clone());

    let path_str = input.display().to_string();
    let object = ccrs::compile_translation_unit(&source, &path_str, &config)
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .with_context(|| format!("compiling {}", input.display()))?;

    fs::write(&output, object).with_context(|| format!("writing {}", output.display()))?;
    println!("{} -> {}", input.display(), output.display());
    Ok(())
}

fn run_preprocess(
    input: &std::path::Path,
    output: Option<PathBuf>,
    include_dirs: Vec<PathBuf>,
    defines: Vec<String>,
    undefines: Vec<String>,
) -> Result<()> {
    let source = fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let config = build_config(include_dirs, defines, undefines);

    let path_str = input.display().to_string();
    let expanded = ccrs::preprocess_to_string(&source, &path_str, &config)
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .with_context(|| format!("preprocessing {}", input.display()))?;

    match output {
        Some(path) => fs::write(&path, expanded).with_context(|| format!("writing {}", path.display()))?,
        None => print!("{expanded}"),
    }
    Ok(())
}

fn run_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
