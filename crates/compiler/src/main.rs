//! BQ BASIC compiler CLI
//!
//! Command-line interface for compiling .bas programs to executables (via
//! the QBE backend) or to QBE IL, and for front-end-only checking.

use clap::{CommandFactory, Parser as ClapParser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use bqc::{CompilerOptions, ProjectConfig, StringMode};

#[derive(ClapParser)]
#[command(name = "bqc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "BQ BASIC compiler - compile .bas programs via QBE", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StringModeArg {
    Ascii,
    Utf32,
    Auto,
}

impl From<StringModeArg> for StringMode {
    fn from(arg: StringModeArg) -> Self {
        match arg {
            StringModeArg::Ascii => StringMode::Ascii,
            StringModeArg::Utf32 => StringMode::Utf32,
            StringModeArg::Auto => StringMode::Auto,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a .bas file to an executable
    Build {
        /// Input .bas source file
        input: PathBuf,

        /// Output path (defaults to input filename without .bas extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after writing the QBE IL (.ssa) file
        #[arg(long)]
        emit_il_only: bool,

        /// Keep the intermediate IL file after native compilation
        #[arg(long)]
        keep_il: bool,

        /// Default array lower bound
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..=1))]
        array_base: Option<i64>,

        /// String literal handling
        #[arg(long, value_enum)]
        string_mode: Option<StringModeArg>,

        /// Require DIM before use
        #[arg(long)]
        option_explicit: bool,

        /// Additional library search path(s) for linking
        #[arg(short = 'L', long = "library-path")]
        library_paths: Vec<String>,

        /// Additional library(ies) to link
        #[arg(short = 'l', long = "library")]
        libraries: Vec<String>,
    },

    /// Parse, analyze and build the CFG without emitting code
    Check {
        /// Input .bas source files
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
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

    match cli.command {
        Commands::Build {
            input,
            output,
            emit_il_only,
            keep_il,
            array_base,
            string_mode,
            option_explicit,
            library_paths,
            libraries,
        } => {
            let output = output.unwrap_or_else(|| {
                let stem = input.file_stem().unwrap_or_default();
                PathBuf::from(stem)
            });
            let mut options = CompilerOptions::default();

            // Project file first, CLI flags on top
            if let Some(config_path) = ProjectConfig::discover(&input) {
                match load_project_config(&config_path) {
                    Ok(config) => {
                        if let Err(e) = config.apply(&mut options) {
                            eprintln!("Error in {}: {}", config_path.display(), e);
                            process::exit(1);
                        }
                    }
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        process::exit(1);
                    }
                }
            }
            if let Some(base) = array_base {
                options.array_base = base;
            }
            if let Some(mode) = string_mode {
                options.string_mode = mode.into();
            }
            if option_explicit {
                options.option_explicit = true;
            }
            options.emit_il_only = emit_il_only;
            options.keep_il = keep_il;
            options.library_paths.extend(library_paths);
            options.libraries.extend(libraries);

            run_build(&input, &output, &options);
        }
        Commands::Check { inputs } => {
            run_check(&inputs);
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "bqc", &mut io::stdout());
        }
    }
}

fn load_project_config(path: &Path) -> Result<ProjectConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    ProjectConfig::from_toml(&content)
}

fn run_build(input: &Path, output: &Path, options: &CompilerOptions) {
    match bqc::compile_file(input, output, options) {
        Ok(()) => {
            if options.emit_il_only {
                println!(
                    "Compiled {} -> {}",
                    input.display(),
                    output.with_extension("ssa").display()
                );
            } else {
                println!("Compiled {} -> {}", input.display(), output.display());
                if options.keep_il {
                    let il_path = output.with_extension("ssa");
                    if il_path.exists() {
                        println!("IL saved to {}", il_path.display());
                    }
                }
            }
        }
        Err(e) => {
            eprintln!("{}: error: {}", input.display(), e);
            process::exit(1);
        }
    }
}

fn run_check(inputs: &[PathBuf]) {
    let mut failed = false;
    for input in inputs {
        let source = match std::fs::read_to_string(input) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{}: error: {}", input.display(), e);
                failed = true;
                continue;
            }
        };
        let base_dir = input.parent().unwrap_or(Path::new("."));
        let resolved = match bqc::resolve_includes(&source, base_dir) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("{}: error: {}", input.display(), e);
                failed = true;
                continue;
            }
        };
        match bqc::check_source(&resolved, &CompilerOptions::default()) {
            Ok(warnings) => {
                for warning in warnings {
                    eprintln!("{}: warning: {}", input.display(), warning);
                }
                println!("{}: OK", input.display());
            }
            Err(e) => {
                eprintln!("{}: error: {}", input.display(), e);
                failed = true;
            }
        }
    }
    if failed {
        process::exit(1);
    }
}
