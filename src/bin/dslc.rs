//! dslc command-line driver.
//!
//! Reads textual IR, generates code and writes a runnable ELF64 executable.

use bumpalo::Bump;
use clap::Parser;
use dslc::{CompilationSession, CompileOptions};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "dslc")]
#[command(version)]
#[command(about = "Compile dslc IR to a static x86-64 ELF executable", long_about = None)]
struct Cli {
    /// Input IR file
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output executable path
    #[arg(short, long, value_name = "OUTPUT")]
    output: PathBuf,

    /// Function called by the process entry
    #[arg(long, default_value = "main")]
    entry: String,

    /// Print a NASM-syntax listing of the generated code
    #[arg(long)]
    listing: bool,

    /// Print compilation statistics
    #[arg(long)]
    stats: bool,

    /// Fail if any instruction was skipped
    #[arg(long)]
    strict: bool,

    /// Log every compiled instruction
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let source = match fs::read_to_string(&cli.input) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("error: could not read '{}': {}", cli.input.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let arena = Bump::new();
    let options = CompileOptions {
        entry_function: cli.entry.clone(),
        ..CompileOptions::default()
    };
    let session = CompilationSession::with_options(&arena, options);

    let ir = dslc::ir::parse_ir(&source, &session);
    let program = match dslc::compile_ir(&session, &ir) {
        Ok(program) => program,
        Err(e) => {
            report_error(&e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = program.image.write_to(&cli.output) {
        report_error(&e);
        return ExitCode::FAILURE;
    }

    if cli.listing {
        print!("{}", program.listing());
    }
    if cli.stats {
        print!("{}", session.stats());
    }

    let skipped = session.diagnostics().len();
    if skipped > 0 {
        eprintln!("warning: {skipped} instruction(s) skipped");
        if cli.strict {
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}

fn report_error(error: &dyn std::error::Error) {
    eprintln!("error: {error}");
    let mut source = error.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}
