use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use weft::{InterpretResult, VM};

#[derive(Parser)]
#[command(name = "weft")]
#[command(version)]
#[command(about = "A bytecode interpreter for the weft scripting language", long_about = None)]
struct Cli {
    /// Script file to run.
    script: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let source = match fs::read_to_string(&cli.script) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not read '{}': {}", cli.script.display(), error);
            return ExitCode::from(74);
        }
    };

    let mut vm = VM::new();
    match vm.interpret(&source) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(65),
        InterpretResult::RuntimeError => ExitCode::from(70),
    }
}
