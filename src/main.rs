//! Tern CLI: execute files or run the REPL.

use std::env;
use std::io::{self, BufRead, Write};
use std::process;

use colored::Colorize;

use ternlang::{TernError, Value, Vm};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI command to execute.
enum Command {
    /// Run a script file
    Run { file: String },
    /// Evaluate a string
    Eval { code: String },
    /// Start the REPL
    Repl,
}

struct Options {
    command: Command,
    disassemble: bool,
}

fn print_usage() {
    eprintln!("Tern {} - Tern Interpreter", VERSION);
    eprintln!();
    eprintln!("Usage: tern [options] [script.tn]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -e <code>        Evaluate code directly");
    eprintln!("  --disassemble    Print compiled bytecode before running");
    eprintln!("  --help, -h       Show this help message");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  tern                     Start interactive REPL");
    eprintln!("  tern script.tn           Run a script file");
    eprintln!("  tern -e '1 + 2'          Evaluate code directly");
}

fn parse_args() -> Options {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut options = Options {
        command: Command::Repl,
        disassemble: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            "--disassemble" => {
                options.disassemble = true;
            }
            "-e" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("-e requires an argument");
                    print_usage();
                    process::exit(64);
                }
                options.command = Command::Eval {
                    code: args[i].clone(),
                };
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown option: {}", arg);
                print_usage();
                process::exit(64);
            }
            file => {
                options.command = Command::Run {
                    file: file.to_string(),
                };
            }
        }
        i += 1;
    }

    options
}

fn main() {
    let options = parse_args();

    match &options.command {
        Command::Run { file } => run_file(file, &options),
        Command::Eval { code } => run_eval(code, &options),
        Command::Repl => run_repl(),
    }
}

fn run_file(path: &str, options: &Options) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error: Cannot read '{}': {}", path, err);
            process::exit(66);
        }
    };
    let module = std::path::Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("main")
        .to_string();

    if let Err(err) = ternlang::run_with_options(&module, &source, options.disassemble) {
        report_error(&err);
        process::exit(exit_code(&err));
    }
}

fn run_eval(code: &str, options: &Options) {
    match ternlang::run_with_options("main", code, options.disassemble) {
        Ok(value) => print_value(&value),
        Err(err) => {
            report_error(&err);
            process::exit(exit_code(&err));
        }
    }
}

/// A line-at-a-time REPL sharing one VM, so definitions persist.
fn run_repl() {
    println!("Tern {} (type ctrl-d to exit)", VERSION);
    let mut vm = Vm::new();
    let stdin = io::stdin();
    let mut line_number = 0;

    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                eprintln!("Error: {}", err);
                break;
            }
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        line_number += 1;
        let module = format!("repl:{}", line_number);
        match vm.interpret(&module, line) {
            Ok(value) => print_value(&value),
            Err(err) => report_error(&err),
        }
    }
}

fn print_value(value: &Value) {
    if !matches!(value, Value::Nil) {
        println!("{}", format!("{:?}", value).cyan());
    }
}

fn report_error(err: &TernError) {
    eprintln!("{} {}", "Error:".red().bold(), err);
    if let TernError::Runtime(runtime) = err {
        if !runtime.trace.is_empty() {
            eprintln!("{}", runtime.stack_trace().dimmed());
        }
    }
}

fn exit_code(err: &TernError) -> i32 {
    match err {
        TernError::Compile(_) => 65,
        TernError::Runtime(_) => 70,
        TernError::Io(_) => 66,
    }
}
