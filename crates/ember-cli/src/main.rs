//! Command-line driver: run a script file, or start a REPL when no file is
//! given. Exit codes follow the conventional interpreter split: 65 for
//! compile errors, 70 for runtime errors.

use std::{
    env, fs,
    io::{self, BufRead, Write},
    process::ExitCode,
};

use ember::{InterpretError, StdPrint, Vm, VmConfig};

const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: ember [script]");
            ExitCode::FAILURE
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: could not read '{path}': {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut out = StdPrint;
    let mut vm = Vm::new(config_from_env(), &mut out);
    match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(errors)) => {
            eprintln!("{errors}");
            ExitCode::from(EXIT_COMPILE_ERROR)
        }
        Err(InterpretError::Runtime(report)) => {
            eprintln!("{report}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

fn repl() -> ExitCode {
    let mut out = StdPrint;
    let mut vm = Vm::new(config_from_env(), &mut out);
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        print!("> ");
        let _ = io::stdout().flush();
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let source = line.trim_end();
        if source.is_empty() {
            continue;
        }
        // REPL errors are reported and the session continues.
        if let Err(err) = vm.interpret(source) {
            eprintln!("{err}");
        }
    }
    ExitCode::SUCCESS
}

/// Debug toggles come from the environment in the driver; embedders set
/// them on `VmConfig` directly.
fn config_from_env() -> VmConfig {
    VmConfig {
        debug_token: env::var_os("EMBER_DEBUG_TOKEN").is_some(),
        debug_print_code: env::var_os("EMBER_DEBUG_PRINT_CODE").is_some(),
        stress_gc: env::var_os("EMBER_STRESS_GC").is_some(),
        log_gc: env::var_os("EMBER_LOG_GC").is_some(),
        ..VmConfig::default()
    }
}
