use std::{env, fs, process::ExitCode};

use fluence::{Interpreter, VmStatus};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let file_path = match parse_args(&args) {
        Some(path) => path,
        None => {
            eprintln!("usage: fluence -run <path>");
            return ExitCode::FAILURE;
        }
    };

    let source = match fs::read_to_string(&file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read `{file_path}`: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut interp = Interpreter::new();
    if let Err(diag) = interp.compile(&source, &file_path) {
        eprintln!("{diag}");
        return ExitCode::FAILURE;
    }
    match interp.run_until_done() {
        Ok(VmStatus::Completed) => ExitCode::SUCCESS,
        Ok(status) => {
            eprintln!("execution ended with status {status}");
            ExitCode::FAILURE
        }
        Err(diag) => {
            eprintln!("{diag}");
            ExitCode::FAILURE
        }
    }
}

/// Accepts `fluence -run <path>` and the bare `fluence <path>` shorthand.
fn parse_args(args: &[String]) -> Option<String> {
    match args.len() {
        2 if args[1] != "-run" => Some(args[1].clone()),
        3 if args[1] == "-run" => Some(args[2].clone()),
        _ => None,
    }
}
