#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked at the boundaries")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors the numeric model")]

mod bytecode;
mod diagnostic;
mod error;
mod heap;
mod intern;
mod io;
mod lexer;
mod object;
mod parser;
mod run;
mod scope;
mod stdlib;
mod tracer;
mod value;
mod vm;

pub use crate::{
    diagnostic::{CodeLoc, Diagnostic, Phase, StackFrame},
    error::ErrorKind,
    io::{CollectStringPrint, LineReader, NoPrint, PrintWriter, ScriptedLines, StdLineReader, StdPrint},
    object::Object,
    parser::SourceFile,
    run::{Config, HostCtx, Interpreter, LibraryBuilder},
    tracer::{NoopTracer, StderrTracer, VmTracer},
    vm::VmStatus,
};
