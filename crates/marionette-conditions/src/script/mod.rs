//! Condition scripting: parsing, suspension-point rewriting and evaluation

pub mod ast;
pub mod builtins;
pub mod compiler;
pub mod interpreter;
mod parser;
pub mod value;

pub use ast::SuspendOp;
pub use compiler::{BindingKind, CompiledUnit, Compiler};
pub use interpreter::{BoxFuture, Host, Interpreter};
pub use value::{Builtin, Value};
