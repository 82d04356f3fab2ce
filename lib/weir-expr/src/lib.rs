//! A small, pure expression language for classifying JSON values.
//!
//! Programs are written in a jq-flavored surface syntax: `.field` paths,
//! pipes, arithmetic and comparison operators, `if`/`elif`/`else`/`end`,
//! the `//` fallback operator, array and object construction, and function
//! calls with `;`-separated arguments. A program is compiled once — syntax,
//! function names, arities, and embedded regexes are all checked up front —
//! and then run many times, each run producing at most one output value.
//!
//! Evaluation is deterministic and free of external side effects. Hosts extend
//! the language by registering functions, which is how classification programs
//! gain the ability to package events or declare an input "not relevant":
//!
//! ```
//! use serde_json::{json, Value};
//! use weir_expr::{CompiledProgram as _, Engine as _, EvalError, Functions, Interpreter};
//!
//! let functions = Functions::default().with_function("shout", 1, |_, args| {
//!     let text = args[0].as_str().unwrap_or_default();
//!     Ok(Value::String(text.to_uppercase()))
//! });
//!
//! let engine = Interpreter::new(functions);
//! let program = engine.compile(r#"if .ok then shout(.msg) else "quiet" end"#).unwrap();
//!
//! let output = program.run(&json!({ "ok": true, "msg": "hi" })).unwrap();
//! assert_eq!(output, Some(Value::String("HI".into())));
//! # let _: Option<EvalError> = None;
//! ```

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use snafu::Snafu;

mod ast;
mod eval;
mod parser;

pub use self::eval::Program;

/// A program compilation error.
#[derive(Debug, Snafu)]
pub enum CompileError {
    /// The source text could not be parsed.
    #[snafu(display("syntax error near '{}'", fragment))]
    Syntax {
        /// The source fragment where parsing stopped.
        fragment: String,
    },

    /// The program calls a function that is neither built in nor registered.
    #[snafu(display("unknown function '{}/{}'", name, arity))]
    UnknownFunction {
        /// Name of the unresolved function.
        name: String,
        /// Number of arguments at the call site.
        arity: usize,
    },

    /// The program calls a known function with the wrong number of arguments.
    #[snafu(display("function '{}' takes {} argument(s), got {}", name, expected, given))]
    WrongArity {
        /// Name of the function.
        name: String,
        /// Declared argument count.
        expected: usize,
        /// Argument count at the call site.
        given: usize,
    },

    /// A `test()` call whose pattern is not a string literal.
    #[snafu(display("test() requires a string literal pattern"))]
    NonLiteralRegex,

    /// A `test()` pattern that is not a valid regular expression.
    #[snafu(display("invalid regex '{}': {}", pattern, source))]
    InvalidRegex {
        /// The offending pattern.
        pattern: String,
        /// Error from the regex compiler.
        source: regex::Error,
    },
}

/// A program evaluation error.
///
/// `Skip` is deliberate control flow raised by a program (via a host function
/// built for the purpose) to mark its input as not relevant; `Failure` is a
/// genuine evaluation fault such as indexing a number or dividing by zero.
/// Callers routing classification decisions must treat the two differently.
#[derive(Debug, Snafu)]
pub enum EvalError {
    /// The program declared its input not relevant.
    #[snafu(display("not relevant: {}", reason))]
    Skip {
        /// Program-supplied reason, used for debug logging only.
        reason: String,
    },

    /// Evaluation failed.
    #[snafu(display("evaluation failed: {}", message))]
    Failure {
        /// Description of the fault.
        message: String,
    },
}

impl EvalError {
    /// Creates the "not relevant" sentinel with the given reason.
    pub fn skip<S: Into<String>>(reason: S) -> Self {
        EvalError::Skip { reason: reason.into() }
    }

    /// Creates an evaluation failure with the given message.
    pub fn failure<S: Into<String>>(message: S) -> Self {
        EvalError::Failure { message: message.into() }
    }

    /// Whether this error is the "not relevant" sentinel.
    pub fn is_skip(&self) -> bool {
        matches!(self, EvalError::Skip { .. })
    }
}

/// A host function callable from programs.
///
/// Receives the current input value and the already-evaluated arguments, in
/// call order.
pub type HostFn = Arc<dyn Fn(&Value, &[Value]) -> Result<Value, EvalError> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct HostFunction {
    pub(crate) arity: usize,
    pub(crate) callback: HostFn,
}

/// The set of host functions available to compiled programs.
#[derive(Clone, Default)]
pub struct Functions {
    funcs: HashMap<String, HostFunction>,
}

impl Functions {
    /// Registers a host function under the given name and arity.
    ///
    /// Registering the same name twice replaces the earlier definition.
    pub fn with_function<F>(mut self, name: &str, arity: usize, callback: F) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.funcs.insert(
            name.to_string(),
            HostFunction {
                arity,
                callback: Arc::new(callback),
            },
        );
        self
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<&HostFunction> {
        self.funcs.get(name)
    }
}

/// An expression engine: compiles program source into runnable programs.
///
/// The aggregation pipeline only depends on this trait (plus
/// [`CompiledProgram`]), so the bundled interpreter can be swapped for any
/// other pure, JSON-valued expression implementation.
pub trait Engine {
    /// Compiles the given source text.
    ///
    /// # Errors
    ///
    /// If the source has syntax errors, calls unknown functions, or calls
    /// known functions with the wrong arity, an error is returned.
    fn compile(&self, source: &str) -> Result<Box<dyn CompiledProgram>, CompileError>;
}

/// A compiled program, runnable any number of times.
pub trait CompiledProgram: Send + Sync {
    /// Runs the program against one input value.
    ///
    /// Produces the program's first output value, or `None` when the program
    /// produces no output (for example, a failed `select`).
    ///
    /// # Errors
    ///
    /// Returns [`EvalError::Skip`] when the program declares the input not
    /// relevant, and [`EvalError::Failure`] on a genuine evaluation fault.
    fn run(&self, input: &Value) -> Result<Option<Value>, EvalError>;
}

/// The bundled expression interpreter.
pub struct Interpreter {
    functions: Functions,
}

impl Interpreter {
    /// Creates an interpreter exposing the given host functions to programs.
    pub fn new(functions: Functions) -> Self {
        Self { functions }
    }
}

impl Engine for Interpreter {
    fn compile(&self, source: &str) -> Result<Box<dyn CompiledProgram>, CompileError> {
        let root = parser::parse(source)?;
        let program = Program::new(root, self.functions.clone())?;
        Ok(Box::new(program))
    }
}
