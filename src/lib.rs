//! pyshim: ownership-typed access to an embedded CPython interpreter
//!
//! Open an [`Interpreter`] handle, import modules, move native values in and
//! out, call functions, construct instances, and read or write attributes.
//! Failures come back as [`Error`] values carrying the interpreter's own
//! exception text.
//!
//! ```no_run
//! use pyshim::{Interpreter, Value};
//!
//! # fn main() -> pyshim::Result<()> {
//! let py = Interpreter::initialize()?;
//! let math = py.import("math", None)?;
//! let _root = math.call("sqrt", Some(&[Value::Float(2.0)]))?;
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod infrastructure;
pub mod object;
pub mod runtime;

// Re-export commonly used items
pub use config::{CaptureMode, Config, ErrorConfig, InterpreterConfig, LoggingConfig};
pub use errors::{ContainerKind, Error, Result};
pub use infrastructure::{init_dev_logging, init_logging, init_prod_logging, LogConfig, LogFormat, LogOutput};
pub use object::{FromPython, ObjRef, PyObj, ToPython, TypeTag, Value};
pub use runtime::{InteropStats, Interpreter};
