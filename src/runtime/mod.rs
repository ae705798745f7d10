//! Interpreter handle
//!
//! Design: one explicit value per thread of use instead of process-global
//! state. An [`Interpreter`] holds the GIL and the `sys` module for as long
//! as it lives; every object handle borrows it, so no handle outlives the
//! GIL. A thread holds at most one handle at a time; opening a second one
//! fails with [`Error::HandleActive`]. Dropping it releases both `sys`
//! handles, then the GIL. The embedded interpreter itself stays initialized
//! for the rest of the process.

mod error_capture;
mod gil;

use std::cell::Cell;
use std::ffi::CString;
use std::path::Path;
use std::ptr::NonNull;

use pyo3::ffi;
use tracing::{debug, trace};

use crate::config::{Config, ErrorConfig};
use crate::errors::{Error, Result};
use crate::object::{ObjRef, PyObj};
use gil::GilGuard;

/// Counters for the operations made through one interpreter handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InteropStats {
    pub imports: usize,
    pub calls: usize,
    pub constructions: usize,
    pub conversion_failures: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stat {
    Import,
    Call,
    Construct,
    ConversionFailure,
}

pub struct Interpreter {
    sys: NonNull<ffi::PyObject>,
    sys_dict: NonNull<ffi::PyObject>,
    version: String,
    errors: ErrorConfig,
    stats: Cell<InteropStats>,
    // dropped last: the handles above are released while the GIL is held
    _gil: GilGuard,
}

impl Interpreter {
    /// Open a handle with default settings
    pub fn initialize() -> Result<Self> {
        Self::with_config(&Config::default())
    }

    /// Open a handle, starting the embedded interpreter on first use.
    ///
    /// Configured search paths are prepended to `sys.path`. Fails with
    /// [`Error::HandleActive`] while another handle is open on this thread.
    pub fn with_config(config: &Config) -> Result<Self> {
        let gil = GilGuard::acquire().ok_or(Error::HandleActive)?;

        let sys = NonNull::new(unsafe { ffi::PyImport_ImportModule(c"sys".as_ptr()) })
            .ok_or_else(|| Error::Import {
                module: "sys".to_string(),
                message: error_capture::take_error_text(&config.errors)
                    .unwrap_or_else(|| "unknown error".to_string()),
            })?;

        // borrowed from the module; keep our own reference
        let sys_dict = unsafe { ffi::PyModule_GetDict(sys.as_ptr()) };
        let Some(sys_dict) = NonNull::new(sys_dict) else {
            unsafe { ffi::Py_DecRef(sys.as_ptr()) };
            return Err(Error::Exception("sys module has no namespace".to_string()));
        };
        unsafe { ffi::Py_IncRef(sys_dict.as_ptr()) };

        let mut interpreter = Self {
            sys,
            sys_dict,
            version: String::new(),
            errors: config.errors.clone(),
            stats: Cell::new(InteropStats::default()),
            _gil: gil,
        };
        interpreter.version = interpreter.read_version()?;

        for dir in &config.interpreter.search_paths {
            interpreter.add_search_path(dir)?;
        }

        debug!(event = "interpreter_open", version = %interpreter.version);
        Ok(interpreter)
    }

    fn read_version(&self) -> Result<String> {
        let raw = unsafe { ffi::PyMapping_GetItemString(self.sys_dict.as_ptr(), c"version".as_ptr()) };
        let version = unsafe { PyObj::from_owned_or_err(self, raw) }?;
        version.extract::<String>()
    }

    /// Full `sys.version` text, read once when the handle was opened
    pub fn version(&self) -> &str {
        &self.version
    }

    /// `(major, minor, micro)` from `sys.version_info`
    pub fn version_info(&self) -> Result<(i64, i64, i64)> {
        let info = self
            .sys()
            .load("version_info")?
            .ok_or_else(|| Error::Exception("sys.version_info is missing".to_string()))?;
        let major = info.load("major")?.map(|v| v.extract::<i64>()).transpose()?;
        let minor = info.load("minor")?.map(|v| v.extract::<i64>()).transpose()?;
        let micro = info.load("micro")?.map(|v| v.extract::<i64>()).transpose()?;
        match (major, minor, micro) {
            (Some(major), Some(minor), Some(micro)) => Ok((major, minor, micro)),
            _ => Err(Error::type_mismatch("version_info with major/minor/micro", info.type_name())),
        }
    }

    /// The `sys` module, borrowed from this handle
    pub fn sys(&self) -> ObjRef<'_, '_> {
        // SAFETY: the pointer is owned by self for its whole lifetime
        unsafe { ObjRef::from_non_null(self, self.sys) }
    }

    /// The `sys` module's namespace dict
    pub fn sys_namespace(&self) -> ObjRef<'_, '_> {
        unsafe { ObjRef::from_non_null(self, self.sys_dict) }
    }

    /// Put `dir` at the front of `sys.path` unless it is already listed
    pub fn add_search_path(&self, dir: &Path) -> Result<()> {
        let dir = dir
            .to_str()
            .ok_or_else(|| Error::InvalidString(format!("non UTF-8 path {}", dir.display())))?;

        let raw = unsafe { ffi::PySys_GetObject(c"path".as_ptr()) };
        let path_list = unsafe { ObjRef::from_ptr(self, raw) }
            .ok_or_else(|| Error::Exception("sys.path is missing".to_string()))?;

        for entry in path_list.list_items()? {
            if entry.extract::<String>().ok().as_deref() == Some(dir) {
                return Ok(());
            }
        }

        let entry = PyObj::string(self, dir)?;
        if unsafe { ffi::PyList_Insert(path_list.as_ptr(), 0, entry.as_ptr()) } != 0 {
            return Err(Error::Exception(self.take_error()));
        }
        debug!(event = "search_path_added", path = dir);
        Ok(())
    }

    /// Import a module by name, optionally adding `search_path` to `sys.path`
    /// first.
    pub fn import(&self, name: &str, search_path: Option<&Path>) -> Result<PyObj<'_>> {
        if let Some(dir) = search_path {
            self.add_search_path(dir)?;
        }

        let cname = CString::new(name)?;
        self.record(Stat::Import);
        let raw = unsafe { ffi::PyImport_ImportModule(cname.as_ptr()) };

        match unsafe { PyObj::from_owned_ptr(self, raw) } {
            Some(module) => {
                debug!(event = "import", module = name);
                Ok(module)
            }
            None => {
                let message = self.take_error();
                debug!(event = "import_failed", module = name, %message);
                Err(Error::Import {
                    module: name.to_string(),
                    message,
                })
            }
        }
    }

    /// Text of the pending exception, clearing it
    pub fn last_error(&self) -> Option<String> {
        error_capture::take_error_text(&self.errors)
    }

    /// Like [`Interpreter::last_error`], for paths where the interpreter has
    /// already signalled failure
    pub(crate) fn take_error(&self) -> String {
        self.last_error().unwrap_or_else(|| "unknown error".to_string())
    }

    pub fn stats(&self) -> InteropStats {
        self.stats.get()
    }

    pub(crate) fn record(&self, stat: Stat) {
        let mut stats = self.stats.get();
        match stat {
            Stat::Import => stats.imports += 1,
            Stat::Call => stats.calls += 1,
            Stat::Construct => stats.constructions += 1,
            Stat::ConversionFailure => stats.conversion_failures += 1,
        }
        self.stats.set(stats);
    }

    /// Release the held handles and the GIL now
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        trace!(event = "interpreter_close", stats = ?self.stats.get());
        unsafe {
            ffi::Py_DecRef(self.sys_dict.as_ptr());
            ffi::Py_DecRef(self.sys.as_ptr());
        }
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("version", &self.version)
            .field("stats", &self.stats.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_matches_version_info() {
        let py = Interpreter::initialize().unwrap();
        let (major, minor, micro) = py.version_info().unwrap();
        assert_eq!(major, 3);
        assert!(py.version().starts_with(&format!("{}.{}.{}", major, minor, micro)));
    }

    #[test]
    fn test_sys_handles_are_usable() {
        let py = Interpreter::initialize().unwrap();
        assert_eq!(py.sys().type_name(), "module");
        assert_eq!(py.sys_namespace().type_name(), "dict");
    }

    #[test]
    fn test_search_path_added_once() {
        let py = Interpreter::initialize().unwrap();
        let dir = Path::new("/nonexistent/pyshim-search-path");
        py.add_search_path(dir).unwrap();
        py.add_search_path(dir).unwrap();

        let paths: Vec<String> = py.sys().load("path").unwrap().unwrap().extract().unwrap();
        assert_eq!(paths.iter().filter(|p| p.as_str() == dir.to_str().unwrap()).count(), 1);
    }

    #[test]
    fn test_missing_module() {
        let py = Interpreter::initialize().unwrap();
        match py.import("pyshim_no_such_module", None) {
            Err(Error::Import { module, message }) => {
                assert_eq!(module, "pyshim_no_such_module");
                assert!(message.contains("ModuleNotFoundError"), "{}", message);
            }
            other => panic!("unexpected result: {:?}", other.map(|m| m.type_name())),
        }
        assert!(py.last_error().is_none());
    }

    #[test]
    fn test_stats_count_imports() {
        let py = Interpreter::initialize().unwrap();
        py.import("math", None).unwrap();
        let _ = py.import("pyshim_no_such_module", None);
        assert_eq!(py.stats().imports, 2);
        assert_eq!(py.stats().calls, 0);
    }

    #[test]
    fn test_second_handle_on_thread_is_refused() {
        let outer = Interpreter::initialize().unwrap();
        assert!(matches!(Interpreter::initialize(), Err(Error::HandleActive)));
        assert!(matches!(Interpreter::with_config(&Config::default()), Err(Error::HandleActive)));

        // the refused attempts left the open handle intact
        assert!(outer.import("math", None).is_ok());
        let version = outer.version().to_string();
        drop(outer);

        let next = Interpreter::initialize().unwrap();
        assert_eq!(next.version(), version);
        assert!(next.import("math", None).is_ok());
    }

    #[test]
    fn test_handles_on_other_threads_take_turns() {
        let version = Interpreter::initialize().unwrap().version().to_string();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    let py = Interpreter::initialize().unwrap();
                    let math = py.import("math", None).unwrap();
                    let pi = math.load("pi").unwrap().unwrap().extract::<f64>().unwrap();
                    (py.version().to_string(), pi)
                })
            })
            .collect();

        for handle in handles {
            let (thread_version, pi) = handle.join().unwrap();
            assert_eq!(thread_version, version);
            assert_eq!(pi, std::f64::consts::PI);
        }
    }
}
