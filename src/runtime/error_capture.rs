//! Reading back the text of a pending exception
//!
//! Design: the interpreter formats tracebacks itself. In pipe mode its
//! `sys.stderr` is swapped for the write end of an OS pipe while the error is
//! printed; a helper thread drains the read end so large tracebacks cannot
//! block the printing thread.
//!
//! `sys.stderr` is process-wide and writing to the pipe releases the GIL, so
//! captures from different threads are serialized.

use std::mem::ManuallyDrop;
use std::ptr;

#[cfg(unix)]
use parking_lot::{const_mutex, Mutex, MutexGuard};
use pyo3::ffi;
use tracing::warn;

use crate::config::{CaptureMode, ErrorConfig};
use crate::object::text_of;

#[cfg(unix)]
static CAPTURE_LOCK: Mutex<()> = const_mutex(());

/// Wait for the capture lock without holding the GIL while blocked.
#[cfg(unix)]
unsafe fn lock_capture() -> MutexGuard<'static, ()> {
    loop {
        if let Some(guard) = CAPTURE_LOCK.try_lock() {
            return guard;
        }
        let state = ffi::PyEval_SaveThread();
        std::thread::yield_now();
        ffi::PyEval_RestoreThread(state);
    }
}

/// Exception triple taken out of the interpreter with `PyErr_Fetch`.
///
/// Owns one reference to each non-null member until restored or dropped.
struct PendingError {
    ptype: *mut ffi::PyObject,
    pvalue: *mut ffi::PyObject,
    ptraceback: *mut ffi::PyObject,
}

impl PendingError {
    /// Clears the interpreter's error indicator. GIL must be held.
    unsafe fn fetch() -> Option<Self> {
        let mut pending = Self {
            ptype: ptr::null_mut(),
            pvalue: ptr::null_mut(),
            ptraceback: ptr::null_mut(),
        };
        ffi::PyErr_Fetch(&mut pending.ptype, &mut pending.pvalue, &mut pending.ptraceback);
        if pending.ptype.is_null() {
            None
        } else {
            Some(pending)
        }
    }

    unsafe fn is_system_exit(&self) -> bool {
        ffi::PyErr_GivenExceptionMatches(self.ptype, ffi::PyExc_SystemExit) != 0
    }

    /// Hand the references back to the interpreter as the pending error
    unsafe fn restore(self) {
        let this = ManuallyDrop::new(self);
        ffi::PyErr_Restore(this.ptype, this.pvalue, this.ptraceback);
    }

    /// `TypeName: message`, without traceback
    unsafe fn format_plain(mut self) -> String {
        ffi::PyErr_NormalizeException(&mut self.ptype, &mut self.pvalue, &mut self.ptraceback);

        let name = attr_text(self.ptype, c"__name__").unwrap_or_else(|| "Exception".to_string());
        let message = if self.pvalue.is_null() {
            None
        } else {
            text_of(self.pvalue)
        };

        match message {
            Some(message) if !message.is_empty() => format!("{}: {}", name, message),
            _ => name,
        }
    }
}

impl Drop for PendingError {
    fn drop(&mut self) {
        // Py_DecRef tolerates null
        unsafe {
            ffi::Py_DecRef(self.ptype);
            ffi::Py_DecRef(self.pvalue);
            ffi::Py_DecRef(self.ptraceback);
        }
    }
}

unsafe fn attr_text(obj: *mut ffi::PyObject, name: &std::ffi::CStr) -> Option<String> {
    if obj.is_null() {
        return None;
    }
    let attr = ffi::PyObject_GetAttrString(obj, name.as_ptr());
    if attr.is_null() {
        ffi::PyErr_Clear();
        return None;
    }
    let text = text_of(attr);
    ffi::Py_DecRef(attr);
    text
}

/// Take the pending exception as text, clearing it.
///
/// Returns `None` when no exception is pending. The GIL must be held.
pub(crate) fn take_error_text(config: &ErrorConfig) -> Option<String> {
    let pending = unsafe { PendingError::fetch() }?;

    let text = unsafe {
        match config.capture {
            CaptureMode::Format => pending.format_plain(),
            // printing SystemExit exits the process
            CaptureMode::Pipe if pending.is_system_exit() => pending.format_plain(),
            CaptureMode::Pipe => print_captured(pending),
        }
    };

    let text = text.trim_end();
    let text = if text.is_empty() { "unknown error" } else { text };
    Some(truncate(text.to_string(), config.max_message_bytes))
}

#[cfg(unix)]
unsafe fn print_captured(pending: PendingError) -> String {
    use std::fs::File;
    use std::io::Read;
    use std::os::fd::FromRawFd;

    let _lock = lock_capture();

    let mut fds = [0 as libc::c_int; 2];
    if libc::pipe(fds.as_mut_ptr()) != 0 {
        warn!(event = "error_capture", error = %std::io::Error::last_os_error(), "pipe creation failed");
        return pending.format_plain();
    }
    let [read_fd, write_fd] = fds;
    let mut reader = File::from_raw_fd(read_fd);

    let writer = ffi::PyFile_FromFd(
        write_fd,
        c"<captured stderr>".as_ptr(),
        c"w".as_ptr(),
        -1,
        ptr::null(),
        c"backslashreplace".as_ptr(),
        ptr::null(),
        1,
    );
    if writer.is_null() {
        ffi::PyErr_Clear();
        libc::close(write_fd);
        warn!(event = "error_capture", "could not wrap pipe as a file object");
        return pending.format_plain();
    }

    let collector = std::thread::spawn(move || {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).map(|_| bytes)
    });

    let previous = ffi::PySys_GetObject(c"stderr".as_ptr());
    ffi::Py_IncRef(previous);

    if ffi::PySys_SetObject(c"stderr".as_ptr(), writer) != 0 {
        ffi::PyErr_Clear();
        ffi::Py_DecRef(previous);
        close_writer(writer);
        let _ = collector.join();
        warn!(event = "error_capture", "could not redirect sys.stderr");
        return pending.format_plain();
    }

    pending.restore();
    ffi::PyErr_PrintEx(0);

    if ffi::PySys_SetObject(c"stderr".as_ptr(), previous) != 0 {
        ffi::PyErr_Clear();
    }
    ffi::Py_DecRef(previous);
    close_writer(writer);

    match collector.join() {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!(event = "error_capture", error = %e, "reading captured stderr failed");
            "error text could not be read back".to_string()
        }
        Err(_) => "error text could not be read back".to_string(),
    }
}

#[cfg(not(unix))]
unsafe fn print_captured(pending: PendingError) -> String {
    pending.format_plain()
}

/// Flush and close the wrapper, then drop our reference; closing the fd
/// gives the collector its EOF.
#[cfg(unix)]
unsafe fn close_writer(writer: *mut ffi::PyObject) {
    let close = ffi::PyObject_GetAttrString(writer, c"close".as_ptr());
    if !close.is_null() {
        let result = ffi::PyObject_CallObject(close, ptr::null_mut());
        ffi::Py_DecRef(result);
        ffi::Py_DecRef(close);
    }
    ffi::PyErr_Clear();
    ffi::Py_DecRef(writer);
}

fn truncate(mut text: String, max_bytes: usize) -> String {
    if text.len() > max_bytes {
        let mut cut = max_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Interpreter;

    fn raise_value_error() {
        unsafe { ffi::PyErr_SetString(ffi::PyExc_ValueError, c"bad value".as_ptr()) };
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo".to_string(), 2), "h");
        assert_eq!(truncate("hello".to_string(), 10), "hello");
        assert_eq!(truncate("hello".to_string(), 3), "hel");
    }

    #[test]
    fn test_nothing_pending() {
        let _py = Interpreter::initialize().unwrap();
        assert!(take_error_text(&ErrorConfig::default()).is_none());
    }

    #[test]
    fn test_pipe_capture() {
        let _py = Interpreter::initialize().unwrap();
        raise_value_error();

        let text = take_error_text(&ErrorConfig::default()).unwrap();
        assert!(text.contains("ValueError: bad value"), "{}", text);
        assert!(unsafe { ffi::PyErr_Occurred() }.is_null());
    }

    #[test]
    fn test_format_capture() {
        let _py = Interpreter::initialize().unwrap();
        raise_value_error();

        let config = ErrorConfig {
            capture: CaptureMode::Format,
            ..ErrorConfig::default()
        };
        assert_eq!(take_error_text(&config).unwrap(), "ValueError: bad value");
    }

    #[test]
    fn test_system_exit_does_not_print() {
        let _py = Interpreter::initialize().unwrap();
        unsafe { ffi::PyErr_SetString(ffi::PyExc_SystemExit, c"3".as_ptr()) };

        let text = take_error_text(&ErrorConfig::default()).unwrap();
        assert_eq!(text, "SystemExit: 3");
    }

    #[test]
    fn test_capture_is_truncated() {
        let _py = Interpreter::initialize().unwrap();
        raise_value_error();

        let config = ErrorConfig {
            capture: CaptureMode::Format,
            max_message_bytes: 10,
        };
        assert_eq!(take_error_text(&config).unwrap(), "ValueError");
    }
}
