//! GIL ownership for an interpreter handle

use std::cell::Cell;
use std::marker::PhantomData;

use once_cell::sync::OnceCell;
use pyo3::ffi;

static INIT: OnceCell<()> = OnceCell::new();

thread_local! {
    static HELD: Cell<bool> = const { Cell::new(false) };
}

/// Start the embedded interpreter if nobody has yet.
///
/// Safe to call repeatedly and from any thread. Leaves the GIL released.
pub(crate) fn ensure_initialized() {
    INIT.get_or_init(|| {
        pyo3::prepare_freethreaded_python();
        tracing::debug!(event = "interpreter_init", "embedded interpreter ready");
    });
}

/// Holds the GIL until dropped.
///
/// At most one guard exists per thread, so releases can never happen out of
/// order. The raw-pointer marker keeps the guard on its thread.
pub(crate) struct GilGuard {
    state: Option<ffi::PyGILState_STATE>,
    _not_send: PhantomData<*mut ()>,
}

impl GilGuard {
    /// `None` when this thread already holds a guard
    pub(crate) fn acquire() -> Option<Self> {
        if HELD.with(|held| held.replace(true)) {
            return None;
        }
        ensure_initialized();
        let state = unsafe { ffi::PyGILState_Ensure() };
        Some(Self {
            state: Some(state),
            _not_send: PhantomData,
        })
    }
}

impl Drop for GilGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            unsafe { ffi::PyGILState_Release(state) };
        }
        HELD.with(|held| held.set(false));
    }
}
