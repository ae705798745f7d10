//! Foreign object handles
//!
//! Design: ownership is carried by the type, not by a flag.
//! - [`PyObj`] owns exactly one strong reference and releases it on drop.
//! - [`ObjRef`] borrows a reference owned by someone else (a `PyObj`, a
//!   container slot, the interpreter handle) and never releases anything.
//!
//! Moving a `PyObj` into a container that steals references consumes it via
//! [`PyObj::into_raw`], so a reference always has exactly one releaser.

mod convert;
mod value;

use std::ffi::{CStr, CString};
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr::{self, NonNull};

use pyo3::ffi;
use tracing::trace;

use crate::errors::{ContainerKind, Error, Result};
use crate::runtime::{Interpreter, Stat};

pub use convert::{FromPython, ToPython};
pub use value::{TypeTag, Value};

/// Owning handle to an interpreter object.
///
/// Bound to the [`Interpreter`] it was created under, which keeps the GIL
/// held for as long as the handle exists.
pub struct PyObj<'py> {
    ptr: NonNull<ffi::PyObject>,
    py: &'py Interpreter,
}

/// Non-owning view of an interpreter object.
///
/// `'a` bounds the owner of the reference (a list, dict or `PyObj`),
/// `'py` the interpreter handle.
#[derive(Clone, Copy)]
pub struct ObjRef<'a, 'py> {
    ptr: NonNull<ffi::PyObject>,
    py: &'py Interpreter,
    _owner: PhantomData<&'a ()>,
}

impl<'py> PyObj<'py> {
    /// Take ownership of a new reference.
    ///
    /// # Safety
    /// `ptr` must be null or a new (owned) reference obtained while `py` holds
    /// the GIL.
    pub unsafe fn from_owned_ptr(py: &'py Interpreter, ptr: *mut ffi::PyObject) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, py })
    }

    /// Take a new reference to a borrowed pointer.
    ///
    /// # Safety
    /// `ptr` must be null or a valid object pointer.
    pub unsafe fn from_borrowed_ptr(py: &'py Interpreter, ptr: *mut ffi::PyObject) -> Option<Self> {
        let ptr = NonNull::new(ptr)?;
        ffi::Py_IncRef(ptr.as_ptr());
        Some(Self { ptr, py })
    }

    /// Like [`PyObj::from_owned_ptr`], turning null into the pending error.
    ///
    /// # Safety
    /// See [`PyObj::from_owned_ptr`].
    pub(crate) unsafe fn from_owned_or_err(py: &'py Interpreter, ptr: *mut ffi::PyObject) -> Result<Self> {
        Self::from_owned_ptr(py, ptr).ok_or_else(|| Error::Exception(py.take_error()))
    }

    pub fn as_ptr(&self) -> *mut ffi::PyObject {
        self.ptr.as_ptr()
    }

    /// Give up ownership, returning the reference to the caller
    pub fn into_raw(self) -> *mut ffi::PyObject {
        ManuallyDrop::new(self).ptr.as_ptr()
    }

    pub fn as_borrowed(&self) -> ObjRef<'_, 'py> {
        ObjRef {
            ptr: self.ptr,
            py: self.py,
            _owner: PhantomData,
        }
    }

    pub fn interpreter(&self) -> &'py Interpreter {
        self.py
    }

    /// New reference to the same object, bound to another handle on this thread
    pub(crate) fn rebind<'p>(&self, py: &'p Interpreter) -> PyObj<'p> {
        unsafe { ffi::Py_IncRef(self.as_ptr()) };
        PyObj { ptr: self.ptr, py }
    }

    /// The interpreter's `None`
    pub fn none(py: &'py Interpreter) -> Self {
        unsafe {
            let none = ffi::Py_None();
            ffi::Py_IncRef(none);
            Self {
                ptr: NonNull::new_unchecked(none),
                py,
            }
        }
    }

    pub fn string(py: &'py Interpreter, text: &str) -> Result<Self> {
        let raw = unsafe {
            ffi::PyUnicode_FromStringAndSize(text.as_ptr().cast(), text.len() as ffi::Py_ssize_t)
        };
        unsafe { Self::from_owned_or_err(py, raw) }
    }

    /// Build a tuple from the given items; an empty slice yields `()`
    pub fn tuple<T: ToPython>(py: &'py Interpreter, items: &[T]) -> Result<Self> {
        let tuple = unsafe { Self::new_container(py, ffi::PyTuple_New(items.len() as ffi::Py_ssize_t), ContainerKind::Tuple) }?;
        for (index, item) in items.iter().enumerate() {
            let item = item.to_python(py)?;
            // steals the item reference, even on failure
            if unsafe { ffi::PyTuple_SetItem(tuple.as_ptr(), index as ffi::Py_ssize_t, item.into_raw()) } != 0 {
                py.last_error();
                return Err(Error::ElementInsertion { index });
            }
        }
        Ok(tuple)
    }

    pub fn list<T: ToPython>(py: &'py Interpreter, items: &[T]) -> Result<Self> {
        let list = unsafe { Self::new_container(py, ffi::PyList_New(items.len() as ffi::Py_ssize_t), ContainerKind::List) }?;
        for (index, item) in items.iter().enumerate() {
            let item = item.to_python(py)?;
            if unsafe { ffi::PyList_SetItem(list.as_ptr(), index as ffi::Py_ssize_t, item.into_raw()) } != 0 {
                py.last_error();
                return Err(Error::ElementInsertion { index });
            }
        }
        Ok(list)
    }

    pub fn dict<'e, K, T>(py: &'py Interpreter, entries: impl IntoIterator<Item = (K, &'e T)>) -> Result<Self>
    where
        K: AsRef<str>,
        T: ToPython + ?Sized + 'e,
    {
        let dict = unsafe { Self::new_container(py, ffi::PyDict_New(), ContainerKind::Dict) }?;
        for (index, (key, value)) in entries.into_iter().enumerate() {
            let key = Self::string(py, key.as_ref())?;
            let value = value.to_python(py)?;
            // PyDict_SetItem takes its own references; ours drop normally
            if unsafe { ffi::PyDict_SetItem(dict.as_ptr(), key.as_ptr(), value.as_ptr()) } != 0 {
                py.last_error();
                return Err(Error::ElementInsertion { index });
            }
        }
        Ok(dict)
    }

    unsafe fn new_container(py: &'py Interpreter, raw: *mut ffi::PyObject, kind: ContainerKind) -> Result<Self> {
        Self::from_owned_ptr(py, raw).ok_or_else(|| {
            py.last_error();
            Error::NullContainer { kind }
        })
    }

    /// Wrap a native file as an interpreter file object.
    ///
    /// The descriptor is duplicated; the interpreter closes its copy.
    #[cfg(unix)]
    pub fn from_file(py: &'py Interpreter, file: &std::fs::File, mode: &str) -> Result<Self> {
        use std::os::fd::IntoRawFd;

        let mode = CString::new(mode)?;
        let fd = file.try_clone()?.into_raw_fd();
        let raw = unsafe {
            ffi::PyFile_FromFd(
                fd,
                c"<native file>".as_ptr(),
                mode.as_ptr(),
                -1,
                ptr::null(),
                ptr::null(),
                ptr::null(),
                1,
            )
        };
        unsafe { Self::from_owned_or_err(py, raw) }
    }

    pub fn type_name(&self) -> String {
        self.as_borrowed().type_name()
    }

    pub fn type_tag(&self) -> TypeTag {
        self.as_borrowed().type_tag()
    }

    pub fn is_none(&self) -> bool {
        self.as_borrowed().is_none()
    }

    pub fn ref_count(&self) -> isize {
        unsafe { ffi::Py_REFCNT(self.as_ptr()) }
    }

    /// Convert to a native value by dispatching on the type tag
    pub fn to_value(&self) -> Result<Value<'py>> {
        self.as_borrowed().to_value()
    }

    pub fn extract<T: FromPython<'py>>(&self) -> Result<T> {
        self.as_borrowed().extract()
    }

    pub fn has_attr(&self, name: &str) -> Result<bool> {
        self.as_borrowed().has_attr(name)
    }

    /// Read an attribute. `Ok(None)` means the attribute does not exist.
    pub fn load(&self, name: &str) -> Result<Option<PyObj<'py>>> {
        self.as_borrowed().load(name)
    }

    /// Write an attribute, replacing any previous value
    pub fn save<T: ToPython + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        self.as_borrowed().save(name, value)
    }

    /// Call the attribute `name` with `args`.
    ///
    /// `Ok(None)` means there is no such attribute. `None` and an empty slice
    /// both call without an argument tuple.
    pub fn call(&self, name: &str, args: Option<&[Value<'py>]>) -> Result<Option<PyObj<'py>>> {
        self.as_borrowed().call(name, args)
    }

    /// Call this object itself
    pub fn invoke(&self, args: Option<&[Value<'py>]>) -> Result<PyObj<'py>> {
        self.as_borrowed().invoke(args)
    }

    /// Instantiate this class with `args`. Counted as a construction, not a call.
    pub fn construct(&self, args: Option<&[Value<'py>]>) -> Result<PyObj<'py>> {
        self.py.record(Stat::Construct);
        let instance = self.as_borrowed().call_object(args)?;
        tracing::debug!(event = "construct", instance = %instance.type_name());
        Ok(instance)
    }
}

impl Clone for PyObj<'_> {
    fn clone(&self) -> Self {
        unsafe { ffi::Py_IncRef(self.as_ptr()) };
        Self {
            ptr: self.ptr,
            py: self.py,
        }
    }
}

impl Drop for PyObj<'_> {
    fn drop(&mut self) {
        unsafe { ffi::Py_DecRef(self.ptr.as_ptr()) };
    }
}

impl fmt::Debug for PyObj<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.as_borrowed(), f)
    }
}

impl<'a, 'py> ObjRef<'a, 'py> {
    /// # Safety
    /// `ptr` must be null or valid for `'a`, and `py` must hold the GIL.
    pub unsafe fn from_ptr(py: &'py Interpreter, ptr: *mut ffi::PyObject) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self::from_non_null(py, ptr))
    }

    pub(crate) unsafe fn from_non_null(py: &'py Interpreter, ptr: NonNull<ffi::PyObject>) -> Self {
        Self {
            ptr,
            py,
            _owner: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *mut ffi::PyObject {
        self.ptr.as_ptr()
    }

    pub fn interpreter(&self) -> &'py Interpreter {
        self.py
    }

    /// Take a strong reference of our own
    pub fn upgrade(&self) -> PyObj<'py> {
        unsafe { ffi::Py_IncRef(self.as_ptr()) };
        PyObj {
            ptr: self.ptr,
            py: self.py,
        }
    }

    /// The runtime type name (`tp_name`), e.g. `str` or `_io.TextIOWrapper`
    pub fn type_name(&self) -> String {
        unsafe {
            let ty = ffi::Py_TYPE(self.as_ptr());
            CStr::from_ptr((*ty).tp_name).to_string_lossy().into_owned()
        }
    }

    pub fn type_tag(&self) -> TypeTag {
        TypeTag::from_name(&self.type_name())
    }

    pub fn is_none(&self) -> bool {
        self.as_ptr() == unsafe { ffi::Py_None() }
    }

    pub fn to_value(&self) -> Result<Value<'py>> {
        let value = value::decode(*self);
        if value.is_err() {
            self.py.record(Stat::ConversionFailure);
        }
        value
    }

    pub fn extract<T: FromPython<'py>>(&self) -> Result<T> {
        let value = T::from_python(*self);
        if value.is_err() {
            self.py.record(Stat::ConversionFailure);
        }
        value
    }

    /// Borrowed items of a list or tuple
    pub fn list_items(&self) -> Result<Vec<ObjRef<'a, 'py>>> {
        let is_list = match self.type_tag() {
            TypeTag::List => true,
            TypeTag::Tuple => false,
            other => return Err(Error::type_mismatch("list or tuple", other.name())),
        };
        let size = unsafe {
            if is_list {
                ffi::PyList_Size(self.as_ptr())
            } else {
                ffi::PyTuple_Size(self.as_ptr())
            }
        };

        let mut items = Vec::with_capacity(size.max(0) as usize);
        for index in 0..size {
            let raw = unsafe {
                if is_list {
                    ffi::PyList_GetItem(self.as_ptr(), index)
                } else {
                    ffi::PyTuple_GetItem(self.as_ptr(), index)
                }
            };
            let item = unsafe { Self::from_ptr(self.py, raw) }
                .ok_or_else(|| Error::Exception(self.py.take_error()))?;
            items.push(item);
        }
        Ok(items)
    }

    /// Borrowed `(key, value)` pairs of a dict, in insertion order
    pub fn dict_items(&self) -> Result<Vec<(ObjRef<'a, 'py>, ObjRef<'a, 'py>)>> {
        if self.type_tag() != TypeTag::Dict {
            return Err(Error::type_mismatch("dict", self.type_name()));
        }

        let mut items = Vec::new();
        let mut pos: ffi::Py_ssize_t = 0;
        let mut key = ptr::null_mut();
        let mut value = ptr::null_mut();
        while unsafe { ffi::PyDict_Next(self.as_ptr(), &mut pos, &mut key, &mut value) } != 0 {
            if let (Some(key), Some(value)) = unsafe { (Self::from_ptr(self.py, key), Self::from_ptr(self.py, value)) } {
                items.push((key, value));
            }
        }
        Ok(items)
    }

    pub fn has_attr(&self, name: &str) -> Result<bool> {
        Ok(self.load(name)?.is_some())
    }

    pub fn load(&self, name: &str) -> Result<Option<PyObj<'py>>> {
        let cname = CString::new(name)?;
        trace!(event = "load", attr = name);

        let raw = unsafe { ffi::PyObject_GetAttrString(self.as_ptr(), cname.as_ptr()) };
        if let Some(attr) = unsafe { PyObj::from_owned_ptr(self.py, raw) } {
            return Ok(Some(attr));
        }

        if unsafe { ffi::PyErr_ExceptionMatches(ffi::PyExc_AttributeError) } != 0 {
            unsafe { ffi::PyErr_Clear() };
            return Ok(None);
        }
        Err(Error::Exception(self.py.take_error()))
    }

    pub fn save<T: ToPython + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let cname = CString::new(name)?;
        let value = value.to_python(self.py)?;
        trace!(event = "save", attr = name, value_type = %value.type_name());

        if unsafe { ffi::PyObject_SetAttrString(self.as_ptr(), cname.as_ptr(), value.as_ptr()) } != 0 {
            return Err(Error::AttributeSave {
                name: name.to_string(),
                message: self.py.take_error(),
            });
        }
        Ok(())
    }

    pub fn call(&self, name: &str, args: Option<&[Value<'py>]>) -> Result<Option<PyObj<'py>>> {
        let Some(function) = self.load(name)? else {
            trace!(event = "call_missing", attr = name);
            return Ok(None);
        };
        trace!(event = "call", attr = name, args = args.map_or(0, <[_]>::len));
        function.invoke(args).map(Some)
    }

    pub fn invoke(&self, args: Option<&[Value<'py>]>) -> Result<PyObj<'py>> {
        self.py.record(Stat::Call);
        self.call_object(args)
    }

    fn call_object(&self, args: Option<&[Value<'py>]>) -> Result<PyObj<'py>> {
        let args = match args {
            Some(args) if !args.is_empty() => Some(PyObj::tuple(self.py, args)?),
            _ => None,
        };

        let raw = unsafe {
            ffi::PyObject_CallObject(self.as_ptr(), args.as_ref().map_or(ptr::null_mut(), PyObj::as_ptr))
        };
        unsafe { PyObj::from_owned_or_err(self.py, raw) }
    }
}

impl fmt::Debug for ObjRef<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} object at {:p}>", self.type_name(), self.ptr)
    }
}

/// `str(obj)` as UTF-8, or `None` (error cleared) if that fails.
///
/// # Safety
/// `obj` must be a valid object pointer and the GIL must be held.
pub(crate) unsafe fn text_of(obj: *mut ffi::PyObject) -> Option<String> {
    let text = ffi::PyObject_Str(obj);
    if text.is_null() {
        ffi::PyErr_Clear();
        return None;
    }
    let result = utf8_of(text);
    ffi::Py_DecRef(text);
    if result.is_none() {
        ffi::PyErr_Clear();
    }
    result
}

/// Contents of a `str` object; `None` leaves the interpreter's error set.
///
/// # Safety
/// `text` must point to a `str` object and the GIL must be held.
pub(crate) unsafe fn utf8_of(text: *mut ffi::PyObject) -> Option<String> {
    let mut size: ffi::Py_ssize_t = 0;
    let data = ffi::PyUnicode_AsUTF8AndSize(text, &mut size);
    if data.is_null() {
        return None;
    }
    let bytes = std::slice::from_raw_parts(data.cast::<u8>(), size as usize);
    // the interpreter guarantees valid UTF-8 here
    Some(String::from_utf8_lossy(bytes).into_owned())
}
