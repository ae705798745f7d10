//! Typed conversions between native values and interpreter objects

use std::collections::HashMap;
use std::hash::BuildHasher;

use indexmap::IndexMap;
use pyo3::ffi;

use super::value::{self, TypeTag, Value};
use super::{utf8_of, ObjRef, PyObj};
use crate::errors::{Error, Result};
use crate::runtime::Interpreter;

/// Native data that can become a new interpreter object
pub trait ToPython {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>>;
}

/// Native data that can be read back out of an interpreter object
pub trait FromPython<'py>: Sized {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self>;
}

impl<T: ToPython + ?Sized> ToPython for &T {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        (**self).to_python(py)
    }
}

impl ToPython for str {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        PyObj::string(py, self)
    }
}

impl ToPython for String {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        PyObj::string(py, self)
    }
}

impl ToPython for i64 {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        unsafe { PyObj::from_owned_or_err(py, ffi::PyLong_FromLongLong(*self)) }
    }
}

impl ToPython for i32 {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        i64::from(*self).to_python(py)
    }
}

impl ToPython for f64 {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        unsafe { PyObj::from_owned_or_err(py, ffi::PyFloat_FromDouble(*self)) }
    }
}

impl ToPython for f32 {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        f64::from(*self).to_python(py)
    }
}

impl ToPython for bool {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        unsafe { PyObj::from_owned_or_err(py, ffi::PyBool_FromLong(*self as std::os::raw::c_long)) }
    }
}

impl<T: ToPython> ToPython for [T] {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        PyObj::list(py, self)
    }
}

impl<T: ToPython> ToPython for Vec<T> {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        PyObj::list(py, self.as_slice())
    }
}

impl<T: ToPython, S: BuildHasher> ToPython for HashMap<String, T, S> {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        PyObj::dict(py, self)
    }
}

impl<T: ToPython, S: BuildHasher> ToPython for IndexMap<String, T, S> {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        PyObj::dict(py, self)
    }
}

/// `None` maps to the interpreter's `None`
impl<T: ToPython> ToPython for Option<T> {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        match self {
            Some(value) => value.to_python(py),
            None => Ok(PyObj::none(py)),
        }
    }
}

impl ToPython for Value<'_> {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        value::encode(self, py)
    }
}

impl ToPython for PyObj<'_> {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        Ok(self.rebind(py))
    }
}

impl ToPython for ObjRef<'_, '_> {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        Ok(self.upgrade().rebind(py))
    }
}

#[cfg(unix)]
impl ToPython for std::fs::File {
    fn to_python<'py>(&self, py: &'py Interpreter) -> Result<PyObj<'py>> {
        PyObj::from_file(py, self, "r+")
    }
}

fn expect_tag(obj: ObjRef<'_, '_>, expected: &str, accepted: &[TypeTag]) -> Result<TypeTag> {
    let tag = obj.type_tag();
    if accepted.contains(&tag) {
        Ok(tag)
    } else {
        Err(Error::type_mismatch(expected, obj.type_name()))
    }
}

impl<'py> FromPython<'py> for String {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        expect_tag(obj, "str", &[TypeTag::Str])?;
        unsafe { utf8_of(obj.as_ptr()) }.ok_or_else(|| Error::InvalidString(obj.interpreter().take_error()))
    }
}

impl<'py> FromPython<'py> for i64 {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        expect_tag(obj, "int", &[TypeTag::Int, TypeTag::Bool])?;
        let n = unsafe { ffi::PyLong_AsLongLong(obj.as_ptr()) };
        if n == -1 && !unsafe { ffi::PyErr_Occurred() }.is_null() {
            return Err(Error::Exception(obj.interpreter().take_error()));
        }
        Ok(n)
    }
}

impl<'py> FromPython<'py> for i32 {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        let n = i64::from_python(obj)?;
        i32::try_from(n).map_err(|_| Error::type_mismatch("int within i32 range", n.to_string()))
    }
}

impl<'py> FromPython<'py> for f64 {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        expect_tag(obj, "float", &[TypeTag::Float, TypeTag::Int, TypeTag::Bool])?;
        // ints are widened by the interpreter
        let x = unsafe { ffi::PyFloat_AsDouble(obj.as_ptr()) };
        if x == -1.0 && !unsafe { ffi::PyErr_Occurred() }.is_null() {
            return Err(Error::Exception(obj.interpreter().take_error()));
        }
        Ok(x)
    }
}

impl<'py> FromPython<'py> for bool {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        expect_tag(obj, "bool", &[TypeTag::Bool])?;
        Ok(obj.as_ptr() == unsafe { ffi::Py_True() })
    }
}

impl<'py, T: FromPython<'py>> FromPython<'py> for Vec<T> {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        obj.list_items()?.into_iter().map(T::from_python).collect()
    }
}

impl<'py, T: FromPython<'py>, S: BuildHasher + Default> FromPython<'py> for HashMap<String, T, S> {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        obj.dict_items()?
            .into_iter()
            .map(|(key, value)| Ok((String::from_python(key)?, T::from_python(value)?)))
            .collect()
    }
}

impl<'py, T: FromPython<'py>, S: BuildHasher + Default> FromPython<'py> for IndexMap<String, T, S> {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        obj.dict_items()?
            .into_iter()
            .map(|(key, value)| Ok((String::from_python(key)?, T::from_python(value)?)))
            .collect()
    }
}

impl<'py, T: FromPython<'py>> FromPython<'py> for Option<T> {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        if obj.is_none() {
            Ok(None)
        } else {
            T::from_python(obj).map(Some)
        }
    }
}

impl<'py> FromPython<'py> for Value<'py> {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        value::decode(obj)
    }
}

impl<'py> FromPython<'py> for PyObj<'py> {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        Ok(obj.upgrade())
    }
}

/// Flushes the file object, then duplicates its descriptor
#[cfg(unix)]
impl<'py> FromPython<'py> for std::fs::File {
    fn from_python(obj: ObjRef<'_, 'py>) -> Result<Self> {
        use std::os::fd::BorrowedFd;

        expect_tag(obj, "file", &[TypeTag::File])?;
        if obj.has_attr("flush")? {
            obj.call("flush", None)?;
        }

        let fd = unsafe { ffi::PyObject_AsFileDescriptor(obj.as_ptr()) };
        if fd < 0 {
            return Err(Error::Exception(obj.interpreter().take_error()));
        }
        // the interpreter keeps its descriptor; we own the duplicate
        let owned = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?;
        Ok(std::fs::File::from(owned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_with_unicode() {
        let py = Interpreter::initialize().unwrap();
        let obj = "naïve ☃ 日本".to_python(&py).unwrap();
        assert_eq!(obj.type_tag(), TypeTag::Str);
        assert_eq!(obj.extract::<String>().unwrap(), "naïve ☃ 日本");
    }

    #[test]
    fn test_numbers_widen() {
        let py = Interpreter::initialize().unwrap();
        let three = 3i32.to_python(&py).unwrap();
        assert_eq!(three.extract::<i64>().unwrap(), 3);
        assert_eq!(three.extract::<f64>().unwrap(), 3.0);

        let truth = true.to_python(&py).unwrap();
        assert!(truth.extract::<bool>().unwrap());
        assert_eq!(truth.extract::<i64>().unwrap(), 1);
    }

    #[test]
    fn test_mismatch_reports_found_type() {
        let py = Interpreter::initialize().unwrap();
        let obj = 1.5f64.to_python(&py).unwrap();
        match obj.extract::<String>() {
            Err(Error::TypeMismatch { expected, found }) => {
                assert_eq!(expected, "str");
                assert_eq!(found, "float");
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(py.stats().conversion_failures, 1);
    }

    #[test]
    fn test_i32_range() {
        let py = Interpreter::initialize().unwrap();
        let big = (i64::from(i32::MAX) + 1).to_python(&py).unwrap();
        assert!(matches!(big.extract::<i32>(), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_sequences_and_maps() {
        let py = Interpreter::initialize().unwrap();
        let words = vec!["rocky".to_string(), "wei".to_string()];
        let list = words.to_python(&py).unwrap();
        assert_eq!(list.type_tag(), TypeTag::List);
        assert_eq!(list.extract::<Vec<String>>().unwrap(), words);

        let mut ages = IndexMap::new();
        ages.insert("rocky".to_string(), 24i64);
        ages.insert("wei".to_string(), 31i64);
        let dict = ages.to_python(&py).unwrap();
        assert_eq!(dict.extract::<IndexMap<String, i64>>().unwrap(), ages);

        let hashed: HashMap<String, i64> = dict.extract().unwrap();
        assert_eq!(hashed["wei"], 31);
    }

    #[test]
    fn test_option_maps_none() {
        let py = Interpreter::initialize().unwrap();
        let none = None::<i64>.to_python(&py).unwrap();
        assert!(none.is_none());
        assert_eq!(none.extract::<Option<i64>>().unwrap(), None);
        assert_eq!(Some(5i64).to_python(&py).unwrap().extract::<Option<i64>>().unwrap(), Some(5));
    }

    #[test]
    fn test_tuple_extracts_as_vec() {
        let py = Interpreter::initialize().unwrap();
        let tuple = PyObj::tuple(&py, &[1i64, 2, 3]).unwrap();
        assert_eq!(tuple.type_tag(), TypeTag::Tuple);
        assert_eq!(tuple.extract::<Vec<i64>>().unwrap(), vec![1, 2, 3]);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_round_trip() {
        use std::io::{Read, Seek, SeekFrom, Write};

        let py = Interpreter::initialize().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"from rust\n").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let handle = file.to_python(&py).unwrap();
        assert_eq!(handle.type_tag(), TypeTag::File);
        let line = handle.call("readline", None).unwrap().unwrap();
        assert_eq!(line.extract::<String>().unwrap(), "from rust\n");

        handle.call("write", Some(&[Value::from("from python\n")])).unwrap();
        let mut back = handle.extract::<std::fs::File>().unwrap();
        back.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        back.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "from rust\nfrom python\n");
    }
}
