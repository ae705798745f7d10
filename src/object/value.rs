//! Native value model and the type-tag dispatch between it and the interpreter

use indexmap::IndexMap;
use pyo3::ffi;

use super::{utf8_of, ObjRef, PyObj};
use crate::errors::{Error, Result};

/// Runtime type of an interpreter object, decoded from its type name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeTag {
    NoneType,
    Bool,
    Str,
    Int,
    Float,
    List,
    Tuple,
    Dict,
    /// `io` objects wrapping a file descriptor
    File,
    Other(String),
}

impl TypeTag {
    pub fn from_name(name: &str) -> Self {
        match name {
            "NoneType" => Self::NoneType,
            "bool" => Self::Bool,
            "str" => Self::Str,
            "int" => Self::Int,
            "float" => Self::Float,
            "list" => Self::List,
            "tuple" => Self::Tuple,
            "dict" => Self::Dict,
            "_io.TextIOWrapper" | "_io.BufferedReader" | "_io.BufferedWriter"
            | "_io.BufferedRandom" | "_io.FileIO" => Self::File,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::NoneType => "NoneType",
            Self::Bool => "bool",
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Dict => "dict",
            Self::File => "file",
            Self::Other(name) => name,
        }
    }
}

/// A native value on its way into or out of the interpreter.
///
/// `Object` carries a handle through unchanged. `Unrecognized` is only ever
/// produced by decoding and names the type that had no native counterpart.
#[derive(Debug)]
pub enum Value<'py> {
    None,
    Bool(bool),
    Str(String),
    Int(i64),
    Float(f64),
    List(Vec<Value<'py>>),
    Tuple(Vec<Value<'py>>),
    Dict(IndexMap<String, Value<'py>>),
    #[cfg(unix)]
    File(std::fs::File),
    Object(PyObj<'py>),
    Unrecognized(String),
}

impl<'py> Value<'py> {
    /// Name of the interpreter type this value maps to
    pub fn type_name(&self) -> String {
        match self {
            Self::None => "NoneType".to_string(),
            Self::Bool(_) => "bool".to_string(),
            Self::Str(_) => "str".to_string(),
            Self::Int(_) => "int".to_string(),
            Self::Float(_) => "float".to_string(),
            Self::List(_) => "list".to_string(),
            Self::Tuple(_) => "tuple".to_string(),
            Self::Dict(_) => "dict".to_string(),
            #[cfg(unix)]
            Self::File(_) => "file".to_string(),
            Self::Object(obj) => obj.type_name(),
            Self::Unrecognized(name) => name.clone(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Floats, and ints widened to float
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            Self::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Items of a list or tuple
    pub fn as_list(&self) -> Option<&[Value<'py>]> {
        match self {
            Self::List(items) | Self::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&IndexMap<String, Value<'py>>> {
        match self {
            Self::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Convert into a new interpreter object
    pub fn to_object(&self, py: &'py crate::Interpreter) -> Result<PyObj<'py>> {
        encode(self, py)
    }
}

pub(super) fn encode<'py>(value: &Value<'_>, py: &'py crate::Interpreter) -> Result<PyObj<'py>> {
    let raw = unsafe {
        match value {
            Value::None => return Ok(PyObj::none(py)),
            Value::Bool(b) => ffi::PyBool_FromLong(*b as std::os::raw::c_long),
            Value::Str(s) => return PyObj::string(py, s),
            Value::Int(n) => ffi::PyLong_FromLongLong(*n),
            Value::Float(x) => ffi::PyFloat_FromDouble(*x),
            Value::List(items) => return PyObj::list(py, items.as_slice()),
            Value::Tuple(items) => return PyObj::tuple(py, items.as_slice()),
            Value::Dict(map) => return PyObj::dict(py, map),
            #[cfg(unix)]
            Value::File(file) => return PyObj::from_file(py, file, "r+"),
            Value::Object(obj) => return Ok(obj.rebind(py)),
            Value::Unrecognized(name) => {
                py.record(crate::runtime::Stat::ConversionFailure);
                return Err(Error::unsupported(name.clone()));
            }
        }
    };
    unsafe { PyObj::from_owned_or_err(py, raw) }
}

/// Dispatch on the type tag. Unknown tags decode to `Value::Unrecognized`.
pub(super) fn decode<'py>(obj: ObjRef<'_, 'py>) -> Result<Value<'py>> {
    let py = obj.interpreter();
    let ptr = obj.as_ptr();

    let value = match obj.type_tag() {
        TypeTag::NoneType => Value::None,
        TypeTag::Bool => Value::Bool(ptr == unsafe { ffi::Py_True() }),
        TypeTag::Str => match unsafe { utf8_of(ptr) } {
            Some(text) => Value::Str(text),
            None => return Err(Error::InvalidString(py.take_error())),
        },
        TypeTag::Int => {
            let n = unsafe { ffi::PyLong_AsLongLong(ptr) };
            if n == -1 && !unsafe { ffi::PyErr_Occurred() }.is_null() {
                return Err(Error::Exception(py.take_error()));
            }
            Value::Int(n)
        }
        TypeTag::Float => {
            let x = unsafe { ffi::PyFloat_AsDouble(ptr) };
            if x == -1.0 && !unsafe { ffi::PyErr_Occurred() }.is_null() {
                return Err(Error::Exception(py.take_error()));
            }
            Value::Float(x)
        }
        TypeTag::List => Value::List(decode_items(obj)?),
        TypeTag::Tuple => Value::Tuple(decode_items(obj)?),
        TypeTag::Dict => {
            let mut map = IndexMap::new();
            for (key, value) in obj.dict_items()? {
                if key.type_tag() != TypeTag::Str {
                    return Err(Error::type_mismatch("str dict key", key.type_name()));
                }
                map.insert(key.extract::<String>()?, decode(value)?);
            }
            Value::Dict(map)
        }
        #[cfg(unix)]
        TypeTag::File => Value::File(obj.extract::<std::fs::File>()?),
        #[cfg(not(unix))]
        TypeTag::File => Value::Unrecognized(obj.type_name()),
        TypeTag::Other(name) => Value::Unrecognized(name),
    };
    Ok(value)
}

fn decode_items<'py>(obj: ObjRef<'_, 'py>) -> Result<Vec<Value<'py>>> {
    obj.list_items()?.into_iter().map(decode).collect()
}

impl From<bool> for Value<'_> {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value<'_> {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for Value<'_> {
    fn from(n: i32) -> Self {
        Self::Int(n.into())
    }
}

impl From<f64> for Value<'_> {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<&str> for Value<'_> {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value<'_> {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl<'py> From<Vec<Value<'py>>> for Value<'py> {
    fn from(items: Vec<Value<'py>>) -> Self {
        Self::List(items)
    }
}

impl<'py> From<IndexMap<String, Value<'py>>> for Value<'py> {
    fn from(map: IndexMap<String, Value<'py>>) -> Self {
        Self::Dict(map)
    }
}

impl<'py> From<PyObj<'py>> for Value<'py> {
    fn from(obj: PyObj<'py>) -> Self {
        Self::Object(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Interpreter;

    #[test]
    fn test_tag_names() {
        assert_eq!(TypeTag::from_name("str"), TypeTag::Str);
        assert_eq!(TypeTag::from_name("_io.TextIOWrapper"), TypeTag::File);
        assert_eq!(TypeTag::from_name("Person"), TypeTag::Other("Person".to_string()));
        assert_eq!(TypeTag::from_name("collections.OrderedDict").name(), "collections.OrderedDict");
        assert_eq!(TypeTag::Dict.name(), "dict");
    }

    #[test]
    fn test_scalars_roundtrip() {
        let py = Interpreter::initialize().unwrap();
        for value in [Value::Int(-7), Value::Float(2.5), Value::Bool(true), Value::from("héllo"), Value::None] {
            let obj = value.to_object(&py).unwrap();
            assert_eq!(obj.type_name(), value.type_name());
            let back = obj.to_value().unwrap();
            assert_eq!(back.type_name(), value.type_name());
            assert_eq!(back.as_int(), value.as_int());
            assert_eq!(back.as_float(), value.as_float());
            assert_eq!(back.as_str(), value.as_str());
            assert_eq!(back.as_bool(), value.as_bool());
        }
    }

    #[test]
    fn test_nested_containers() {
        let py = Interpreter::initialize().unwrap();
        let mut map = IndexMap::new();
        map.insert("name".to_string(), Value::from("rocky"));
        map.insert("scores".to_string(), Value::List(vec![Value::Int(1), Value::Float(2.5)]));
        map.insert("pair".to_string(), Value::Tuple(vec![Value::Bool(true), Value::None]));

        let obj = Value::Dict(map).to_object(&py).unwrap();
        assert_eq!(obj.type_tag(), TypeTag::Dict);

        let back = obj.to_value().unwrap();
        let dict = back.as_dict().unwrap();
        assert_eq!(dict.keys().collect::<Vec<_>>(), ["name", "scores", "pair"]);
        assert_eq!(dict["name"].as_str(), Some("rocky"));

        let scores = dict["scores"].as_list().unwrap();
        assert_eq!(scores[0].as_int(), Some(1));
        assert_eq!(scores[1].as_float(), Some(2.5));

        assert!(matches!(dict["pair"], Value::Tuple(ref items) if items.len() == 2 && items[1].is_none()));
    }

    #[test]
    fn test_unrecognized_is_explicit() {
        let py = Interpreter::initialize().unwrap();
        let builtins = py.import("builtins", None).unwrap();
        let set = builtins.call("set", None).unwrap().unwrap();

        match set.to_value().unwrap() {
            Value::Unrecognized(name) => assert_eq!(name, "set"),
            other => panic!("unexpected value {:?}", other),
        }

        let err = Value::Unrecognized("set".to_string()).to_object(&py).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType { ref type_name } if type_name == "set"));
        assert_eq!(py.stats().conversion_failures, 1);
    }

    #[test]
    fn test_object_passes_through() {
        let py = Interpreter::initialize().unwrap();
        let math = py.import("math", None).unwrap();
        let wrapped = Value::Object(math.clone()).to_object(&py).unwrap();
        assert_eq!(wrapped.as_ptr(), math.as_ptr());
    }

    #[test]
    fn test_int_overflow_is_an_error() {
        let py = Interpreter::initialize().unwrap();
        let builtins = py.import("builtins", None).unwrap();
        let huge = builtins
            .call("int", Some(&[Value::from("123456789012345678901234567890")]))
            .unwrap()
            .unwrap();

        match huge.to_value() {
            Err(Error::Exception(text)) => assert!(text.contains("OverflowError"), "{}", text),
            other => panic!("unexpected result {:?}", other),
        };
    }

    #[test]
    fn test_non_string_keys_rejected() {
        let py = Interpreter::initialize().unwrap();
        let builtins = py.import("builtins", None).unwrap();
        let pairs = Value::List(vec![Value::Tuple(vec![Value::Int(1), Value::from("one")])]);
        let dict = builtins.call("dict", Some(&[pairs])).unwrap().unwrap();

        assert!(matches!(dict.to_value(), Err(Error::TypeMismatch { .. })));
    }
}
