//! Call arguments as tagged values.
//!
//! Every argument is carried as a [`serde_json::Value`], which gives the
//! fingerprint a canonical encoding and lets the path classifier tell
//! strings apart from everything else without runtime type inspection.

use std::collections::BTreeMap;
use std::fmt;

use serde::{ser, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CodecError, MemoError};

/// The role an argument plays in a call: its position or its keyword.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ArgRole {
    /// Zero-based positional index.
    Positional(usize),
    /// Keyword argument name.
    Keyword(String),
}

impl fmt::Display for ArgRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgRole::Positional(i) => write!(f, "#{i}"),
            ArgRole::Keyword(name) => f.write_str(name),
        }
    }
}

/// Positional and keyword arguments of one call.
///
/// Keywords are kept sorted by name, so two calls that pass the same keywords
/// in a different order are the same call.
///
/// Values with no faithful JSON form (NaN, infinities, maps with non-string
/// keys) are refused: [`CallArgs::try_arg`] reports them immediately, while
/// [`CallArgs::arg`] records them so that fingerprinting the call fails with
/// [`MemoError::Serialization`] instead of caching under a lossy key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
    rejected: Vec<(ArgRole, String)>,
}

impl CallArgs {
    /// Creates an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Serialize) -> Self {
        let role = ArgRole::Positional(self.positional.len());
        let value = self.accept(role, &value);
        self.positional.push(value);
        self
    }

    /// Sets a keyword argument, replacing any previous value for `name`.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        let name = name.into();
        self.rejected
            .retain(|(role, _)| !matches!(role, ArgRole::Keyword(k) if *k == name));
        let value = self.accept(ArgRole::Keyword(name.clone()), &value);
        self.keyword.insert(name, value);
        self
    }

    /// Appends a positional argument, failing if it has no JSON form.
    pub fn try_arg<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, MemoError> {
        let value = to_value(value)?;
        Ok(self.arg(value))
    }

    /// Sets a keyword argument, failing if it has no JSON form.
    pub fn try_kwarg<T: Serialize + ?Sized>(
        self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, MemoError> {
        let value = to_value(value)?;
        Ok(self.kwarg(name, value))
    }

    /// Positional arguments in call order.
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// Keyword arguments sorted by name.
    pub fn keyword(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }

    /// Returns the positional argument at `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Returns the positional argument at `index` if it is a string.
    pub fn str_at(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(Value::as_str)
    }

    /// Returns the positional argument at `index` if it is an integer.
    pub fn i64_at(&self, index: usize) -> Option<i64> {
        self.get(index).and_then(Value::as_i64)
    }

    /// Returns the keyword argument `name`.
    pub fn get_kw(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    /// Returns the keyword argument `name` if it is a string.
    pub fn str_kw(&self, name: &str) -> Option<&str> {
        self.get_kw(name).and_then(Value::as_str)
    }

    /// Iterates over every argument with its role: positionals first, then
    /// keywords by name.
    pub fn iter(&self) -> impl Iterator<Item = (ArgRole, &Value)> {
        let positional = self
            .positional
            .iter()
            .enumerate()
            .map(|(i, v)| (ArgRole::Positional(i), v));
        let keyword = self
            .keyword
            .iter()
            .map(|(k, v)| (ArgRole::Keyword(k.clone()), v));
        positional.chain(keyword)
    }

    /// Fails with the first argument that was refused by [`CallArgs::arg`] or
    /// [`CallArgs::kwarg`].
    pub fn validate(&self) -> Result<(), MemoError> {
        match self.rejected.first() {
            Some((role, reason)) => Err(MemoError::Serialization(CodecError::Encode {
                reason: format!("argument {role}: {reason}"),
            })),
            None => Ok(()),
        }
    }

    fn accept<T: Serialize + ?Sized>(&mut self, role: ArgRole, value: &T) -> Value {
        match to_value(value) {
            Ok(value) => value,
            Err(e) => {
                let reason = match e {
                    MemoError::Serialization(CodecError::Encode { reason }) => reason,
                    other => other.to_string(),
                };
                self.rejected.push((role, reason));
                Value::Null
            }
        }
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, MemoError> {
    let encode = |reason: String| MemoError::Serialization(CodecError::Encode { reason });
    value
        .serialize(FiniteFloats)
        .map_err(|e| encode(e.0))?;
    serde_json::to_value(value).map_err(|e| encode(e.to_string()))
}

/// Serializer that only walks a value, failing on NaN and infinities.
///
/// `serde_json` writes those as `null`, which would make `f(NaN)`, `f(inf)`
/// and `f(())` the same call.
#[derive(Clone, Copy)]
struct FiniteFloats;

#[derive(Debug)]
struct NonFinite(String);

impl fmt::Display for NonFinite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for NonFinite {}

impl ser::Error for NonFinite {
    fn custom<M: fmt::Display>(msg: M) -> Self {
        NonFinite(msg.to_string())
    }
}

fn check_float(v: f64) -> Result<(), NonFinite> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(NonFinite(format!("non-finite float {v} has no JSON form")))
    }
}

macro_rules! accept_scalars {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(fn $method(self, _: $ty) -> Result<(), NonFinite> { Ok(()) })*
    };
}

impl ser::Serializer for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    accept_scalars! {
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_i128: i128,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_u128: u128,
        serialize_char: char,
        serialize_str: &str,
        serialize_bytes: &[u8],
        serialize_unit_struct: &'static str,
    }

    fn serialize_f32(self, v: f32) -> Result<(), NonFinite> {
        check_float(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<(), NonFinite> {
        check_float(v)
    }

    fn serialize_none(self) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<(), NonFinite> {
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self, NonFinite> {
        Ok(self)
    }
}

macro_rules! walk_compound {
    ($($trait:ident::$method:ident),* $(,)?) => {
        $(impl ser::$trait for FiniteFloats {
            type Ok = ();
            type Error = NonFinite;

            fn $method<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
                value.serialize(*self)
            }

            fn end(self) -> Result<(), NonFinite> {
                Ok(())
            }
        })*
    };
}

walk_compound! {
    SerializeSeq::serialize_element,
    SerializeTuple::serialize_element,
    SerializeTupleStruct::serialize_field,
    SerializeTupleVariant::serialize_field,
}

impl ser::SerializeMap for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<(), NonFinite> {
        key.serialize(*self)
    }

    fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<(), NonFinite> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeStruct for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FiniteFloats {
    type Ok = ();
    type Error = NonFinite;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _: &'static str,
        value: &T,
    ) -> Result<(), NonFinite> {
        value.serialize(*self)
    }

    fn end(self) -> Result<(), NonFinite> {
        Ok(())
    }
}
