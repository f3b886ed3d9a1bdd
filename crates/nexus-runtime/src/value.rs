use std::collections::BTreeMap;

use bytes::Bytes;
use minicbor::{Decoder, Encoder, data::Type};
use thiserror::Error;

/// Tagged value exchanged across the host/handler boundary.
///
/// On the wire a value is encoded as compact self-describing CBOR; use
/// [`RuntimeValue::to_cbor`] and [`RuntimeValue::from_cbor`] at the boundary
/// and [`RuntimeValue::from_json`] / [`RuntimeValue::to_json`] when a host
/// layer only speaks JSON.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum RuntimeValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<RuntimeValue>),
    Map(BTreeMap<String, RuntimeValue>),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("CBOR decode error")]
    Decode(#[from] minicbor::decode::Error),
    #[error("CBOR encode error: {0}")]
    Encode(String),
    #[error("JSON error")]
    Json(#[from] serde_json::Error),
}

impl RuntimeValue {
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a key on a map value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Encode to CBOR bytes.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    pub fn to_cbor(&self) -> Result<Bytes, Error> {
        let mut out = Vec::new();
        let mut encoder = Encoder::new(&mut out);
        self.encode_cbor(&mut encoder)
            .map_err(|e| Error::Encode(e.to_string()))?;
        Ok(Bytes::from(out))
    }

    /// Decode from CBOR bytes. Trailing bytes are rejected.
    ///
    /// # Errors
    /// Returns an error if the input is not a single well-formed value.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, Error> {
        let mut decoder = Decoder::new(bytes);
        let value = Self::decode_cbor(&mut decoder)?;
        if decoder.position() != bytes.len() {
            return Err(Error::Decode(minicbor::decode::Error::message(
                "trailing bytes after value",
            )));
        }
        Ok(value)
    }

    /// Convert a JSON string into a runtime value.
    ///
    /// # Errors
    /// Returns an error if JSON parsing fails.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Ok(Self::from(value))
    }

    /// Convert a runtime value into a JSON string.
    ///
    /// # Errors
    /// Returns an error if JSON serialization fails.
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::Value::from(self.clone()).to_string())
    }

    fn encode_cbor<W: minicbor::encode::Write>(
        &self,
        e: &mut Encoder<W>,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        match self {
            Self::Null => {
                e.null()?;
            }
            Self::Bool(b) => {
                e.bool(*b)?;
            }
            Self::Int(i) => {
                e.i64(*i)?;
            }
            Self::Float(f) => {
                e.f64(*f)?;
            }
            Self::String(s) => {
                e.str(s)?;
            }
            Self::List(items) => {
                e.array(items.len() as u64)?;
                for item in items {
                    item.encode_cbor(e)?;
                }
            }
            Self::Map(map) => {
                e.map(map.len() as u64)?;
                for (key, value) in map {
                    e.str(key)?;
                    value.encode_cbor(e)?;
                }
            }
        }
        Ok(())
    }

    fn decode_cbor(d: &mut Decoder<'_>) -> Result<Self, minicbor::decode::Error> {
        match d.datatype()? {
            Type::Null | Type::Undefined => {
                d.skip()?;
                Ok(Self::Null)
            }
            Type::Bool => Ok(Self::Bool(d.bool()?)),
            Type::U8
            | Type::U16
            | Type::U32
            | Type::U64
            | Type::I8
            | Type::I16
            | Type::I32
            | Type::I64
            | Type::Int => Ok(Self::Int(d.i64()?)),
            Type::F16 => Ok(Self::Float(f64::from(d.f16()?))),
            Type::F32 => Ok(Self::Float(f64::from(d.f32()?))),
            Type::F64 => Ok(Self::Float(d.f64()?)),
            Type::String => Ok(Self::String(d.str()?.to_owned())),
            Type::Array => {
                let len = d.array()?.ok_or_else(|| {
                    minicbor::decode::Error::message("indefinite-length arrays are unsupported")
                })?;
                let mut items = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
                for _ in 0..len {
                    items.push(Self::decode_cbor(d)?);
                }
                Ok(Self::List(items))
            }
            Type::Map => {
                let len = d.map()?.ok_or_else(|| {
                    minicbor::decode::Error::message("indefinite-length maps are unsupported")
                })?;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let key = d.str()?.to_owned();
                    map.insert(key, Self::decode_cbor(d)?);
                }
                Ok(Self::Map(map))
            }
            other => Err(minicbor::decode::Error::message(format!(
                "unsupported CBOR item: {other:?}"
            ))),
        }
    }
}

impl From<bool> for RuntimeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for RuntimeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for RuntimeValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for RuntimeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for RuntimeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for RuntimeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<RuntimeValue>> for RuntimeValue {
    fn from(value: Vec<RuntimeValue>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, RuntimeValue>> for RuntimeValue {
    fn from(value: BTreeMap<String, RuntimeValue>) -> Self {
        Self::Map(value)
    }
}

impl From<serde_json::Value> for RuntimeValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || Self::Float(n.as_f64().unwrap_or(f64::NAN)),
                Self::Int,
            ),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<RuntimeValue> for serde_json::Value {
    fn from(value: RuntimeValue) -> Self {
        match value {
            RuntimeValue::Null => Self::Null,
            RuntimeValue::Bool(b) => Self::Bool(b),
            RuntimeValue::Int(i) => Self::Number(i.into()),
            RuntimeValue::Float(f) => {
                serde_json::Number::from_f64(f).map_or(Self::Null, Self::Number)
            }
            RuntimeValue::String(s) => Self::String(s),
            RuntimeValue::List(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            RuntimeValue::Map(map) => Self::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}
