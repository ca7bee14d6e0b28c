//! jsonpickle envelope codec.
//!
//! The detection backend speaks jsonpickle's JSON dialect with the numpy
//! extension. Only a closed set of tags is reconstructed: byte buffers
//! (`py/b64`), tuples and sets, `numpy.ndarray` objects, numpy scalars and
//! generic `py/object` mappings. Every other tag decodes to
//! [`Value::Unresolved`], which only fails when something reads it.

use crate::numeric::{DType, NumericArray, NumericError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ndarray::ArrayViewD;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use thiserror::Error;

pub const TAG_B64: &str = "py/b64";
pub const TAG_TUPLE: &str = "py/tuple";
pub const TAG_SET: &str = "py/set";
pub const TAG_OBJECT: &str = "py/object";
pub const TAG_STATE: &str = "py/state";
const TAG_PREFIX: &str = "py/";

const NDARRAY_CLASS: &str = "numpy.ndarray";
const NUMPY_PREFIX: &str = "numpy.";

/// Arrays with at least this many elements are written as a binary buffer,
/// matching jsonpickle's numpy handler threshold.
const BINARY_ARRAY_THRESHOLD: usize = 16;

pub type Mapping = BTreeMap<String, Value>;

#[derive(Error, Debug, PartialEq)]
pub enum EnvelopeError {
    #[error("unsupported value type: {0}")]
    UnsupportedValueType(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("cannot resolve envelope tag `{0}`")]
    TagResolution(String),
}

impl From<NumericError> for EnvelopeError {
    fn from(e: NumericError) -> Self {
        EnvelopeError::MalformedEnvelope(format!("{NDARRAY_CLASS}: {e}"))
    }
}

/// A decoded envelope value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    Map(Mapping),
    /// `numpy.ndarray`.
    Array(NumericArray),
    /// `py/object` of a class the codec does not interpret; its fields act
    /// as a mapping.
    Object { class: String, fields: Mapping },
    /// A tag outside the supported set, kept verbatim.
    Unresolved { tag: String, raw: Json },
}

impl Value {
    /// Short name of the value's kind, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "mapping",
            Value::Array(_) => "ndarray",
            Value::Object { .. } => "object",
            Value::Unresolved { .. } => "unresolved",
        }
    }

    /// Fail with [`EnvelopeError::TagResolution`] if this value is unresolved.
    pub fn resolved(&self) -> Result<&Value, EnvelopeError> {
        match self {
            Value::Unresolved { tag, .. } => Err(EnvelopeError::TagResolution(tag.clone())),
            other => Ok(other),
        }
    }

    /// Fields of a plain mapping or a generic object.
    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Value::Map(m) => Some(m),
            Value::Object { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_mapping().and_then(|m| m.get(key))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<NumericArray> for Value {
    fn from(a: NumericArray) -> Self {
        Value::Array(a)
    }
}

/// Encode a value as envelope text.
pub fn encode(value: &Value) -> Result<String, EnvelopeError> {
    let json = to_json(value)?;
    serde_json::to_string(&json).map_err(|e| EnvelopeError::UnsupportedValueType(e.to_string()))
}

/// Decode envelope text.
pub fn decode(text: &str) -> Result<Value, EnvelopeError> {
    let json: Json =
        serde_json::from_str(text).map_err(|e| EnvelopeError::MalformedEnvelope(e.to_string()))?;
    from_json(json)
}

// --- encoding ---

fn to_json(value: &Value) -> Result<Json, EnvelopeError> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => finite_number(*f)?,
        Value::Str(s) => Json::String(s.clone()),
        Value::Bytes(bytes) => b64_object(bytes),
        Value::Seq(items) => Json::Array(items.iter().map(to_json).collect::<Result<_, _>>()?),
        Value::Map(fields) => Json::Object(encode_fields(fields)?),
        Value::Array(array) => encode_ndarray(array)?,
        Value::Object { class, fields } => {
            if class.starts_with(NUMPY_PREFIX) {
                return Err(EnvelopeError::UnsupportedValueType(format!(
                    "generic object of numpy class `{class}`"
                )));
            }
            let mut obj = encode_fields(fields)?;
            obj.insert(TAG_OBJECT.to_owned(), Json::String(class.clone()));
            Json::Object(obj)
        }
        Value::Unresolved { raw, .. } => raw.clone(),
    })
}

fn finite_number(f: f64) -> Result<Json, EnvelopeError> {
    serde_json::Number::from_f64(f)
        .map(Json::Number)
        .ok_or_else(|| EnvelopeError::UnsupportedValueType(format!("non-finite float {f}")))
}

fn b64_object(bytes: &[u8]) -> Json {
    let mut obj = Map::new();
    obj.insert(TAG_B64.to_owned(), Json::String(STANDARD.encode(bytes)));
    Json::Object(obj)
}

fn encode_fields(fields: &Mapping) -> Result<Map<String, Json>, EnvelopeError> {
    let mut obj = Map::new();
    for (key, value) in fields {
        if key.starts_with(TAG_PREFIX) {
            return Err(EnvelopeError::UnsupportedValueType(format!(
                "mapping key `{key}` collides with envelope tags"
            )));
        }
        obj.insert(key.clone(), to_json(value)?);
    }
    Ok(obj)
}

fn encode_ndarray(array: &NumericArray) -> Result<Json, EnvelopeError> {
    let dtype = array.dtype();
    let mut obj = Map::new();
    obj.insert(TAG_OBJECT.to_owned(), Json::String(NDARRAY_CLASS.to_owned()));
    obj.insert("dtype".to_owned(), Json::String(dtype.name().to_owned()));

    let shape = Json::Array(array.shape().iter().map(|&d| Json::from(d)).collect());
    if array.len() >= BINARY_ARRAY_THRESHOLD || !array.all_finite() {
        obj.insert("values".to_owned(), b64_object(&array.to_le_bytes()));
        obj.insert("shape".to_owned(), shape);
        if dtype.item_size() > 1 {
            obj.insert("byteorder".to_owned(), Json::String("<".to_owned()));
        }
    } else {
        obj.insert("values".to_owned(), nested_values(array.data().view(), dtype)?);
        // An empty list cannot carry the trailing dimensions.
        if array.shape().contains(&0) {
            obj.insert("shape".to_owned(), shape);
        }
    }
    Ok(Json::Object(obj))
}

/// Nested-list form of an array, like `ndarray.tolist()`.
fn nested_values(view: ArrayViewD<'_, f64>, dtype: DType) -> Result<Json, EnvelopeError> {
    if view.ndim() == 0 {
        let v = view.iter().next().copied().unwrap_or_default();
        return match dtype {
            DType::Bool => Ok(Json::Bool(v != 0.0)),
            d if d.is_float() => finite_number(v),
            _ => Ok(Json::from(v as i64)),
        };
    }
    let items = view
        .outer_iter()
        .map(|row| nested_values(row, dtype))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json::Array(items))
}

// --- decoding ---

fn from_json(json: Json) -> Result<Value, EnvelopeError> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map_or(Value::Null, Value::Float),
        },
        Json::String(s) => Value::Str(s),
        Json::Array(items) => Value::Seq(items.into_iter().map(from_json).collect::<Result<_, _>>()?),
        Json::Object(obj) => from_json_object(obj)?,
    })
}

fn from_json_object(mut obj: Map<String, Json>) -> Result<Value, EnvelopeError> {
    // Extra fields beside a recognized tag are ignored.
    if let Some(payload) = obj.get(TAG_B64) {
        return decode_b64(payload).map(Value::Bytes);
    }
    if let Some(items) = obj.remove(TAG_TUPLE).or_else(|| obj.remove(TAG_SET)) {
        return match items {
            Json::Array(items) => Ok(Value::Seq(
                items.into_iter().map(from_json).collect::<Result<_, _>>()?,
            )),
            other => Err(EnvelopeError::MalformedEnvelope(format!(
                "tuple/set payload must be a list, got {other}"
            ))),
        };
    }
    if let Some(class) = obj.remove(TAG_OBJECT) {
        let Json::String(class) = class else {
            return Err(EnvelopeError::MalformedEnvelope(format!(
                "{TAG_OBJECT} must name a class, got {class}"
            )));
        };
        return from_tagged_object(class, obj);
    }
    if let Some(tag) = obj.keys().find(|k| k.starts_with(TAG_PREFIX)).cloned() {
        tracing::debug!(%tag, "leaving unrecognized envelope tag unresolved");
        return Ok(Value::Unresolved {
            tag,
            raw: Json::Object(obj),
        });
    }
    decode_fields(obj).map(Value::Map)
}

fn decode_fields(obj: Map<String, Json>) -> Result<Mapping, EnvelopeError> {
    obj.into_iter()
        .map(|(k, v)| Ok((k, from_json(v)?)))
        .collect()
}

fn from_tagged_object(class: String, mut obj: Map<String, Json>) -> Result<Value, EnvelopeError> {
    if class == NDARRAY_CLASS {
        return decode_ndarray(class, obj);
    }

    if class.starts_with(NUMPY_PREFIX) {
        if let Some(value) = obj.remove("value") {
            // numpy scalar: {"py/object": "numpy.float32", "dtype": ..., "value": n}
            return from_json(value);
        }
        return Ok(unresolved(class.clone(), class, obj));
    }

    if let Some(state) = obj.remove(TAG_STATE) {
        return match state {
            Json::Object(state) if !state.keys().any(|k| k.starts_with(TAG_PREFIX)) => {
                Ok(Value::Object {
                    class,
                    fields: decode_fields(state)?,
                })
            }
            state => {
                obj.insert(TAG_STATE.to_owned(), state);
                Ok(unresolved(TAG_STATE.to_owned(), class, obj))
            }
        };
    }

    // py/newargs, py/initargs, py/seq and friends need constructor semantics.
    if let Some(tag) = obj.keys().find(|k| k.starts_with(TAG_PREFIX)).cloned() {
        return Ok(unresolved(tag, class, obj));
    }

    Ok(Value::Object {
        class,
        fields: decode_fields(obj)?,
    })
}

/// Rebuild the raw object (class tag included) for a lazily failing value.
fn unresolved(tag: String, class: String, mut obj: Map<String, Json>) -> Value {
    tracing::debug!(%tag, %class, "leaving py/object unresolved");
    obj.insert(TAG_OBJECT.to_owned(), Json::String(class));
    Value::Unresolved {
        tag,
        raw: Json::Object(obj),
    }
}

fn decode_ndarray(class: String, obj: Map<String, Json>) -> Result<Value, EnvelopeError> {
    let dtype_spec = obj
        .get("dtype")
        .and_then(Json::as_str)
        .ok_or_else(|| EnvelopeError::MalformedEnvelope(format!("{NDARRAY_CLASS} without dtype")))?
        .to_owned();

    let Some(dtype) = DType::parse(&dtype_spec) else {
        return Ok(unresolved(format!("{NDARRAY_CLASS}[{dtype_spec}]"), class, obj));
    };

    let values = obj
        .get("values")
        .ok_or_else(|| EnvelopeError::MalformedEnvelope(format!("{NDARRAY_CLASS} without values")))?;

    match values {
        Json::Object(inner) if inner.contains_key(TAG_B64) => {
            let bytes = decode_b64(&inner[TAG_B64])?;
            let shape = match obj.get("shape") {
                Some(shape) => parse_shape(shape)?,
                None => vec![bytes.len() / dtype.item_size()],
            };
            let little_endian = match obj.get("byteorder").and_then(Json::as_str) {
                Some(order) => order != ">",
                None => !dtype_spec.starts_with('>'),
            };
            let fortran = obj.get("order").and_then(Json::as_str) == Some("F");
            let array = NumericArray::from_bytes(dtype, &shape, &bytes, little_endian, fortran)?;
            Ok(Value::Array(array))
        }
        // Compressed or otherwise re-encoded buffers.
        Json::Object(inner) => {
            let tag = inner
                .keys()
                .find(|k| k.starts_with(TAG_PREFIX))
                .cloned()
                .unwrap_or_else(|| format!("{NDARRAY_CLASS}.values"));
            Ok(unresolved(tag, class, obj))
        }
        nested => {
            let (nested_shape, flat) = flatten_nested(nested)?;
            let shape = match obj.get("shape") {
                Some(shape) => parse_shape(shape)?,
                None => nested_shape,
            };
            Ok(Value::Array(NumericArray::from_vec(dtype, &shape, flat)?))
        }
    }
}

fn decode_b64(payload: &Json) -> Result<Vec<u8>, EnvelopeError> {
    let text = payload.as_str().ok_or_else(|| {
        EnvelopeError::MalformedEnvelope(format!("{TAG_B64} payload must be a string"))
    })?;
    STANDARD
        .decode(text)
        .map_err(|e| EnvelopeError::MalformedEnvelope(format!("{TAG_B64}: {e}")))
}

fn parse_shape(shape: &Json) -> Result<Vec<usize>, EnvelopeError> {
    let dims = match shape {
        Json::Array(dims) => dims,
        Json::Object(obj) => match obj.get(TAG_TUPLE) {
            Some(Json::Array(dims)) => dims,
            _ => return Err(EnvelopeError::MalformedEnvelope(format!("bad ndarray shape {shape}"))),
        },
        _ => return Err(EnvelopeError::MalformedEnvelope(format!("bad ndarray shape {shape}"))),
    };
    dims.iter()
        .map(|d| {
            d.as_u64()
                .map(|d| d as usize)
                .ok_or_else(|| EnvelopeError::MalformedEnvelope(format!("bad ndarray dimension {d}")))
        })
        .collect()
}

/// Shape and row-major elements of a rectangular nested list.
fn flatten_nested(values: &Json) -> Result<(Vec<usize>, Vec<f64>), EnvelopeError> {
    let mut shape = Vec::new();
    let mut probe = values;
    while let Json::Array(items) = probe {
        shape.push(items.len());
        match items.first() {
            Some(first) => probe = first,
            None => break,
        }
    }

    let mut flat = Vec::with_capacity(shape.iter().product());
    collect_leaves(values, &shape, 0, &mut flat)?;
    Ok((shape, flat))
}

fn collect_leaves(
    value: &Json,
    shape: &[usize],
    depth: usize,
    out: &mut Vec<f64>,
) -> Result<(), EnvelopeError> {
    match value {
        Json::Array(items) if depth < shape.len() && items.len() == shape[depth] => {
            for item in items {
                collect_leaves(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        Json::Number(n) if depth == shape.len() => {
            out.push(n.as_f64().unwrap_or(f64::NAN));
            Ok(())
        }
        Json::Bool(b) if depth == shape.len() => {
            out.push(f64::from(u8::from(*b)));
            Ok(())
        }
        _ => Err(EnvelopeError::MalformedEnvelope(format!(
            "{NDARRAY_CLASS} values are not a rectangular numeric list"
        ))),
    }
}
