//! Typed numeric arrays reconstructed from `numpy.ndarray` envelope objects.
//!
//! Element data is held as `f64` regardless of the wire dtype, which is exact
//! for every supported dtype except 64-bit integers above 2^53. The dtype is
//! kept alongside so the array re-encodes to the same wire type.

use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum NumericError {
    #[error("shape {shape:?} needs {expected} elements, got {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },
    #[error("buffer of {len} bytes is not a whole number of {item_size}-byte elements")]
    BufferLength { len: usize, item_size: usize },
    #[error("shape {0:?} has more elements than fit in memory")]
    ShapeOverflow(Vec<usize>),
}

/// Element count of `shape`, failing instead of wrapping on huge dimensions.
fn element_count(shape: &[usize]) -> Result<usize, NumericError> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| NumericError::ShapeOverflow(shape.to_vec()))
}

/// Element types the codec can reconstruct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl DType {
    /// Parse a numpy dtype string, either a name (`float32`) or an
    /// array-protocol code (`<f4`, `|u1`). Returns `None` for dtypes the
    /// codec does not reconstruct (complex, float16, object, strings).
    pub fn parse(spec: &str) -> Option<Self> {
        let code = spec.trim_start_matches(&['<', '>', '=', '|'][..]);
        let dtype = match code {
            "bool" | "?" | "b1" => DType::Bool,
            "int8" | "i1" => DType::Int8,
            "int16" | "i2" => DType::Int16,
            "int32" | "i4" => DType::Int32,
            "int64" | "i8" => DType::Int64,
            "uint8" | "u1" => DType::UInt8,
            "uint16" | "u2" => DType::UInt16,
            "uint32" | "u4" => DType::UInt32,
            "uint64" | "u8" => DType::UInt64,
            "float32" | "f4" => DType::Float32,
            "float64" | "f8" => DType::Float64,
            _ => return None,
        };
        Some(dtype)
    }

    /// Canonical numpy name, as jsonpickle writes it.
    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn item_size(self) -> usize {
        match self {
            DType::Bool | DType::Int8 | DType::UInt8 => 1,
            DType::Int16 | DType::UInt16 => 2,
            DType::Int32 | DType::UInt32 | DType::Float32 => 4,
            DType::Int64 | DType::UInt64 | DType::Float64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    /// Round a value to what this dtype can hold.
    fn narrow(self, v: f64) -> f64 {
        match self {
            DType::Bool => {
                if v != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            DType::Float32 => v as f32 as f64,
            DType::Float64 => v,
            _ => v.trunc(),
        }
    }

    /// Read one element. `bytes.len()` must equal `item_size()`.
    fn read(self, bytes: &[u8], little: bool) -> f64 {
        macro_rules! read_as {
            ($t:ty) => {{
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                if little {
                    <$t>::from_le_bytes(buf) as f64
                } else {
                    <$t>::from_be_bytes(buf) as f64
                }
            }};
        }
        match self {
            DType::Bool => f64::from(u8::from(bytes[0] != 0)),
            DType::Int8 => read_as!(i8),
            DType::Int16 => read_as!(i16),
            DType::Int32 => read_as!(i32),
            DType::Int64 => read_as!(i64),
            DType::UInt8 => read_as!(u8),
            DType::UInt16 => read_as!(u16),
            DType::UInt32 => read_as!(u32),
            DType::UInt64 => read_as!(u64),
            DType::Float32 => read_as!(f32),
            DType::Float64 => read_as!(f64),
        }
    }

    /// Append one element in little-endian layout.
    fn write_le(self, v: f64, out: &mut Vec<u8>) {
        match self {
            DType::Bool => out.push(u8::from(v != 0.0)),
            DType::Int8 => out.extend_from_slice(&(v as i8).to_le_bytes()),
            DType::Int16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
            DType::Int32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
            DType::Int64 => out.extend_from_slice(&(v as i64).to_le_bytes()),
            DType::UInt8 => out.extend_from_slice(&(v as u8).to_le_bytes()),
            DType::UInt16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
            DType::UInt32 => out.extend_from_slice(&(v as u32).to_le_bytes()),
            DType::UInt64 => out.extend_from_slice(&(v as u64).to_le_bytes()),
            DType::Float32 => out.extend_from_slice(&(v as f32).to_le_bytes()),
            DType::Float64 => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

/// An n-dimensional numeric array with its wire dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    dtype: DType,
    data: ArrayD<f64>,
}

impl NumericArray {
    /// Build from row-major values. Values are narrowed to the dtype.
    pub fn from_vec(dtype: DType, shape: &[usize], values: Vec<f64>) -> Result<Self, NumericError> {
        let values: Vec<f64> = values.into_iter().map(|v| dtype.narrow(v)).collect();
        let expected = element_count(shape)?;
        if expected != values.len() {
            return Err(NumericError::ShapeMismatch {
                shape: shape.to_vec(),
                expected,
                actual: values.len(),
            });
        }
        let data = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
            NumericError::ShapeMismatch {
                shape: shape.to_vec(),
                expected,
                actual: expected,
            }
        })?;
        Ok(Self { dtype, data })
    }

    /// Build from a raw numpy buffer (`ndarray.tobytes()`).
    ///
    /// `fortran` selects column-major element order in `bytes`.
    pub fn from_bytes(
        dtype: DType,
        shape: &[usize],
        bytes: &[u8],
        little_endian: bool,
        fortran: bool,
    ) -> Result<Self, NumericError> {
        let item_size = dtype.item_size();
        if bytes.len() % item_size != 0 {
            return Err(NumericError::BufferLength {
                len: bytes.len(),
                item_size,
            });
        }

        let values: Vec<f64> = bytes
            .chunks_exact(item_size)
            .map(|chunk| dtype.read(chunk, little_endian))
            .collect();

        let expected = element_count(shape)?;
        if expected != values.len() {
            return Err(NumericError::ShapeMismatch {
                shape: shape.to_vec(),
                expected,
                actual: values.len(),
            });
        }

        let data = if fortran {
            ArrayD::from_shape_vec(IxDyn(shape).f(), values)
        } else {
            ArrayD::from_shape_vec(IxDyn(shape), values)
        }
        .map_err(|_| NumericError::ShapeMismatch {
            shape: shape.to_vec(),
            expected,
            actual: expected,
        })?;

        Ok(Self { dtype, data })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &ArrayD<f64> {
        &self.data
    }

    /// Elements in logical row-major order, independent of storage order.
    pub fn to_flat_vec(&self) -> Vec<f64> {
        self.data.iter().copied().collect()
    }

    /// Little-endian, C-order buffer: the layout jsonpickle's binary ndarray
    /// handler produces.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.dtype.item_size());
        for &v in self.data.iter() {
            self.dtype.write_le(v, &mut out);
        }
        out
    }

    /// Sub-arrays along the first axis. `None` for a 0-d array.
    pub fn rows(&self) -> Option<Vec<NumericArray>> {
        if self.data.ndim() == 0 {
            return None;
        }
        Some(
            self.data
                .outer_iter()
                .map(|row| NumericArray {
                    dtype: self.dtype,
                    data: row.to_owned(),
                })
                .collect(),
        )
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}
