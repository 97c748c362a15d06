//! Element types understood by the array library.
//!
//! The name table is the one the managed runtime uses for type atoms
//! (`:float32`, `:bfloat16`, ...).

use std::fmt;
use std::str::FromStr;

/// Array element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// Boolean, one byte per element
    Bool,
    /// Unsigned 8-bit integer
    UInt8,
    /// Unsigned 16-bit integer
    UInt16,
    /// Unsigned 32-bit integer
    UInt32,
    /// Unsigned 64-bit integer
    UInt64,
    /// Signed 8-bit integer
    Int8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// IEEE half precision
    Float16,
    /// IEEE single precision
    Float32,
    /// Brain floating point
    BFloat16,
    /// Two single-precision floats (real, imaginary)
    Complex64,
}

impl DType {
    /// Every dtype, in table order.
    pub const ALL: [DType; 13] = [
        DType::Bool,
        DType::UInt8,
        DType::UInt16,
        DType::UInt32,
        DType::UInt64,
        DType::Int8,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::Float16,
        DType::Float32,
        DType::BFloat16,
        DType::Complex64,
    ];

    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            DType::Bool | DType::UInt8 | DType::Int8 => 1,
            DType::UInt16 | DType::Int16 | DType::Float16 | DType::BFloat16 => 2,
            DType::UInt32 | DType::Int32 | DType::Float32 => 4,
            DType::UInt64 | DType::Int64 | DType::Complex64 => 8,
        }
    }

    /// The runtime's name for this dtype.
    pub const fn name(&self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float16 => "float16",
            DType::Float32 => "float32",
            DType::BFloat16 => "bfloat16",
            DType::Complex64 => "complex64",
        }
    }

    /// Look a dtype up by name.
    pub fn from_name(name: &str) -> Option<DType> {
        DType::ALL.iter().copied().find(|dtype| dtype.name() == name)
    }

    /// Whether elements are floating point (complex excluded).
    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float16 | DType::Float32 | DType::BFloat16)
    }

    /// Whether elements are signed or unsigned integers.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DType::UInt8
                | DType::UInt16
                | DType::UInt32
                | DType::UInt64
                | DType::Int8
                | DType::Int16
                | DType::Int32
                | DType::Int64
        )
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DType::from_name(s).ok_or_else(|| format!("Unknown dtype: {}", s))
    }
}
