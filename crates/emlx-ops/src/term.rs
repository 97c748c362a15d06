//! Values exchanged with the managed runtime.

use std::fmt;

use emlx_arena::ResourceHandle;
use smol_str::SmolStr;

use crate::array::HostArray;
use crate::error::{NativeError, NativeResult};

/// Handle to an array owned by the runtime.
pub type ArrayHandle = ResourceHandle<HostArray>;

/// A runtime value.
///
/// Operation arguments and results are terms, and so are the arguments and
/// replies of callbacks into the runtime.
#[derive(Clone)]
pub enum Term {
    /// The empty value
    Nil,
    /// `true` / `false`
    Bool(bool),
    /// Integer
    Int(i64),
    /// Float
    Float(f64),
    /// Atom, e.g. a dtype name
    Atom(SmolStr),
    /// Byte string
    Binary(Vec<u8>),
    /// List of terms
    List(Vec<Term>),
    /// Tuple of terms
    Tuple(Vec<Term>),
    /// Reference to a native array
    Array(ArrayHandle),
}

impl Term {
    /// Build an atom.
    pub fn atom(name: impl Into<SmolStr>) -> Self {
        Term::Atom(name.into())
    }

    /// Name of the term's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Term::Nil => "nil",
            Term::Bool(_) => "boolean",
            Term::Int(_) => "integer",
            Term::Float(_) => "float",
            Term::Atom(_) => "atom",
            Term::Binary(_) => "binary",
            Term::List(_) => "list",
            Term::Tuple(_) => "tuple",
            Term::Array(_) => "array",
        }
    }

    /// Integer value.
    pub fn as_int(&self) -> NativeResult<i64> {
        match self {
            Term::Int(v) => Ok(*v),
            other => Err(other.mismatch("integer")),
        }
    }

    /// Numeric value; integers are widened.
    pub fn as_f64(&self) -> NativeResult<f64> {
        match self {
            Term::Float(v) => Ok(*v),
            Term::Int(v) => Ok(*v as f64),
            other => Err(other.mismatch("number")),
        }
    }

    /// Truthiness as the runtime passes flags: booleans, or integers where
    /// non-zero is true.
    pub fn as_flag(&self) -> NativeResult<bool> {
        match self {
            Term::Bool(v) => Ok(*v),
            Term::Int(v) => Ok(*v != 0),
            other => Err(other.mismatch("boolean")),
        }
    }

    /// Atom name.
    pub fn as_atom(&self) -> NativeResult<&str> {
        match self {
            Term::Atom(name) => Ok(name.as_str()),
            other => Err(other.mismatch("atom")),
        }
    }

    /// Binary contents.
    pub fn as_binary(&self) -> NativeResult<&[u8]> {
        match self {
            Term::Binary(bytes) => Ok(bytes.as_slice()),
            other => Err(other.mismatch("binary")),
        }
    }

    /// List elements.
    pub fn as_list(&self) -> NativeResult<&[Term]> {
        match self {
            Term::List(items) => Ok(items.as_slice()),
            Term::Nil => Ok(&[][..]),
            other => Err(other.mismatch("list")),
        }
    }

    /// Array handle.
    pub fn as_array(&self) -> NativeResult<&ArrayHandle> {
        match self {
            Term::Array(handle) => Ok(handle),
            other => Err(other.mismatch("array")),
        }
    }

    /// A list of non-negative integers, as shapes are passed.
    pub fn as_shape(&self) -> NativeResult<Vec<usize>> {
        self.as_list()?
            .iter()
            .map(|dim| {
                let dim = dim.as_int()?;
                usize::try_from(dim)
                    .map_err(|_| NativeError::bad_argument(format!("negative dimension {}", dim)))
            })
            .collect()
    }

    fn mismatch(&self, expected: &str) -> NativeError {
        NativeError::bad_argument(format!("expected {}, got {}", expected, self.type_name()))
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Term::Nil, Term::Nil) => true,
            (Term::Bool(a), Term::Bool(b)) => a == b,
            (Term::Int(a), Term::Int(b)) => a == b,
            (Term::Float(a), Term::Float(b)) => a == b,
            (Term::Atom(a), Term::Atom(b)) => a == b,
            (Term::Binary(a), Term::Binary(b)) => a == b,
            (Term::List(a), Term::List(b)) => a == b,
            (Term::Tuple(a), Term::Tuple(b)) => a == b,
            (Term::Array(a), Term::Array(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Nil => write!(f, "nil"),
            Term::Bool(v) => write!(f, "{}", v),
            Term::Int(v) => write!(f, "{}", v),
            Term::Float(v) => write!(f, "{:?}", v),
            Term::Atom(name) => write!(f, ":{}", name),
            Term::Binary(bytes) => write!(f, "<<{} bytes>>", bytes.len()),
            Term::List(items) => f.debug_list().entries(items).finish(),
            Term::Tuple(items) => {
                let mut tuple = f.debug_tuple("");
                for item in items {
                    tuple.field(item);
                }
                tuple.finish()
            }
            Term::Array(handle) => write!(f, "#Array<{}>", handle.id()),
        }
    }
}

impl From<i64> for Term {
    fn from(v: i64) -> Self {
        Term::Int(v)
    }
}

impl From<f64> for Term {
    fn from(v: f64) -> Self {
        Term::Float(v)
    }
}

impl From<bool> for Term {
    fn from(v: bool) -> Self {
        Term::Bool(v)
    }
}

impl From<ArrayHandle> for Term {
    fn from(handle: ArrayHandle) -> Self {
        Term::Array(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shape_from_list() {
        let term = Term::List(vec![Term::Int(2), Term::Int(3)]);
        assert_eq!(term.as_shape().unwrap(), vec![2, 3]);
        assert_eq!(Term::Nil.as_shape().unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn test_negative_dimension() {
        let term = Term::List(vec![Term::Int(-1)]);
        assert_eq!(
            term.as_shape().unwrap_err(),
            NativeError::bad_argument("negative dimension -1")
        );
    }

    #[test]
    fn test_type_mismatch_message() {
        let err = Term::atom("float32").as_int().unwrap_err();
        assert_eq!(err.to_string(), "expected integer, got atom");
    }
}
