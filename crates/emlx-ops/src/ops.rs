//! The operation table.
//!
//! Every native operation is one entry in [`OPERATIONS`]: a name, the
//! arities it accepts and a plain function over [`Term`] arguments.
//! [`OperationTable`] indexes that list once at startup; adding an
//! operation means adding an entry, nothing else.
//!
//! Operations that take an array borrow it for the duration of the body,
//! so a concurrent `deallocate` never frees an array mid-computation.
//! Operations that produce an array allocate a fresh handle with a
//! reference count of one.

use std::fmt;

use emlx_arena::ResourceArena;
use emlx_callback::CallbackGateway;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use tracing::trace;

use crate::array::HostArray;
use crate::dtype::DType;
use crate::error::{NativeError, NativeResult};
use crate::term::{ArrayHandle, Term};

/// Signature shared by every operation body.
pub type OperationFn = fn(&OpEnv, &[Term]) -> NativeResult<Term>;

/// What an operation body can reach.
#[derive(Clone)]
pub struct OpEnv {
    arena: ResourceArena<HostArray>,
    gateway: CallbackGateway<Term>,
    runtime_target: SmolStr,
}

impl OpEnv {
    /// Bundle the arena, the gateway and the dispatcher target callbacks
    /// are sent to.
    pub fn new(
        arena: ResourceArena<HostArray>,
        gateway: CallbackGateway<Term>,
        runtime_target: impl Into<SmolStr>,
    ) -> Self {
        Self {
            arena,
            gateway,
            runtime_target: runtime_target.into(),
        }
    }

    /// The array arena.
    pub fn arena(&self) -> &ResourceArena<HostArray> {
        &self.arena
    }

    /// The callback gateway.
    pub fn gateway(&self) -> &CallbackGateway<Term> {
        &self.gateway
    }

    /// Target that evaluates callbacks into the runtime.
    pub fn runtime_target(&self) -> &str {
        &self.runtime_target
    }

    fn wrap(&self, array: HostArray) -> NativeResult<Term> {
        let handle = self.arena.allocate(array)?;
        Ok(Term::Array(handle))
    }
}

impl fmt::Debug for OpEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpEnv")
            .field("arena", &self.arena)
            .field("runtime_target", &self.runtime_target)
            .finish()
    }
}

/// One registered operation.
#[derive(Clone, Copy)]
pub struct Operation {
    /// Name the runtime invokes it by
    pub name: &'static str,
    /// Fewest arguments accepted
    pub min_arity: usize,
    /// Most arguments accepted
    pub max_arity: usize,
    /// The body
    pub run: OperationFn,
}

impl Operation {
    const fn new(name: &'static str, arity: usize, run: OperationFn) -> Self {
        Self {
            name,
            min_arity: arity,
            max_arity: arity,
            run,
        }
    }

    const fn variadic(
        name: &'static str,
        min_arity: usize,
        max_arity: usize,
        run: OperationFn,
    ) -> Self {
        Self {
            name,
            min_arity,
            max_arity,
            run,
        }
    }

    /// Whether `argc` arguments are accepted.
    pub fn accepts(&self, argc: usize) -> bool {
        (self.min_arity..=self.max_arity).contains(&argc)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("min_arity", &self.min_arity)
            .field("max_arity", &self.max_arity)
            .finish()
    }
}

/// Every operation the binding exposes.
pub static OPERATIONS: &[Operation] = &[
    Operation::new("zeros", 1, zeros),
    Operation::new("ones", 1, ones),
    Operation::new("scalar_tensor", 2, scalar_tensor),
    Operation::new("from_blob", 3, from_blob),
    Operation::variadic("to_blob", 1, 2, to_blob),
    Operation::new("shape", 1, shape),
    Operation::new("scalar_type", 1, scalar_type),
    Operation::new("to_type", 2, to_type),
    Operation::new("sum", 3, sum),
    Operation::new("deallocate", 1, deallocate),
    Operation::new("eval_scalar", 2, eval_scalar),
];

/// Name-indexed view of [`OPERATIONS`].
#[derive(Debug, Clone)]
pub struct OperationTable {
    operations: FxHashMap<&'static str, Operation>,
}

impl OperationTable {
    /// Index the built-in operations.
    pub fn new() -> Self {
        Self::from_operations(OPERATIONS)
    }

    /// Index an arbitrary list; later entries replace earlier ones.
    pub fn from_operations(operations: &[Operation]) -> Self {
        let operations = operations.iter().map(|op| (op.name, *op)).collect();
        Self { operations }
    }

    /// Look an operation up by name.
    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.operations.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Default for OperationTable {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// Argument helpers
// =========================================================================

fn dtype_arg(term: &Term) -> NativeResult<DType> {
    term.as_atom()?
        .parse::<DType>()
        .map_err(NativeError::computation)
}

fn array_arg(term: &Term) -> NativeResult<&ArrayHandle> {
    term.as_array()
}

// =========================================================================
// Operations
// =========================================================================

fn zeros(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let shape = args[0].as_shape()?;
    env.wrap(HostArray::zeros(&shape, DType::Float32)?)
}

fn ones(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let shape = args[0].as_shape()?;
    env.wrap(HostArray::ones(&shape, DType::Float32)?)
}

fn scalar_tensor(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let value = args[0].as_f64()?;
    let dtype = dtype_arg(&args[1])?;
    env.wrap(HostArray::scalar(value, dtype)?)
}

fn from_blob(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let blob = args[0].as_binary()?;
    let shape = args[1].as_shape()?;
    let dtype = dtype_arg(&args[2])?;
    env.wrap(HostArray::from_blob(blob, &shape, dtype)?)
}

fn to_blob(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let handle = array_arg(&args[0])?;
    let limit = match args.get(1) {
        None => None,
        Some(limit) => {
            let limit = limit.as_int()?;
            let limit = usize::try_from(limit)
                .map_err(|_| NativeError::bad_argument(format!("negative limit {}", limit)))?;
            Some(limit)
        }
    };

    let array = env.arena.borrow(handle)?;
    Ok(Term::Binary(array.to_bytes(limit)?))
}

fn shape(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let array = env.arena.borrow(array_arg(&args[0])?)?;
    let dims = array
        .shape()
        .iter()
        .map(|&dim| Term::Int(dim as i64))
        .collect();
    Ok(Term::Tuple(dims))
}

fn scalar_type(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let array = env.arena.borrow(array_arg(&args[0])?)?;
    Ok(Term::atom(array.dtype().name()))
}

fn to_type(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let handle = array_arg(&args[0])?;
    let dtype = dtype_arg(&args[1])?;
    let converted = env.arena.borrow(handle)?.astype(dtype)?;
    env.wrap(converted)
}

fn sum(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let handle = array_arg(&args[0])?;
    let axes = args[1]
        .as_list()?
        .iter()
        .map(Term::as_int)
        .collect::<NativeResult<Vec<_>>>()?;
    let keep_dims = args[2].as_flag()?;

    let total = env.arena.borrow(handle)?.sum(&axes, keep_dims)?;
    env.wrap(total)
}

/// Retire the array. `:ok` when this call retired it, `:already_deallocated`
/// when an earlier call did.
fn deallocate(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let handle = array_arg(&args[0])?;
    if env.arena.retire(handle) {
        trace!(handle = %handle.id(), "deallocated");
        Ok(Term::atom("ok"))
    } else {
        Ok(Term::atom("already_deallocated"))
    }
}

/// Have the runtime evaluate `function` on a one-element array and wrap the
/// (numeric) reply in a new array of the same dtype.
///
/// The array stays borrowed while the runtime evaluates, so a concurrent
/// `deallocate` cannot free it under the callback.
fn eval_scalar(env: &OpEnv, args: &[Term]) -> NativeResult<Term> {
    let handle = array_arg(&args[0])?;
    let function = args[1].as_atom()?;

    let array = env.arena.borrow(handle)?;
    if array.len() != 1 {
        return Err(NativeError::bad_argument(format!(
            "expected a one-element array, got {} elements",
            array.len()
        )));
    }
    let value = array
        .get_f64(0)
        .ok_or_else(|| NativeError::computation("eval_scalar is not supported for complex64"))?;
    let dtype = array.dtype();

    let reply = env
        .gateway
        .call(&env.runtime_target, function, vec![Term::Float(value)])?;
    let result = HostArray::scalar(reply.as_f64()?, dtype)?;
    drop(array);

    env.wrap(result)
}
