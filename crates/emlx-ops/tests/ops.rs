//! End-to-end tests: operations on worker threads, handle lifetimes across
//! callbacks, and failures reported as values.

use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use emlx_arena::ArenaConfig;
use emlx_callback::{FunctionTable, GatewayConfig};
use emlx_ops::{EmlxConfig, EmlxContext, ErrorKind, Term};
use pretty_assertions::assert_eq;

fn runtime() -> FunctionTable<Term> {
    let mut table = FunctionTable::new();
    table.register("double", |args: &[Term]| match args {
        [Term::Float(x)] => Ok(Term::Float(x * 2.0)),
        _ => Err("double/1 expects a float".to_string()),
    });
    table.register("reject", |_: &[Term]| -> Result<Term, String> {
        Err("rejected by the runtime".to_string())
    });
    table
}

fn shape(dims: &[i64]) -> Term {
    Term::List(dims.iter().map(|&d| Term::Int(d)).collect())
}

fn f32_blob(values: &[f32]) -> Term {
    Term::Binary(values.iter().flat_map(|v| v.to_le_bytes()).collect())
}

#[test]
fn test_concurrent_operations_share_arrays() {
    let ctx = EmlxContext::init(EmlxConfig::new().with_workers(4), runtime()).unwrap();
    let ones = ctx.invoke("ones", &[shape(&[4, 4])]).unwrap();

    let pending: Vec<_> = (0..64)
        .map(|i| {
            let op = if i % 2 == 0 { "sum" } else { "to_type" };
            let args = if i % 2 == 0 {
                vec![ones.clone(), shape(&[0, 1]), Term::Bool(false)]
            } else {
                vec![ones.clone(), Term::atom("int8")]
            };
            ctx.submit(op, args).unwrap()
        })
        .collect();

    for (i, op) in pending.into_iter().enumerate() {
        let result = op.wait().unwrap();
        if i % 2 == 0 {
            assert_eq!(ctx.invoke("to_blob", &[result.clone()]).unwrap(), f32_blob(&[16.0]));
        }
        assert_eq!(ctx.invoke("deallocate", &[result]).unwrap(), Term::atom("ok"));
    }

    assert_eq!(ctx.invoke("deallocate", &[ones]).unwrap(), Term::atom("ok"));
    let report = ctx.shutdown().unwrap();
    assert_eq!(report.arena.live, 0);
    assert_eq!(report.arena.allocated, 65);
    assert_eq!(report.arena.destroyed, 65);
}

#[test]
fn test_deallocate_and_use_after() {
    let ctx = EmlxContext::init(EmlxConfig::new().with_workers(1), runtime()).unwrap();
    let x = ctx.invoke("zeros", &[shape(&[3])]).unwrap();

    assert_eq!(ctx.invoke("deallocate", &[x.clone()]).unwrap(), Term::atom("ok"));
    assert_eq!(
        ctx.invoke("deallocate", &[x.clone()]).unwrap(),
        Term::atom("already_deallocated")
    );

    let err = ctx.invoke("sum", &[x, shape(&[0]), Term::Int(0)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyRetired);
    assert_eq!(err.op, "sum/3");
    assert_eq!(err.message, "array has been deallocated");
    ctx.shutdown().unwrap();
}

#[test]
fn test_callback_round_trip() {
    let ctx = EmlxContext::init(EmlxConfig::new().with_workers(2), runtime()).unwrap();
    let x = ctx
        .invoke("scalar_tensor", &[Term::Float(4.0), Term::atom("bfloat16")])
        .unwrap();

    let y = ctx
        .submit("eval_scalar", vec![x, Term::atom("double")])
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(ctx.invoke("scalar_type", &[y.clone()]).unwrap(), Term::atom("bfloat16"));

    let y32 = ctx.invoke("to_type", &[y, Term::atom("float32")]).unwrap();
    assert_eq!(ctx.invoke("to_blob", &[y32]).unwrap(), f32_blob(&[8.0]));

    let report = ctx.shutdown().unwrap();
    assert_eq!(report.dispatcher.completed, 1);
}

#[test]
fn test_array_survives_deallocate_during_callback() {
    let (entered_tx, entered_rx) = bounded::<()>(1);
    let (release_tx, release_rx) = bounded::<()>(1);

    let mut table = runtime();
    table.register("gate", move |args: &[Term]| {
        entered_tx.send(()).map_err(|e| e.to_string())?;
        release_rx.recv().map_err(|e| e.to_string())?;
        Ok(args[0].clone())
    });

    let ctx = EmlxContext::init(EmlxConfig::new().with_workers(1), table).unwrap();
    let x = ctx
        .invoke("scalar_tensor", &[Term::Float(2.0), Term::atom("float32")])
        .unwrap();
    let handle = x.as_array().unwrap().clone();

    let pending = ctx
        .submit("eval_scalar", vec![x.clone(), Term::atom("gate")])
        .unwrap();
    entered_rx.recv().unwrap();

    // the worker still borrows x while the runtime evaluates
    assert_eq!(ctx.invoke("deallocate", &[x.clone()]).unwrap(), Term::atom("ok"));
    assert!(handle.is_retired());
    assert!(!handle.is_destroyed());
    assert_eq!(handle.refcount(), 1);

    release_tx.send(()).unwrap();
    let y = pending.wait().unwrap();
    assert!(handle.is_destroyed());
    assert_eq!(ctx.invoke("to_blob", &[y]).unwrap(), f32_blob(&[2.0]));

    let err = ctx.invoke("shape", &[x]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::AlreadyRetired);
    ctx.shutdown().unwrap();
}

#[test]
fn test_runtime_failure_is_reported() {
    let ctx = EmlxContext::init(EmlxConfig::new().with_workers(1), runtime()).unwrap();
    let x = ctx
        .invoke("scalar_tensor", &[Term::Float(1.0), Term::atom("float32")])
        .unwrap();

    let err = ctx
        .submit("eval_scalar", vec![x.clone(), Term::atom("reject")])
        .unwrap()
        .wait()
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::CallbackFailed);
    assert!(err.message.contains("rejected by the runtime"));

    let err = ctx
        .invoke("eval_scalar", &[x, Term::atom("missing")])
        .unwrap_err();
    assert!(err.message.contains("undefined function"));

    let report = ctx.shutdown().unwrap();
    assert_eq!(report.dispatcher.failed, 2);
}

#[test]
fn test_stalled_runtime_times_out() {
    let mut table = runtime();
    table.register("stall", |args: &[Term]| {
        thread::sleep(Duration::from_millis(200));
        Ok(args[0].clone())
    });

    let config = EmlxConfig::new()
        .with_workers(1)
        .with_gateway(GatewayConfig::new().with_default_timeout(Duration::from_millis(20)));
    let ctx = EmlxContext::init(config, table).unwrap();
    let x = ctx
        .invoke("scalar_tensor", &[Term::Float(1.0), Term::atom("float32")])
        .unwrap();

    let err = ctx.invoke("eval_scalar", &[x, Term::atom("stall")]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);

    let report = ctx.shutdown().unwrap();
    assert_eq!(report.dispatcher.rejected, 1);
}

#[test]
fn test_out_of_memory_is_recoverable() {
    let config = EmlxConfig::new()
        .with_workers(1)
        .with_arena(ArenaConfig::new().with_max_live_handles(2));
    let ctx = EmlxContext::init(config, runtime()).unwrap();

    let a = ctx.invoke("zeros", &[shape(&[2])]).unwrap();
    let _b = ctx.invoke("ones", &[shape(&[2])]).unwrap();

    let err = ctx.invoke("zeros", &[shape(&[2])]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::OutOfMemory);
    assert_eq!(err.op, "zeros/1");

    ctx.invoke("deallocate", &[a]).unwrap();
    assert!(ctx.invoke("zeros", &[shape(&[2])]).is_ok());
    ctx.shutdown().unwrap();
}

#[test]
fn test_huge_array_is_out_of_memory() {
    let ctx = EmlxContext::init(EmlxConfig::new().with_workers(1), runtime()).unwrap();

    let err = ctx.invoke("zeros", &[shape(&[1 << 44])]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::OutOfMemory);
    assert_eq!(err.op, "zeros/1");

    // the failed allocation registered no handle
    assert_eq!(ctx.arena().stats().live, 0);
    assert!(ctx.invoke("zeros", &[shape(&[2])]).is_ok());
    ctx.shutdown().unwrap();
}

#[test]
fn test_bad_arguments() {
    let ctx = EmlxContext::init(EmlxConfig::new().with_workers(1), runtime()).unwrap();

    let err = ctx
        .invoke(
            "from_blob",
            &[f32_blob(&[1.0, 2.0, 3.0]), shape(&[2, 2]), Term::atom("float32")],
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::BadArgument);
    assert_eq!(err.message, "Binary size is too small for the requested shape");

    let err = ctx.invoke("shape", &[Term::Int(1)]).unwrap_err();
    assert_eq!(err.message, "expected array, got integer");

    let err = ctx
        .invoke("scalar_tensor", &[Term::Float(1.0), Term::atom("float64")])
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NativeComputationFailed);
    assert_eq!(err.message, "Unknown dtype: float64");
    ctx.shutdown().unwrap();
}
