//! End-to-end tests: build, lower, load and call modules through the engine.

mod common;

use std::ffi::c_void;
use std::ptr;

use arrayjit::ir::ops::{BinOp, CastKind, IntPredicate};
use arrayjit::ir::types::Dim;
use arrayjit::runtime::{self, ArrayStruct};
use arrayjit::{Builder, EngineError, LoweringOptions, Module, Type};
use common::{engine, lower, public_func, vector};

type Slot = *mut c_void;

fn identity_module() -> Module {
    let ty = Type::memref(Type::f64(), vec![Dim::Dynamic, Dim::Dynamic]);
    let mut m = Module::new("identity_abi");
    let (_, entry) = public_func(&mut m, "identity", vec![ty.clone()], vec![ty]);
    let arg = m.block_arg(entry, 0);
    Builder::at_end(&mut m, entry).return_(vec![arg]);
    m
}

#[test]
fn test_abi_round_trip() {
    let mut m = identity_module();
    lower(&mut m, &LoweringOptions::default());
    let mut engine = engine();
    let handle = engine.load_module(&m).unwrap();
    let entry = engine.lookup(handle, "identity").unwrap();
    type Identity = extern "C" fn(Slot, Slot, Slot, Slot, i64, i64, Slot, i64, i64, i64, i64) -> i32;
    let identity: Identity = unsafe { std::mem::transmute(entry) };

    let values: Vec<f64> = (0..6).map(f64::from).collect();
    let input = ArrayStruct::<2>::from_slice([2, 3], &values).unwrap();
    let mut out = std::mem::MaybeUninit::<ArrayStruct<2>>::zeroed();
    let status = identity(
        out.as_mut_ptr() as Slot,
        ptr::null_mut(),
        input.meminfo as Slot,
        input.parent,
        input.nitems,
        input.itemsize,
        input.data,
        input.shape[0],
        input.shape[1],
        input.strides[0],
        input.strides[1],
    );
    assert_eq!(status, 0);
    let out = unsafe { out.assume_init() };
    assert_eq!(out.meminfo, input.meminfo);
    assert_eq!(out.data, input.data);
    assert_eq!(out.shape, input.shape);
    assert_eq!(out.strides, input.strides);
    assert_eq!(out.nitems, 6);
    assert_eq!(out.itemsize, 8);
    assert_eq!(unsafe { out.to_vec::<f64>() }, values);
    unsafe { input.release() };
}

/// `churn(flag)` allocates an array, retains it and releases both handles in
/// whichever order `flag` selects.
fn churn_branches_module(name: &str) -> Module {
    let mut m = Module::new(name);
    let (_, entry) = public_func(&mut m, "churn", vec![Type::Index], vec![]);
    let flag = m.block_arg(entry, 0);
    let mut b = Builder::at_end(&mut m, entry);
    let array = b.alloc(Type::memref(Type::f64(), vec![Dim::Static(16)]), vec![]);
    let retained = b.retain(array);
    let zero = b.const_index(0);
    let cond = b.cmpi(IntPredicate::Ne, flag, zero);
    let branch = b.if_(cond, vec![]);
    b.return_(vec![]);
    for (region, order) in [(0, [array, retained]), (1, [retained, array])] {
        let block = m.body_block(branch, region);
        let mut bb = Builder::at_end(&mut m, block);
        for handle in order {
            bb.dealloc(handle);
        }
        bb.yield_(vec![]);
    }
    m
}

#[test]
fn test_retain_then_two_deallocs_destroys_once() {
    for tokens in [false, true] {
        let mut m = churn_branches_module(if tokens { "refcount_tokens" } else { "refcount" });
        lower(
            &mut m,
            &LoweringOptions {
                use_alloc_tokens: tokens,
                ..Default::default()
            },
        );
        let mut engine = engine();
        let handle = engine.load_module(&m).unwrap();
        let churn: extern "C" fn(Slot, Slot, i64) -> i32 =
            unsafe { std::mem::transmute(engine.lookup(handle, "churn").unwrap()) };

        for flag in [0, 1] {
            runtime::reset_stats();
            assert_eq!(churn(ptr::null_mut(), ptr::null_mut(), flag), 0);
            let stats = runtime::stats();
            assert_eq!(stats.allocations, 1);
            assert_eq!(stats.destructions, 1, "tokens={} flag={}", tokens, flag);
            assert_eq!(stats.over_releases, 0);
            assert_eq!(stats.live_tokens, 0);
        }
    }
}

/// `release(n)` allocates an array, retains it once and releases the
/// retained handle `n` times from a loop.
fn release_loop_module() -> Module {
    let mut m = Module::new("release_loop");
    let (_, entry) = public_func(&mut m, "release", vec![Type::Index], vec![]);
    let n = m.block_arg(entry, 0);
    let mut b = Builder::at_end(&mut m, entry);
    let array = b.alloc(Type::memref(Type::f64(), vec![Dim::Static(16)]), vec![]);
    let retained = b.retain(array);
    let zero = b.const_index(0);
    let one = b.const_index(1);
    let releases = b.for_(zero, n, one, vec![]);
    b.return_(vec![]);
    let body = m.body_block(releases, 0);
    let mut lb = Builder::at_end(&mut m, body);
    lb.dealloc(retained);
    lb.yield_(vec![]);
    m
}

#[test]
fn test_destruction_happens_on_last_release_only() {
    let mut m = release_loop_module();
    lower(&mut m, &LoweringOptions::default());
    let mut engine = engine();
    let handle = engine.load_module(&m).unwrap();
    let release: extern "C" fn(Slot, Slot, i64) -> i32 =
        unsafe { std::mem::transmute(engine.lookup(handle, "release").unwrap()) };

    // (releases, destructions, over-releases); the retain lifts the count to two
    for (n, destroyed, over) in [(1, 0, 0), (2, 1, 0), (3, 1, 1)] {
        runtime::reset_stats();
        assert_eq!(release(ptr::null_mut(), ptr::null_mut(), n), 0);
        let stats = runtime::stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.destructions, destroyed, "{} releases", n);
        assert_eq!(stats.over_releases, over, "{} releases", n);
    }
}

/// `fill(out, n)` writing `i * i + 1` into `out[i]`, sequentially or through
/// a parallel loop.
fn fill_module(name: &str, parallel: bool) -> Module {
    let mut m = Module::new(name);
    let (_, entry) = public_func(&mut m, "fill", vec![vector(Type::i64()), Type::Index], vec![]);
    let out = m.block_arg(entry, 0);
    let n = m.block_arg(entry, 1);
    let mut b = Builder::at_end(&mut m, entry);
    let zero = b.const_index(0);
    let one = b.const_index(1);
    let loop_op = if parallel {
        b.parallel(vec![zero], vec![n], vec![one])
    } else {
        b.for_(zero, n, one, vec![])
    };
    b.return_(vec![]);
    let body = m.body_block(loop_op, 0);

    let iv = m.block_arg(body, 0);
    let mut lb = Builder::at_end(&mut m, body);
    let i = lb.cast(CastKind::IndexCast, iv, Type::i64());
    let square = lb.binary(BinOp::MulI, i, i);
    let c1 = lb.const_int(1, Type::i64());
    let value = lb.binary(BinOp::AddI, square, c1);
    lb.store(value, out, vec![iv]);
    lb.yield_(vec![]);
    m
}

fn run_fill(m: &mut Module, n: i64, tokens: bool) -> Vec<i64> {
    lower(
        m,
        &LoweringOptions {
            use_alloc_tokens: tokens,
            ..Default::default()
        },
    );
    let mut engine = engine();
    let handle = engine.load_module(m).unwrap();
    type Fill = extern "C" fn(Slot, Slot, Slot, Slot, i64, i64, Slot, i64, i64, i64) -> i32;
    let fill: Fill = unsafe { std::mem::transmute(engine.lookup(handle, "fill").unwrap()) };

    let array = ArrayStruct::<1>::from_slice([n], &vec![0i64; n as usize]).unwrap();
    let status = fill(
        ptr::null_mut(),
        ptr::null_mut(),
        array.meminfo as Slot,
        array.parent,
        array.nitems,
        array.itemsize,
        array.data,
        array.shape[0],
        array.strides[0],
        n,
    );
    assert_eq!(status, 0);
    assert_eq!(runtime::stats().live_tokens, 0);
    let values = unsafe { array.to_vec::<i64>() };
    unsafe { array.release() };
    values
}

#[test]
fn test_parallel_outlining_matches_sequential_loop() {
    let n = 37;
    runtime::reset_stats();
    let sequential = run_fill(&mut fill_module("fill_seq", false), n, false);

    let mut parallel_module = fill_module("fill_par", true);
    let parallel = run_fill(&mut parallel_module, n, false);
    assert_eq!(runtime::stats().parallel_calls, 1);

    let expected: Vec<i64> = (0..n).map(|i| i * i + 1).collect();
    assert_eq!(sequential, expected);
    assert_eq!(parallel, sequential);
    assert_eq!(parallel.iter().sum::<i64>(), expected.iter().sum::<i64>());
}

#[test]
fn test_argument_tokens_balance_across_calls() {
    runtime::reset_stats();
    let values = run_fill(&mut fill_module("fill_tokens", false), 5, true);
    assert_eq!(values, vec![1, 2, 5, 10, 17]);

    let ty = vector(Type::f64());
    let mut m = Module::new("twice_tokens");
    let (_, entry) = public_func(&mut m, "twice", vec![ty.clone()], vec![ty.clone(), ty]);
    let arg = m.block_arg(entry, 0);
    Builder::at_end(&mut m, entry).return_(vec![arg, arg]);
    lower(
        &mut m,
        &LoweringOptions {
            use_alloc_tokens: true,
            ..Default::default()
        },
    );
    let mut engine = engine();
    let handle = engine.load_module(&m).unwrap();
    type Twice = extern "C" fn(Slot, Slot, Slot, Slot, i64, i64, Slot, i64, i64) -> i32;
    let twice: Twice = unsafe { std::mem::transmute(engine.lookup(handle, "twice").unwrap()) };

    let input = ArrayStruct::<1>::from_slice([3], &[1.0f64, 2.0, 3.0]).unwrap();
    let mut out = std::mem::MaybeUninit::<[ArrayStruct<1>; 2]>::zeroed();
    for _ in 0..2 {
        let status = twice(
            out.as_mut_ptr() as Slot,
            ptr::null_mut(),
            input.meminfo as Slot,
            input.parent,
            input.nitems,
            input.itemsize,
            input.data,
            input.shape[0],
            input.strides[0],
        );
        assert_eq!(status, 0);
        assert_eq!(runtime::stats().live_tokens, 0);
    }
    let out = unsafe { out.assume_init() };
    for array in &out {
        assert_eq!(array.meminfo, input.meminfo);
        assert_eq!(array.data, input.data);
        assert_eq!(array.shape, [3]);
    }
    assert_eq!(input.refcount(), 1);
    unsafe { input.release() };
    assert_eq!(runtime::stats().live_allocations(), 0);
}

#[test]
fn test_slice_components_normalize_against_extent() {
    let mut m = Module::new("slices");
    let (_, entry) = public_func(
        &mut m,
        "slice",
        vec![vector(Type::f64()), Type::Index, Type::Index, Type::Index],
        vec![Type::Index; 4],
    );
    let array = m.block_arg(entry, 0);
    let bounds: Vec<_> = (1..4).map(|i| m.block_arg(entry, i)).collect();
    let mut b = Builder::at_end(&mut m, entry);
    let zero = b.const_index(0);
    let extent = b.dim(array, zero);
    let shaped = b.enforce_shape(array, vec![extent]);
    let slice = b.build_tuple(bounds);
    let mut parts = Vec::new();
    for component in 0..4 {
        let index = b.const_index(component);
        parts.push(b.slice_getitem(slice, shaped, index, 0));
    }
    b.return_(parts);

    lower(&mut m, &LoweringOptions::default());
    let mut engine = engine();
    let handle = engine.load_module(&m).unwrap();
    type Slice = extern "C" fn(Slot, Slot, Slot, Slot, i64, i64, Slot, i64, i64, i64, i64, i64) -> i32;
    let slice: Slice = unsafe { std::mem::transmute(engine.lookup(handle, "slice").unwrap()) };

    let input = ArrayStruct::<1>::from_slice([10], &[0.0f64; 10]).unwrap();
    // (begin, end, step) -> [begin, end, step, count]
    for ((begin, end, step), expected) in [
        ((-3, 100, 2), [7, 10, 2, 2]),
        ((2, 5, 1), [2, 5, 1, 3]),
        ((6, 2, 1), [6, 2, 1, 0]),
    ] {
        let mut out = [0i64; 4];
        let status = slice(
            out.as_mut_ptr() as Slot,
            ptr::null_mut(),
            input.meminfo as Slot,
            input.parent,
            input.nitems,
            input.itemsize,
            input.data,
            input.shape[0],
            input.strides[0],
            begin,
            end,
            step,
        );
        assert_eq!(status, 0);
        assert_eq!(out, expected, "slice({}, {}, {})", begin, end, step);
    }
    unsafe { input.release() };
}

#[test]
fn test_cache_hit_compiles_once() {
    let mut m = identity_module();
    lower(&mut m, &LoweringOptions::default());
    let mut engine = engine();
    let first = engine.load_module(&m).unwrap();
    let second = engine.load_module(&m).unwrap();
    assert_ne!(first, second);
    assert_eq!(engine.objects_compiled(), 1);
    assert_eq!(engine.cache().map(|c| c.len()), Some(1));
    assert!(engine.lookup(first, "identity").is_ok());
    assert!(engine.lookup(second, "identity").is_ok());

    let dir = std::env::temp_dir().join(format!("arrayjit-dump-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("identity.o");
    engine.dump_to_object_file(&path).unwrap();
    assert!(!std::fs::read(&path).unwrap().is_empty());
    std::fs::remove_dir_all(&dir).unwrap();

    engine.release_module(first).unwrap();
    assert!(matches!(
        engine.lookup(first, "identity"),
        Err(EngineError::UnknownHandle(_))
    ));
    assert!(engine.lookup(second, "identity").is_ok());
}
