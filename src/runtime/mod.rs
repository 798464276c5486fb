// This module is an in-process implementation of the runtime-support ABI that lowered modules
// call: meminfo allocation and destruction, wrapping of foreign pointers, allocation tokens
// and the parallel-for entry point. It exists so that compiled modules can run inside tests
// and tools without the production runtime library; `symbol_map` hands the engine the
// addresses of every entry point.
//
// A meminfo is `{refcnt, dtor, dtor_info, data, size, external_allocator}`. Reference counts
// are adjusted by helpers the compiler emits into each module, so the layout here must stay
// identical to the one the lowering assumes. Meminfos allocated by `NRT_MemInfo_alloc_safe_aligned`
// own their data and carry a dtor that frees it; the alignment travels in `dtor_info`.
//
// Destroyed headers are retired instead of freed. A retired header keeps a count of one, so a
// release past the last reference drops it to zero again and lands back in
// `NRT_MemInfo_call_dtor`, which counts it as an over-release and leaves the data alone.
// Retired headers are freed by `reset_stats` and when the thread exits.
//
// `nmrtParallelFor` runs on the calling thread. It splits the outermost loop dimension into
// a few chunks and hands each chunk to the body with its own worker index, so bodies see the
// same sub-range protocol a threaded scheduler would use. Counters are thread local, which
// keeps tests running in parallel from observing each other.

//! In-process runtime-support library.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::ptr;

use hashbrown::{HashMap, HashSet};
use log::{trace, warn};

use crate::lowering::parallel::PARALLEL_FOR;
use crate::lowering::to_low_level::{
    ALLOC_FN, ALLOC_MEMINFO_FN, CALL_DTOR_FN, CREATE_TOKEN_FN, DESTROY_TOKEN_FN,
};

/// Number of chunks the outermost parallel dimension is split into.
pub const PARALLEL_CHUNKS: i64 = 4;

pub type Dtor = unsafe extern "C" fn(data: *mut c_void, size: usize, info: *mut c_void);
pub type ParallelBody = unsafe extern "C" fn(ranges: *const i64, worker: usize, ctx: *mut c_void);

#[repr(C)]
#[derive(Debug)]
pub struct MemInfo {
    pub refcnt: i64,
    pub dtor: Option<Dtor>,
    pub dtor_info: *mut c_void,
    pub data: *mut c_void,
    pub size: i64,
    pub external_allocator: *mut c_void,
}

thread_local! {
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
    static DESTRUCTIONS: Cell<usize> = const { Cell::new(0) };
    static LIVE_TOKENS: Cell<isize> = const { Cell::new(0) };
    static PARALLEL_CALLS: Cell<usize> = const { Cell::new(0) };
    static OVER_RELEASES: Cell<usize> = const { Cell::new(0) };
    static RETIRED: RefCell<Retired> = RefCell::new(Retired::default());
}

/// Addresses of destroyed meminfo headers still owned by the runtime.
#[derive(Default)]
struct Retired(HashSet<usize>);

impl Retired {
    fn free_all(&mut self) {
        for addr in self.0.drain() {
            // SAFETY: entries are headers leaked by `NRT_MemInfo_call_dtor`.
            drop(unsafe { Box::from_raw(addr as *mut MemInfo) });
        }
    }
}

impl Drop for Retired {
    fn drop(&mut self) {
        self.free_all();
    }
}

/// Counter snapshot of the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuntimeStats {
    pub allocations: usize,
    pub destructions: usize,
    pub live_tokens: isize,
    pub parallel_calls: usize,
    /// Releases of a meminfo that was already destroyed.
    pub over_releases: usize,
}

impl RuntimeStats {
    pub fn live_allocations(&self) -> isize {
        self.allocations as isize - self.destructions as isize
    }
}

pub fn stats() -> RuntimeStats {
    RuntimeStats {
        allocations: ALLOCATIONS.with(Cell::get),
        destructions: DESTRUCTIONS.with(Cell::get),
        live_tokens: LIVE_TOKENS.with(Cell::get),
        parallel_calls: PARALLEL_CALLS.with(Cell::get),
        over_releases: OVER_RELEASES.with(Cell::get),
    }
}

pub fn reset_stats() {
    ALLOCATIONS.with(|c| c.set(0));
    DESTRUCTIONS.with(|c| c.set(0));
    LIVE_TOKENS.with(|c| c.set(0));
    PARALLEL_CALLS.with(|c| c.set(0));
    OVER_RELEASES.with(|c| c.set(0));
    RETIRED.with(|r| r.borrow_mut().free_all());
}

fn data_layout(size: usize, align: usize) -> Option<Layout> {
    Layout::from_size_align(size.max(1), align.max(1)).ok()
}

unsafe extern "C" fn free_aligned(data: *mut c_void, size: usize, info: *mut c_void) {
    if let Some(layout) = data_layout(size, info as usize) {
        dealloc(data as *mut u8, layout);
    }
}

fn new_meminfo(data: *mut c_void, size: usize, dtor: Option<Dtor>, dtor_info: *mut c_void) -> *mut MemInfo {
    ALLOCATIONS.with(|c| c.set(c.get() + 1));
    Box::into_raw(Box::new(MemInfo {
        refcnt: 1,
        dtor,
        dtor_info,
        data,
        size: size as i64,
        external_allocator: ptr::null_mut(),
    }))
}

/// # Safety
/// `align` must be a power of two.
#[no_mangle]
pub unsafe extern "C" fn NRT_MemInfo_alloc_safe_aligned(size: usize, align: u32) -> *mut MemInfo {
    let Some(layout) = data_layout(size, align as usize) else {
        return ptr::null_mut();
    };
    let data = alloc_zeroed(layout) as *mut c_void;
    if data.is_null() {
        return ptr::null_mut();
    }
    trace!("allocated {} bytes at {:p}", size, data);
    new_meminfo(data, size, Some(free_aligned), layout.align() as *mut c_void)
}

/// Run the dtor of `meminfo` and retire its header.
///
/// # Safety
/// `meminfo` must come from this runtime.
#[no_mangle]
pub unsafe extern "C" fn NRT_MemInfo_call_dtor(meminfo: *mut MemInfo) {
    if meminfo.is_null() {
        return;
    }
    let fresh = RETIRED.with(|r| r.borrow_mut().0.insert(meminfo as usize));
    let info = &mut *meminfo;
    info.refcnt = 1;
    if !fresh {
        warn!("meminfo {:p} released after its last reference", meminfo);
        OVER_RELEASES.with(|c| c.set(c.get() + 1));
        return;
    }
    if let Some(dtor) = info.dtor.take() {
        dtor(info.data, info.size as usize, info.dtor_info);
    }
    info.data = ptr::null_mut();
    DESTRUCTIONS.with(|c| c.set(c.get() + 1));
}

/// Meminfo owning foreign `data`, released through `dtor(data, size, dtor_info)`.
///
/// # Safety
/// `dtor` must be safe to call once with the given arguments.
#[no_mangle]
pub unsafe extern "C" fn nmrtAllocMemInfo(
    data: *mut c_void,
    size: usize,
    dtor: Option<Dtor>,
    dtor_info: *mut c_void,
) -> *mut MemInfo {
    new_meminfo(data, size, dtor, dtor_info)
}

/// Fresh token cell; the caller stores the meminfo pointer into it.
#[no_mangle]
pub extern "C" fn nmrtCreateAllocToken() -> *mut *mut MemInfo {
    LIVE_TOKENS.with(|c| c.set(c.get() + 1));
    Box::into_raw(Box::new(ptr::null_mut()))
}

/// # Safety
/// `token` must come from `nmrtCreateAllocToken` and is freed here.
#[no_mangle]
pub unsafe extern "C" fn nmrtDestroyAllocToken(token: *mut *mut MemInfo) {
    if token.is_null() {
        return;
    }
    drop(Box::from_raw(token));
    LIVE_TOKENS.with(|c| c.set(c.get() - 1));
}

/// Run `body` over `num_loops` `{lower, upper, step}` triples.
///
/// # Safety
/// `ranges` must point to `3 * num_loops` values and `body` must accept them.
#[no_mangle]
pub unsafe extern "C" fn nmrtParallelFor(
    ranges: *const i64,
    num_loops: usize,
    body: ParallelBody,
    ctx: *mut c_void,
) {
    PARALLEL_CALLS.with(|c| c.set(c.get() + 1));
    if num_loops == 0 {
        return;
    }
    let mut local: Vec<i64> = std::slice::from_raw_parts(ranges, 3 * num_loops).to_vec();
    let (lower, upper, step) = (local[0], local[1], local[2]);
    if step <= 0 || upper <= lower {
        body(local.as_ptr(), 0, ctx);
        return;
    }
    let trips = (upper - lower + step - 1) / step;
    let per_chunk = (trips + PARALLEL_CHUNKS - 1) / PARALLEL_CHUNKS;
    let mut worker = 0;
    let mut start = 0;
    while start < trips {
        let end = (start + per_chunk).min(trips);
        local[0] = lower + start * step;
        local[1] = (lower + end * step).min(upper);
        body(local.as_ptr(), worker, ctx);
        worker += 1;
        start = end;
    }
}

/// Addresses of every entry point, for `EngineOptions::symbol_map`.
pub fn symbol_map() -> HashMap<String, usize> {
    let entries: [(&str, usize); 6] = [
        (ALLOC_FN, NRT_MemInfo_alloc_safe_aligned as usize),
        (CALL_DTOR_FN, NRT_MemInfo_call_dtor as usize),
        (ALLOC_MEMINFO_FN, nmrtAllocMemInfo as usize),
        (CREATE_TOKEN_FN, nmrtCreateAllocToken as usize),
        (DESTROY_TOKEN_FN, nmrtDestroyAllocToken as usize),
        (PARALLEL_FOR, nmrtParallelFor as usize),
    ];
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// External array struct of rank `R` as public functions receive and return it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ArrayStruct<const R: usize> {
    pub meminfo: *mut MemInfo,
    pub parent: *mut c_void,
    pub nitems: i64,
    pub itemsize: i64,
    pub data: *mut c_void,
    pub shape: [i64; R],
    /// In bytes.
    pub strides: [i64; R],
}

impl<const R: usize> ArrayStruct<R> {
    /// Contiguous array owned by a fresh meminfo, filled from `values`.
    pub fn from_slice<T: Copy>(shape: [i64; R], values: &[T]) -> Option<Self> {
        let nitems: i64 = shape.iter().product();
        if nitems as usize != values.len() {
            return None;
        }
        let itemsize = std::mem::size_of::<T>() as i64;
        let mut strides = [0; R];
        let mut stride = itemsize;
        for d in (0..R).rev() {
            strides[d] = stride;
            stride *= shape[d];
        }
        // SAFETY: the allocation holds `nitems` elements of `T`.
        unsafe {
            let meminfo = NRT_MemInfo_alloc_safe_aligned((nitems * itemsize) as usize, 32);
            if meminfo.is_null() {
                return None;
            }
            let data = (*meminfo).data;
            ptr::copy_nonoverlapping(values.as_ptr(), data as *mut T, values.len());
            Some(Self {
                meminfo,
                parent: ptr::null_mut(),
                nitems,
                itemsize,
                data,
                shape,
                strides,
            })
        }
    }

    /// Elements in logical (row-major) order.
    ///
    /// # Safety
    /// `data` must point to live elements of type `T`.
    pub unsafe fn to_vec<T: Copy>(&self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.nitems.max(0) as usize);
        let mut index = [0i64; R];
        for _ in 0..self.nitems {
            let offset: i64 = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
            out.push(*((self.data as *const u8).offset(offset as isize) as *const T));
            for d in (0..R).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    break;
                }
                index[d] = 0;
            }
        }
        out
    }

    pub fn refcount(&self) -> i64 {
        if self.meminfo.is_null() {
            return 0;
        }
        // SAFETY: a non-null meminfo points to a live header.
        unsafe { (*self.meminfo).refcnt }
    }

    /// Drop one reference, destroying the allocation on the last one.
    ///
    /// # Safety
    /// The caller must own a reference.
    pub unsafe fn release(&self) {
        if self.meminfo.is_null() {
            return;
        }
        (*self.meminfo).refcnt -= 1;
        if (*self.meminfo).refcnt == 0 {
            NRT_MemInfo_call_dtor(self.meminfo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_destroy() {
        reset_stats();
        let array = ArrayStruct::<2>::from_slice([2, 3], &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(array.strides, [24, 8]);
        assert_eq!(array.refcount(), 1);
        assert_eq!(unsafe { array.to_vec::<f64>() }, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        unsafe { array.release() };
        assert_eq!(stats().live_allocations(), 0);
        assert!(ArrayStruct::<1>::from_slice([3], &[1i32]).is_none());
    }

    unsafe extern "C" fn record_dtor(data: *mut c_void, size: usize, info: *mut c_void) {
        let seen = &mut *(info as *mut Vec<(usize, usize)>);
        seen.push((data as usize, size));
    }

    #[test]
    fn test_foreign_pointer_dtor() {
        reset_stats();
        let mut seen: Vec<(usize, usize)> = Vec::new();
        let data = 0x1000 as *mut c_void;
        unsafe {
            let mi = nmrtAllocMemInfo(data, 16, Some(record_dtor), &mut seen as *mut _ as *mut c_void);
            NRT_MemInfo_call_dtor(mi);
        }
        assert_eq!(seen, vec![(0x1000, 16)]);
        assert_eq!(stats().live_allocations(), 0);
    }

    #[test]
    fn test_release_after_destruction_is_flagged() {
        reset_stats();
        let array = ArrayStruct::<1>::from_slice([4], &[1u8, 2, 3, 4]).unwrap();
        unsafe { array.release() };
        assert_eq!(stats().destructions, 1);
        assert_eq!(stats().over_releases, 0);
        unsafe { array.release() };
        unsafe { array.release() };
        assert_eq!(stats().destructions, 1);
        assert_eq!(stats().over_releases, 2);
        reset_stats();
        assert_eq!(stats(), RuntimeStats::default());
    }

    #[test]
    fn test_tokens_balance() {
        reset_stats();
        let token = nmrtCreateAllocToken();
        assert_eq!(stats().live_tokens, 1);
        unsafe { nmrtDestroyAllocToken(token) };
        assert_eq!(stats().live_tokens, 0);
    }

    thread_local! {
        static VISITED: std::cell::RefCell<Vec<(i64, i64, usize)>> = const { std::cell::RefCell::new(Vec::new()) };
    }

    unsafe extern "C" fn record_body(ranges: *const i64, worker: usize, _ctx: *mut c_void) {
        let r = std::slice::from_raw_parts(ranges, 6);
        assert_eq!(&r[3..], &[0, 2, 1]);
        VISITED.with(|v| v.borrow_mut().push((r[0], r[1], worker)));
    }

    #[test]
    fn test_parallel_for_covers_range_in_chunks() {
        VISITED.with(|v| v.borrow_mut().clear());
        let ranges = [1i64, 10, 2, 0, 2, 1];
        unsafe { nmrtParallelFor(ranges.as_ptr(), 2, record_body, ptr::null_mut()) };
        let visited = VISITED.with(|v| v.borrow().clone());
        // 1,3,5,7,9 in chunks of two iterations
        assert_eq!(visited, vec![(1, 5, 0), (5, 9, 1), (9, 10, 2)]);
    }

    #[test]
    fn test_symbol_map_is_complete() {
        let map = symbol_map();
        assert_eq!(map.len(), 6);
        assert!(map.values().all(|addr| *addr != 0));
        assert!(map.contains_key(PARALLEL_FOR));
    }
}
