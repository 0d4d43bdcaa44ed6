//! Wrap-around multi-channel sample store shared between pipeline stages
//!
//! A ring buffer owns a contiguous float store of shape (`csize`, `stride`),
//! where `csize` enumerates the per-sample channel tuple and `stride` is a
//! time stride chosen at allocation. Samples are addressed by *position*: a
//! nonnegative integer index in the undecimated time base. A buffer with
//! downsampling factor `nds` stores one sample per `nds` input positions.
//!
//! Every read or write goes through a paired `get`/`put`: [`RingBuffer::get`]
//! opens an [`AccessWindow`] over a contiguous position range, and releasing
//! the window (explicitly via [`AccessWindow::put`], or on drop) completes
//! the pair. When a requested window straddles the wrap point, the ring
//! copies one period's worth of samples inside the store ("mirroring") so
//! the caller always sees a flat array.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::utils::{round_up, xdiv};

/// Sample index in the undecimated time base.
pub type Pos = i64;

/// Alignment of the float store, matching the cache-line requirements of
/// downstream SIMD kernels.
const STORE_ALIGNMENT: usize = 64;

/// Dictionary of named ring buffers threaded through bind().
pub type RingBufferDict = HashMap<String, Arc<RingBuffer>>;

/// How a `get`/`put` pair intends to use its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read existing samples; both window endpoints must hold valid data.
    Read,
    /// Overwrite samples already inside the ring.
    Write,
    /// Read and modify samples in place.
    ReadWrite,
    /// Write new samples at the producer frontier, advancing `curr_pos`.
    Append,
}

impl AccessMode {
    /// True for modes that read existing data (`Read`, `ReadWrite`).
    pub fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    /// True for modes that modify the store (`Write`, `ReadWrite`, `Append`).
    pub fn writes(self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// Owned, 64-byte-aligned, zero-initialized float allocation.
#[derive(Debug)]
struct Store {
    ptr: NonNull<f32>,
    layout: Layout,
}

impl Store {
    fn new(nelts: usize) -> Result<Self> {
        let layout = Layout::from_size_align(nelts.max(1) * size_of::<f32>(), STORE_ALIGNMENT)
            .map_err(|_| Error::Layout("invalid ring buffer store layout".into()))?;

        // Safety: layout has nonzero size and valid alignment
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr as *mut f32).ok_or(Error::MemoryAllocationFailed)?;

        Ok(Self { ptr, layout })
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr() as *mut u8, self.layout);
        }
    }
}

// Safety: the store is an owned allocation; aliasing is governed by the
// single-outstanding-access invariant enforced in RingState.
unsafe impl Send for Store {}

/// Bookkeeping for the (at most one) outstanding access window.
#[derive(Debug)]
struct OpenAccess {
    pos0: Pos,
    pos1: Pos,
    mode: AccessMode,
}

/// Mutable ring state, guarded by one mutex per buffer.
#[derive(Debug)]
struct RingState {
    nt_contig: Pos,
    nt_maxlag: Pos,
    period: i64,
    stride: i64,
    store: Option<Store>,
    /// Producer frontier, in stored samples.
    curr_pos: i64,
    /// Low end of the valid span, in store offsets.
    first_valid: i64,
    /// High end of the valid span, in store offsets.
    last_valid: i64,
    ap: Option<OpenAccess>,
}

impl RingState {
    /// Copy `n` stored samples from offset `it_src` to `it_dst` in every
    /// channel row. The two spans never overlap: they are one period apart
    /// and `n <= period`.
    fn copy_span(&mut self, csize: i64, it_dst: i64, it_src: i64, n: i64) {
        let base = self.store.as_ref().expect("copy_span() on unallocated ring").ptr.as_ptr();
        for i in 0..csize {
            unsafe {
                let row = base.add((i * self.stride) as usize);
                std::ptr::copy_nonoverlapping(
                    row.add(it_src as usize),
                    row.add(it_dst as usize),
                    n as usize,
                );
            }
        }
    }

    fn mirror_initial(&mut self, csize: i64, it0: i64) {
        if it0 < self.first_valid {
            assert!(
                self.last_valid >= self.first_valid + self.period,
                "ring_buffer: mirror_initial() requires a full valid span"
            );
            self.copy_span(csize, it0, it0 + self.period, self.first_valid - it0);
            self.first_valid = it0;
        }
    }

    fn mirror_final(&mut self, csize: i64, it1: i64) {
        if it1 > self.last_valid {
            assert!(
                self.first_valid <= self.last_valid - self.period,
                "ring_buffer: mirror_final() requires a full valid span"
            );
            self.copy_span(csize, self.last_valid, self.last_valid - self.period, it1 - self.last_valid);
            self.last_valid = it1;
        }
    }
}

/// Fixed-capacity, wrap-around, multi-channel sample store.
///
/// Sizing accumulates across consumers: every consumer calls
/// [`update_params`](RingBuffer::update_params) during bind, and
/// [`allocate`](RingBuffer::allocate) then sizes the ring for the union of
/// all requirements.
#[derive(Debug)]
pub struct RingBuffer {
    cdims: Vec<i64>,
    csize: i64,
    nds: i64,
    state: Mutex<RingState>,
}

// Safety: all mutable state is behind the mutex; the raw store pointer is
// only dereferenced under the mutex or through the single outstanding
// AccessWindow.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create an unallocated ring buffer with the given channel dimensions
    /// and downsampling factor.
    pub fn new(cdims: Vec<i64>, nds: i64) -> Result<Self> {
        if cdims.len() >= 6 {
            return Err(Error::RingBuffer(
                "attempt to construct high-dimensional ring buffer is probably unintentional".into(),
            ));
        }
        for &d in &cdims {
            if d <= 0 {
                return Err(Error::RingBuffer("expected all dimensions > 0".into()));
            }
        }
        if nds <= 0 {
            return Err(Error::RingBuffer("expected nds > 0".into()));
        }

        let csize = cdims.iter().product();

        Ok(Self {
            cdims,
            csize,
            nds,
            state: Mutex::new(RingState {
                nt_contig: 0,
                nt_maxlag: 0,
                period: 0,
                stride: 0,
                store: None,
                curr_pos: 0,
                first_valid: 0,
                last_valid: 0,
                ap: None,
            }),
        })
    }

    /// Ordered channel dimensions.
    pub fn cdims(&self) -> &[i64] {
        &self.cdims
    }

    /// Product of the channel dimensions (number of channel rows).
    pub fn csize(&self) -> i64 {
        self.csize
    }

    /// Downsampling factor: one stored sample per `nds` input positions.
    pub fn nds(&self) -> i64 {
        self.nds
    }

    /// Widen the sizing parameters. May only be called before allocation,
    /// and each call may only increase `nt_contig` and `nt_maxlag`.
    pub fn update_params(&self, nt_contig: Pos, nt_maxlag: Pos) {
        let mut st = self.state.lock().unwrap();
        assert!(st.store.is_none(), "ring_buffer: update_params() called after allocate()");
        assert!(nt_contig > 0);
        assert!(nt_maxlag >= nt_contig);

        st.nt_contig = st.nt_contig.max(nt_contig);
        st.nt_maxlag = st.nt_maxlag.max(nt_maxlag);
    }

    /// Allocate the float store. Idempotent: a second call without an
    /// intervening deallocate changes no observable state.
    pub fn allocate(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        assert!(st.nt_contig > 0, "ring_buffer: allocate() before update_params()");
        assert!(st.nt_maxlag >= st.nt_contig);
        assert!(st.ap.is_none());

        if st.store.is_some() {
            return Ok(());
        }

        let period = round_up((st.nt_maxlag + self.nds - 1) / self.nds, 32);
        let mut stride = round_up(period + (st.nt_contig + self.nds - 2) / self.nds, 16);

        // Break power-of-two strides that alias cache sets in downstream
        // SIMD kernels.
        if stride % 32 == 0 {
            stride += 16;
        }

        st.store = Some(Store::new((self.csize * stride) as usize)?);
        st.period = period;
        st.stride = stride;
        st.curr_pos = 0;
        st.first_valid = 0;
        st.last_valid = 0;

        Ok(())
    }

    /// Release the float store. No access window may be open.
    pub fn deallocate(&self) {
        let mut st = self.state.lock().unwrap();
        assert!(st.ap.is_none(), "ring_buffer: deallocate() with an open access window");
        st.store = None;
    }

    /// Reset the producer frontier and valid span; called once per run.
    pub fn start(&self) {
        let mut st = self.state.lock().unwrap();
        assert!(st.store.is_some(), "ring_buffer: start() before allocate()");
        assert!(st.ap.is_none());

        st.curr_pos = 0;
        st.first_valid = 0;
        st.last_valid = 0;
    }

    /// Whether the float store is currently allocated.
    pub fn is_allocated(&self) -> bool {
        self.state.lock().unwrap().store.is_some()
    }

    /// Time stride of the store, in floats. Only valid after allocation.
    pub fn stride(&self) -> i64 {
        let st = self.state.lock().unwrap();
        assert!(st.store.is_some(), "ring_buffer: stride() before allocate()");
        st.stride
    }

    /// Ring capacity in stored samples. Only valid after allocation.
    pub fn period(&self) -> i64 {
        let st = self.state.lock().unwrap();
        assert!(st.store.is_some(), "ring_buffer: period() before allocate()");
        st.period
    }

    /// Producer frontier, in stored samples.
    pub fn curr_pos(&self) -> i64 {
        self.state.lock().unwrap().curr_pos
    }

    /// Current `(first_valid, last_valid)` store offsets; diagnostic.
    pub fn valid_span(&self) -> (i64, i64) {
        let st = self.state.lock().unwrap();
        (st.first_valid, st.last_valid)
    }

    /// Accumulated contiguous-window requirement.
    pub fn nt_contig(&self) -> Pos {
        self.state.lock().unwrap().nt_contig
    }

    /// Accumulated lag requirement.
    pub fn nt_maxlag(&self) -> Pos {
        self.state.lock().unwrap().nt_maxlag
    }

    /// Open an access window over positions `[pos0, pos1)`.
    ///
    /// Both endpoints must be multiples of `nds`, the window may not exceed
    /// `nt_contig`, and at most one window may be open per ring buffer. In
    /// `Append` mode the window must start at the producer frontier, which
    /// advances to `pos1`; in all other modes the window must lie inside
    /// the ring (`pos0 >= curr_pos - period`, `pos1 <= curr_pos`, in stored
    /// samples).
    pub fn get(self: &Arc<Self>, pos0: Pos, pos1: Pos, mode: AccessMode) -> AccessWindow {
        let mut st = self.state.lock().unwrap();

        assert!(pos0 >= 0);
        assert!(pos0 <= pos1);
        assert!(
            pos1 - pos0 <= st.nt_contig,
            "ring_buffer: window [{}, {}) exceeds nt_contig={}",
            pos0,
            pos1,
            st.nt_contig
        );
        assert!(st.store.is_some(), "ring_buffer: get() before allocate()");
        assert!(st.ap.is_none(), "ring_buffer: access window already open");

        let p0 = xdiv(pos0, self.nds);
        let p1 = xdiv(pos1, self.nds);

        if mode == AccessMode::Append {
            assert!(
                p0 == st.curr_pos,
                "ring_buffer: append window [{}, {}) does not start at the producer frontier",
                pos0,
                pos1
            );
            st.curr_pos = p1;
        } else {
            assert!(
                p0 >= st.curr_pos - st.period,
                "ring_buffer: window [{}, {}) falls below the ring",
                pos0,
                pos1
            );
            assert!(
                p1 <= st.curr_pos,
                "ring_buffer: window [{}, {}) extends beyond the producer frontier",
                pos0,
                pos1
            );
        }

        let it0 = p0 % st.period;
        let it1 = it0 + (p1 - p0);

        if mode.reads() {
            st.mirror_initial(self.csize, it0);
            st.mirror_final(self.csize, it1);
        } else {
            st.mirror_initial(self.csize, it1);
        }

        let base = st.store.as_ref().unwrap().ptr;
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(it0 as usize)) };
        let stride = st.stride;

        st.ap = Some(OpenAccess { pos0, pos1, mode });

        AccessWindow {
            rb: Arc::clone(self),
            ptr,
            stride,
            csize: self.csize,
            nt: p1 - p0,
            pos0,
            pos1,
            mode,
            released: false,
        }
    }

    /// Complete the `get`/`put` pair for the recorded access window.
    fn finish_access(&self, pos0: Pos, pos1: Pos, mode: AccessMode) {
        let mut st = self.state.lock().unwrap();

        let ap = st.ap.take().expect("ring_buffer: put() without matching get()");
        assert!(
            ap.pos0 == pos0 && ap.pos1 == pos1 && ap.mode == mode,
            "ring_buffer: put() does not match the open access window"
        );

        if !mode.writes() {
            return;
        }

        let p0 = xdiv(pos0, self.nds);
        let p1 = xdiv(pos1, self.nds);
        let it0 = p0 % st.period;
        let it1 = it0 + (p1 - p0);

        if it0 < st.first_valid {
            assert!(st.first_valid <= it1);
            st.first_valid = it0;
        }

        if it1 > st.last_valid {
            assert!(st.last_valid >= it0);
            st.last_valid = it1;
        }

        st.last_valid = st.last_valid.min(it0 + st.period);
        st.first_valid = st.first_valid.max(it1 - st.period);
    }
}

/// Scoped lease on a contiguous region of a ring buffer.
///
/// The window presents the requested position range as a flat 2-d array:
/// channel row `i` starts `i * stride` floats past the base. Dropping the
/// window releases the lease; [`put`](AccessWindow::put) releases it
/// explicitly.
#[derive(Debug)]
pub struct AccessWindow {
    rb: Arc<RingBuffer>,
    ptr: NonNull<f32>,
    stride: i64,
    csize: i64,
    nt: i64,
    pos0: Pos,
    pos1: Pos,
    mode: AccessMode,
    released: bool,
}

// Safety: at most one window is open per ring, and the ring keeps the store
// alive while the window exists (deallocate asserts no open access).
unsafe impl Send for AccessWindow {}

impl AccessWindow {
    /// First position of the window (undecimated).
    pub fn pos0(&self) -> Pos {
        self.pos0
    }

    /// One past the last position of the window (undecimated).
    pub fn pos1(&self) -> Pos {
        self.pos1
    }

    /// Access mode of the window.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Stored samples per channel row in this window.
    pub fn nt(&self) -> i64 {
        self.nt
    }

    /// Distance between consecutive channel rows, in floats.
    pub fn stride(&self) -> usize {
        self.stride as usize
    }

    /// Number of channel rows.
    pub fn csize(&self) -> i64 {
        self.csize
    }

    /// Channel row `i`, `nt` stored samples long.
    pub fn row(&self, i: usize) -> &[f32] {
        assert!((i as i64) < self.csize);
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr().add(i * self.stride as usize), self.nt as usize)
        }
    }

    /// Mutable channel row `i`. The window's mode must write.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        assert!((i as i64) < self.csize);
        assert!(self.mode.writes(), "ring_buffer: mutable access through a read-only window");
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(i * self.stride as usize), self.nt as usize)
        }
    }

    /// The full strided plane: `(csize - 1) * stride + nt` floats starting
    /// at channel row 0.
    pub fn plane(&self) -> &[f32] {
        let len = ((self.csize - 1) * self.stride + self.nt) as usize;
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }

    /// Mutable strided plane. The window's mode must write.
    pub fn plane_mut(&mut self) -> &mut [f32] {
        assert!(self.mode.writes(), "ring_buffer: mutable access through a read-only window");
        let len = ((self.csize - 1) * self.stride + self.nt) as usize;
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), len) }
    }

    /// Release the window, completing the `get`/`put` pair.
    pub fn put(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.rb.finish_access(self.pos0, self.pos1, self.mode);
        }
    }
}

impl Drop for AccessWindow {
    fn drop(&mut self) {
        // Contract violations leave the ring poisoned; skipping the release
        // during an unwind avoids a second panic inside drop.
        if !std::thread::panicking() {
            self.release();
        }
    }
}
