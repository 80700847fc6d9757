//! Page-backed buffer chains
//!
//! The storage unit is the `MBuf`: one physical page holding a small header
//! and a payload tail, constructed in place inside the frame's direct-mapped
//! view. MBufs are threaded onto an intrusive doubly-linked list so a whole
//! batch can be spliced onto a chain, or detached from it, without touching
//! the frame pool in between.

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::{self, addr_of_mut, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::vec::Vec;

use super::ChainError;
use crate::mem::{FrameSource, PhysAddr, UserSink, UserSource, PAGE_SIZE};

/// Total bytes occupied by live MBufs, process wide (relaxed).
static MBUF_TOTAL_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Bytes of MBuf storage currently alive across every chain.
///
/// Best-effort accounting: updates are relaxed-atomic and the value is only
/// advisory.
pub fn mbuf_total_bytes() -> usize {
    MBUF_TOTAL_BYTES.load(Ordering::Relaxed)
}

/// Fixed header footprint of an `MBuf`: two list links, `len`, `pkt_len`,
/// and the backing frame address.
const HEADER_SIZE: usize = 2 * size_of::<usize>() + 2 * size_of::<u32>() + size_of::<PhysAddr>();

/// Payload bytes carried by a single page-sized buffer.
///
/// Exposed so tests can build payloads that land exactly on buffer seams.
pub const MBUF_PAYLOAD_SIZE: usize = PAGE_SIZE as usize - HEADER_SIZE;

/// Most bytes one chain will hold.
pub const CHAIN_CAPACITY: usize = 128 * MBUF_PAYLOAD_SIZE;

/// Buffers needed to carry `payload` bytes; `payload` must be non-zero.
const fn bufs_needed(payload: usize) -> usize {
    1 + (payload - 1) / MBUF_PAYLOAD_SIZE
}

/// A page-sized chainable buffer: list header plus payload tail.
///
/// An MBuf lives inside the direct-mapped view of the frame it records, so
/// returning the frame to the pool is what frees the MBuf. Payload bytes at
/// and beyond `len` are uninitialized and never read.
#[repr(C)]
struct MBuf {
    next: *mut MBuf,
    prev: *mut MBuf,
    /// Valid payload bytes; writes append after this and extend it.
    len: u32,
    /// Total datagram length on the first buffer of a datagram; `0` on
    /// continuation buffers and everywhere in stream mode.
    pkt_len: u32,
    /// Backing physical frame, handed back to the pool when the MBuf dies.
    frame: PhysAddr,
    data: [u8; MBUF_PAYLOAD_SIZE],
}

const _: () = assert!(size_of::<MBuf>() == PAGE_SIZE as usize);

impl MBuf {
    /// Construct an MBuf in place at `at`, the kernel view of `frame`.
    ///
    /// Only the header is written; payload bytes stay uninitialized until a
    /// write lands on them.
    ///
    /// # Safety
    ///
    /// `at` must point to `PAGE_SIZE` bytes of exclusively-owned writable
    /// memory that stays alive until [`MBuf::dismantle`].
    unsafe fn build(at: *mut MBuf, frame: PhysAddr) -> NonNull<MBuf> {
        // SAFETY: `at` covers a whole page per the contract, so every header
        // field is in bounds.
        unsafe {
            addr_of_mut!((*at).next).write(ptr::null_mut());
            addr_of_mut!((*at).prev).write(ptr::null_mut());
            addr_of_mut!((*at).len).write(0);
            addr_of_mut!((*at).pkt_len).write(0);
            addr_of_mut!((*at).frame).write(frame);
        }
        MBUF_TOTAL_BYTES.fetch_add(size_of::<MBuf>(), Ordering::Relaxed);

        // SAFETY: a page-backed pointer is never null.
        unsafe { NonNull::new_unchecked(at) }
    }

    /// Tear an MBuf down, yielding the frame to hand back to the pool.
    ///
    /// # Safety
    ///
    /// `buf` must come from [`MBuf::build`] and must not be used afterwards.
    unsafe fn dismantle(buf: NonNull<MBuf>) -> PhysAddr {
        MBUF_TOTAL_BYTES.fetch_sub(size_of::<MBuf>(), Ordering::Relaxed);
        // SAFETY: still alive until the caller frees the frame.
        unsafe { buf.as_ref().frame }
    }

    /// Payload space left at the tail.
    fn rem(&self) -> usize {
        MBUF_PAYLOAD_SIZE - self.len as usize
    }

    /// Valid payload window: `n` bytes starting at `off`.
    fn payload(&self, off: usize, n: usize) -> &[u8] {
        debug_assert!(off + n <= self.len as usize);
        &self.data[off..off + n]
    }

    /// Uninitialized tail to append `n` bytes into.
    fn tail_mut(&mut self, n: usize) -> &mut [u8] {
        debug_assert!(n <= self.rem());
        let at = self.len as usize;
        &mut self.data[at..at + n]
    }
}

/// Intrusive doubly-linked list threaded through MBuf headers.
///
/// Nodes are owned by whichever list currently links them; a list is always
/// drained back into the frame pool (or spliced onto another list) before it
/// goes away, which `MBufChain` enforces at its boundaries.
struct MBufList {
    head: *mut MBuf,
    tail: *mut MBuf,
}

impl MBufList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    fn front(&self) -> Option<&MBuf> {
        // SAFETY: `head` is either null or a live node owned by this list.
        unsafe { self.head.as_ref() }
    }

    fn front_mut(&mut self) -> Option<&mut MBuf> {
        // SAFETY: as in `front`, and `&mut self` gives exclusive access.
        unsafe { self.head.as_mut() }
    }

    fn back_mut(&mut self) -> Option<&mut MBuf> {
        // SAFETY: as in `front`, and `&mut self` gives exclusive access.
        unsafe { self.tail.as_mut() }
    }

    fn push_front(&mut self, buf: NonNull<MBuf>) {
        let node = buf.as_ptr();
        // SAFETY: `node` is a live unlinked MBuf; head is null or live.
        unsafe {
            (*node).prev = ptr::null_mut();
            (*node).next = self.head;
            if let Some(head) = self.head.as_mut() {
                head.prev = node;
            } else {
                self.tail = node;
            }
        }
        self.head = node;
    }

    fn push_back(&mut self, buf: NonNull<MBuf>) {
        let node = buf.as_ptr();
        // SAFETY: `node` is a live unlinked MBuf; tail is null or live.
        unsafe {
            (*node).next = ptr::null_mut();
            (*node).prev = self.tail;
            if let Some(tail) = self.tail.as_mut() {
                tail.next = node;
            } else {
                self.head = node;
            }
        }
        self.tail = node;
    }

    fn pop_front(&mut self) -> Option<NonNull<MBuf>> {
        let node = NonNull::new(self.head)?;
        // SAFETY: `node` was the live head; its successor is null or live.
        unsafe {
            self.head = node.as_ref().next;
            if let Some(head) = self.head.as_mut() {
                head.prev = ptr::null_mut();
            } else {
                self.tail = ptr::null_mut();
            }
            (*node.as_ptr()).next = ptr::null_mut();
        }
        Some(node)
    }

    /// Append every node of `other` in order. O(1).
    fn splice_back(&mut self, mut other: MBufList) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.head = other.head;
            self.tail = other.tail;
        } else {
            // SAFETY: both ends are live nodes owned by the two lists.
            unsafe {
                (*self.tail).next = other.head;
                (*other.head).prev = self.tail;
            }
            self.tail = other.tail;
        }
        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
    }

    fn take(&mut self) -> MBufList {
        core::mem::replace(self, MBufList::new())
    }

    fn iter(&self) -> MBufIter<'_> {
        MBufIter {
            cur: self.head,
            _list: PhantomData,
        }
    }
}

struct MBufIter<'a> {
    cur: *const MBuf,
    _list: PhantomData<&'a MBufList>,
}

impl<'a> Iterator for MBufIter<'a> {
    type Item = &'a MBuf;

    fn next(&mut self) -> Option<&'a MBuf> {
        // SAFETY: nodes reached from the borrowed list stay alive for 'a.
        let buf = unsafe { self.cur.as_ref()? };
        self.cur = buf.next;
        Some(buf)
    }
}

/// Transport memory for one channel endpoint.
///
/// Stores either a byte stream or an ordered queue of atomic datagrams;
/// the caller picks one mode per chain and sticks to it. The chain performs
/// no locking of its own: the owning dispatcher serializes access, one lock
/// per endpoint.
///
/// The chain draws page-sized buffers from the [`FrameSource`] it was built
/// with and returns every page it still holds when dropped.
pub struct MBufChain<F: FrameSource> {
    frames: F,
    /// Front is the read end, back is the write end.
    buffers: MBufList,
    /// Byte offset of the read cursor within the front buffer.
    read_off: u32,
    /// Valid bytes stored, net of the consumed front-buffer prefix.
    size: usize,
}

// SAFETY: the chain exclusively owns the MBufs its raw pointers reach; the
// pages move with the chain and nothing else aliases them.
unsafe impl<F: FrameSource + Send> Send for MBufChain<F> {}

impl<F: FrameSource> MBufChain<F> {
    /// Create an empty chain drawing pages from `frames`.
    pub const fn new(frames: F) -> Self {
        Self {
            frames,
            buffers: MBufList::new(),
            read_off: 0,
            size: 0,
        }
    }

    /// Append up to `len` bytes of stream data from `src`.
    ///
    /// Best-effort: the tail of the current write buffer is filled first,
    /// then the remainder is allocated as one all-or-nothing batch, so the
    /// result may be a short write when the chain nears capacity or the
    /// frame pool runs dry. Returns the bytes appended.
    ///
    /// [`ChainError::WouldBlock`] means nothing could be appended; on
    /// [`ChainError::Fault`] the `complete` bytes counted there were
    /// appended before the fault and remain in the chain.
    pub fn write_stream<S>(&mut self, src: &S, len: usize) -> Result<usize, ChainError>
    where
        S: UserSource + ?Sized,
    {
        // Cap by the remaining capacity up front so `size` never overshoots.
        let len = len.min(CHAIN_CAPACITY - self.size);
        let mut pos = 0;

        // Fill the tail of the buffer at the write end before allocating.
        if let Some(back) = self.buffers.back_mut() {
            let want = back.rem().min(len);
            if want > 0 {
                match src.copy_from_user(pos, back.tail_mut(want)) {
                    Ok(()) => {
                        back.len += want as u32;
                        self.size += want;
                        pos += want;
                    }
                    Err(_) => return Err(ChainError::Fault { complete: pos }),
                }
            }
        }

        if pos < len {
            if let Some(mut batch) = self.alloc_bufs(bufs_needed(len - pos)) {
                while let Some(mut buf) = batch.pop_front() {
                    // SAFETY: batch nodes are live MBufs we exclusively own.
                    let cur = unsafe { buf.as_mut() };
                    let want = cur.rem().min(len - pos);
                    match src.copy_from_user(pos, cur.tail_mut(want)) {
                        Ok(()) => {
                            cur.len += want as u32;
                            self.size += want;
                            pos += want;
                        }
                        Err(_) => {
                            // Nothing in the batch joined the chain yet this
                            // iteration; hand it all straight back.
                            batch.push_front(buf);
                            self.free_bufs(batch);
                            return Err(ChainError::Fault { complete: pos });
                        }
                    }
                    self.buffers.push_back(buf);
                }
            }
        }

        if pos == 0 {
            return Err(ChainError::WouldBlock);
        }
        Ok(pos)
    }

    /// Append one atomic datagram of exactly `len` bytes from `src`.
    ///
    /// Either the whole datagram is committed and becomes readable as one
    /// unit, or the chain is left untouched: a zero `len` or a faulting
    /// source is [`ChainError::InvalidArgument`], an oversized datagram is
    /// [`ChainError::OutOfRange`], and missing space or pages is
    /// [`ChainError::WouldBlock`].
    pub fn write_datagram<S>(&mut self, src: &S, len: usize) -> Result<usize, ChainError>
    where
        S: UserSource + ?Sized,
    {
        if len == 0 {
            return Err(ChainError::InvalidArgument);
        }
        if len > CHAIN_CAPACITY {
            return Err(ChainError::OutOfRange);
        }
        if len + self.size > CHAIN_CAPACITY {
            return Err(ChainError::WouldBlock);
        }

        let Some(mut batch) = self.alloc_bufs(bufs_needed(len)) else {
            return Err(ChainError::WouldBlock);
        };

        let mut staged = MBufList::new();
        let mut pos = 0;
        while let Some(mut buf) = batch.pop_front() {
            // SAFETY: batch nodes are live MBufs we exclusively own.
            let cur = unsafe { buf.as_mut() };
            let want = MBUF_PAYLOAD_SIZE.min(len - pos);
            if src.copy_from_user(pos, cur.tail_mut(want)).is_err() {
                // Bad user buffer: roll the whole datagram back.
                batch.push_front(buf);
                staged.splice_back(batch);
                self.free_bufs(staged);
                return Err(ChainError::InvalidArgument);
            }
            cur.len = want as u32;
            pos += want;
            staged.push_back(buf);
        }

        if let Some(first) = staged.front_mut() {
            first.pkt_len = len as u32;
        }
        self.buffers.splice_back(staged);
        self.size += len;
        Ok(len)
    }

    /// Copy up to `len` bytes out of the chain into `dst`, consuming them.
    ///
    /// With `datagram` set, at most one datagram is returned; if `dst` is
    /// too small the datagram's tail is discarded, so a partially-read
    /// datagram never straddles two calls. On [`ChainError::Fault`] the
    /// `complete` bytes counted there were copied out first; in datagram
    /// mode the rest of the datagram is still discarded, leaving the chain
    /// positioned on the next datagram boundary.
    pub fn read<S>(&mut self, dst: &mut S, len: usize, datagram: bool) -> Result<usize, ChainError>
    where
        S: UserSink + ?Sized,
    {
        if self.size == 0 {
            return Ok(0);
        }

        let mut len = len;
        if datagram {
            if let Some(front) = self.buffers.front() {
                len = len.min(front.pkt_len as usize);
            }
        }

        let mut pos = 0;
        let mut cursor = self.read_off as usize;
        let mut drained = MBufList::new();
        let mut faulted = false;

        while pos < len && !faulted {
            let Some(front) = self.buffers.front() else {
                break;
            };
            let avail = front.len as usize;
            let want = (avail - cursor).min(len - pos);
            match dst.copy_to_user(pos, front.payload(cursor, want)) {
                Ok(()) => {
                    pos += want;
                    cursor += want;
                    self.size -= want;
                }
                Err(_) => faulted = true,
            }

            // Detach the front buffer once drained; datagram reads always
            // detach, discarding whatever the copy skipped over.
            if cursor == avail || datagram {
                if datagram {
                    self.size -= avail - cursor;
                }
                if let Some(buf) = self.buffers.pop_front() {
                    drained.push_back(buf);
                }
                cursor = 0;
            }
        }

        if datagram {
            // Drop the rest of the datagram, fault or not, so the next read
            // starts on a datagram boundary.
            while self.buffers.front().is_some_and(|f| f.pkt_len == 0) {
                if let Some(buf) = self.buffers.pop_front() {
                    // SAFETY: just detached; still alive until freed below.
                    let stored = unsafe { buf.as_ref().len as usize };
                    self.size -= stored - cursor;
                    cursor = 0;
                    drained.push_back(buf);
                }
            }
        }

        self.read_off = cursor as u32;
        if !drained.is_empty() {
            self.free_bufs(drained);
        }

        if faulted {
            Err(ChainError::Fault { complete: pos })
        } else {
            Ok(pos)
        }
    }

    /// Copy up to `len` bytes out of the chain without consuming anything.
    ///
    /// Mirrors [`MBufChain::read`] but leaves buffers, cursor, and size
    /// untouched, so repeating an identical peek returns identical bytes.
    /// With `datagram` set the copy is clamped to the first datagram.
    pub fn peek<S>(&self, dst: &mut S, len: usize, datagram: bool) -> Result<usize, ChainError>
    where
        S: UserSink + ?Sized,
    {
        if self.size == 0 {
            return Ok(0);
        }

        let mut len = len;
        if datagram {
            if let Some(front) = self.buffers.front() {
                len = len.min(front.pkt_len as usize);
            }
        }

        let mut pos = 0;
        let mut cursor = self.read_off as usize;
        for buf in self.buffers.iter() {
            if pos >= len {
                break;
            }
            let want = (buf.len as usize - cursor).min(len - pos);
            if dst.copy_to_user(pos, buf.payload(cursor, want)).is_err() {
                return Err(ChainError::Fault { complete: pos });
            }
            pos += want;
            cursor = 0;
        }
        Ok(pos)
    }

    /// Bytes stored in the chain.
    ///
    /// With `datagram` set, the size of the next datagram to be read
    /// instead, which is `0` for a stream-mode chain.
    pub fn size(&self, datagram: bool) -> usize {
        if datagram && self.size != 0 {
            return self.buffers.front().map_or(0, |f| f.pkt_len as usize);
        }
        self.size
    }

    /// Whether the chain holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Whether the chain has reached capacity and writes should back off.
    pub fn is_full(&self) -> bool {
        self.size >= CHAIN_CAPACITY
    }

    /// Allocate exactly `count` MBufs as one batch, or none at all.
    fn alloc_bufs(&mut self, count: usize) -> Option<MBufList> {
        let frames = self.frames.alloc_frames(count)?;
        let mut bufs = MBufList::new();
        for frame in frames {
            let at = self.frames.frame_ptr(frame).cast::<MBuf>();
            // SAFETY: `frame` is a page we now exclusively own and `at` is
            // its kernel-addressable storage.
            bufs.push_back(unsafe { MBuf::build(at, frame) });
        }
        Some(bufs)
    }

    /// Tear down `bufs` and return their pages to the pool in one batch.
    fn free_bufs(&mut self, mut bufs: MBufList) {
        let mut frames = Vec::new();
        while let Some(buf) = bufs.pop_front() {
            // SAFETY: detached nodes; nothing references them after this.
            frames.push(unsafe { MBuf::dismantle(buf) });
        }
        self.frames.free_frames(frames);
    }
}

impl<F: FrameSource> Drop for MBufChain<F> {
    fn drop(&mut self) {
        let bufs = self.buffers.take();
        if !bufs.is_empty() {
            self.free_bufs(bufs);
        }
    }
}
