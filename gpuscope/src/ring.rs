//! # Lossy Bounded Channel
//!
//! Fixed-capacity byte ring carrying event records from the capture path to
//! the single consumer task. The producer side mirrors the kernel ring
//! buffer contract the probes rely on: `reserve` → write → `commit` (or
//! `discard`), and a full buffer means the record is dropped and counted;
//! the capture path never blocks and never retries.
//!
//! Framing: every record is preceded by one 8-byte-aligned header word
//! holding the payload length and BUSY/DISCARD flags. A PAD marker retires
//! the tail of the buffer when a record does not fit contiguously before the
//! wrap point. The consumer stops at the first BUSY header, which preserves
//! commit order and guarantees a reserved-but-uncommitted slot is never
//! observed.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::shutdown::Shutdown;

/// Header layout: low 24 bits payload length, high bits flags.
const LEN_MASK: u32 = 0x00FF_FFFF;
const FLAG_BUSY: u32 = 1 << 31;
const FLAG_DISCARD: u32 = 1 << 30;
const FLAG_PAD: u32 = 1 << 29;

/// Bytes reserved for a record header; also the alignment of every slot.
const HDR_BYTES: usize = 8;

const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Dispatch callback verdict: keep draining or halt within this poll call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// Outcome of one consumer poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// At least one committed record was dispatched.
    Processed(usize),
    /// The timeout elapsed with nothing to dispatch.
    TimedOut,
    /// The shutdown signal tripped during the wait; treat as a normal
    /// termination trigger, not an error.
    Interrupted,
}

/// The shared ring. Producers call [`RingBuffer::reserve`]; the single
/// consumer drains through the [`RingConsumer`] handle returned by
/// [`RingBuffer::with_capacity`].
pub struct RingBuffer {
    storage: Box<[UnsafeCell<u64>]>,
    cap: usize,
    /// Producer cursor, serialized across producers. Monotonic byte count.
    head: Mutex<usize>,
    /// Mirror of the producer cursor for the consumer (published after the
    /// slot header is initialized).
    head_pos: AtomicUsize,
    /// Consumer cursor. Only the consumer handle advances it.
    tail: AtomicUsize,
    dropped: AtomicU64,
    data_ready: Notify,
}

// SAFETY: the UnsafeCell storage is coordinated by the slot protocol:
// producers write only inside their own reservation (exclusive until
// commit/discard, serialized by `head`), and the consumer reads only
// committed slots below `head_pos` and before `tail` advances past them.
#[allow(unsafe_code)]
unsafe impl Send for RingBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring of (at least) `capacity` bytes plus its consumer
    /// handle. Capacity is rounded up to a multiple of 8.
    ///
    /// # Panics
    ///
    /// A zero capacity is a startup configuration error.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Arc<Self>, RingConsumer) {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let cap = align8(capacity);
        let storage: Box<[UnsafeCell<u64>]> =
            (0..cap / 8).map(|_| UnsafeCell::new(0)).collect();
        let ring = Arc::new(Self {
            storage,
            cap,
            head: Mutex::new(0),
            head_pos: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            data_ready: Notify::new(),
        });
        let consumer = RingConsumer { ring: Arc::clone(&ring) };
        (ring, consumer)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Records dropped because the buffer was full or the request could
    /// never fit. Diagnostic only.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    const fn slot_size(len: usize) -> usize {
        align8(HDR_BYTES + len)
    }

    fn base(&self) -> *mut u8 {
        self.storage.as_ptr().cast_mut().cast::<u8>()
    }

    #[allow(unsafe_code)]
    fn header(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off % HDR_BYTES == 0 && off < self.cap);
        // SAFETY: `off` is 8-aligned and in bounds; the storage is u64-aligned,
        // so the cast to AtomicU32 is well-aligned.
        unsafe { &*self.base().add(off).cast::<AtomicU32>() }
    }

    /// Claim `len` bytes. Returns `None` (and counts a drop) when the
    /// record cannot fit right now (or can never fit). Never blocks on the
    /// consumer.
    pub fn reserve(&self, len: usize) -> Option<Slot<'_>> {
        if len == 0 || len > LEN_MASK as usize {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let total = Self::slot_size(len);

        let mut head = self.head.lock().unwrap();
        let tail = self.tail.load(Ordering::Acquire);
        let mut avail = self.cap - (*head - tail);
        let off = *head % self.cap;
        let contiguous = self.cap - off;

        if total > contiguous {
            // Retire the rest of the buffer with a pad marker and wrap.
            if contiguous + total > avail {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            self.header(off).store(FLAG_PAD, Ordering::Release);
            *head += contiguous;
            self.head_pos.store(*head, Ordering::Release);
            avail -= contiguous;
        }
        if total > avail {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let off = *head % self.cap;
        #[allow(clippy::cast_possible_truncation)]
        self.header(off).store(FLAG_BUSY | len as u32, Ordering::Release);
        *head += total;
        self.head_pos.store(*head, Ordering::Release);
        drop(head);

        Some(Slot { ring: self, header_off: off, len, done: false })
    }
}

/// A reserved slot. Write the record through [`Slot::bytes_mut`], then
/// [`Slot::commit`]. Dropping the slot without committing discards it; the
/// consumer never observes the (possibly partially written) contents.
pub struct Slot<'a> {
    ring: &'a RingBuffer,
    header_off: usize,
    len: usize,
    done: bool,
}

impl Slot<'_> {
    /// The reserved bytes, exactly the length passed to `reserve`.
    #[allow(unsafe_code)]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the payload region belongs exclusively to this reservation
        // until commit/discard, and the consumer skips BUSY slots.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ring.base().add(self.header_off + HDR_BYTES),
                self.len,
            )
        }
    }

    /// Publish the record in FIFO order relative to other commits.
    pub fn commit(mut self) {
        self.finish(0);
    }

    /// Release the reservation without exposing its contents.
    pub fn discard(mut self) {
        self.finish(FLAG_DISCARD);
    }

    fn finish(&mut self, flag: u32) {
        #[allow(clippy::cast_possible_truncation)]
        self.ring
            .header(self.header_off)
            .store(flag | self.len as u32, Ordering::Release);
        self.done = true;
        // Wake the consumer even for discards so the space is reclaimed.
        self.ring.data_ready.notify_one();
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.finish(FLAG_DISCARD);
        }
    }
}

/// Exclusive consumer handle; there is exactly one per ring.
pub struct RingConsumer {
    ring: Arc<RingBuffer>,
}

impl RingConsumer {
    #[must_use]
    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    /// Dispatch every committed record without waiting. Returns the number
    /// dispatched. Used for the final drain pass on shutdown.
    #[allow(unsafe_code)]
    pub fn drain_now<F>(&mut self, f: &mut F) -> usize
    where
        F: FnMut(&[u8]) -> Control,
    {
        let ring = &self.ring;
        let mut tail = ring.tail.load(Ordering::Relaxed);
        let mut n = 0;
        loop {
            let head = ring.head_pos.load(Ordering::Acquire);
            if tail == head {
                break;
            }
            let off = tail % ring.cap;
            let hdr = ring.header(off).load(Ordering::Acquire);
            if hdr & FLAG_BUSY != 0 {
                // Reserved but not yet committed: stop here so records are
                // always observed in commit order.
                break;
            }
            if hdr & FLAG_PAD != 0 {
                tail += ring.cap - off;
                ring.tail.store(tail, Ordering::Release);
                continue;
            }
            let len = (hdr & LEN_MASK) as usize;
            let total = RingBuffer::slot_size(len);
            if hdr & FLAG_DISCARD != 0 {
                tail += total;
                ring.tail.store(tail, Ordering::Release);
                continue;
            }
            // SAFETY: the slot was committed (BUSY cleared with Release) and
            // producers cannot reuse it until `tail` moves past it.
            let bytes = unsafe {
                std::slice::from_raw_parts(ring.base().add(off + HDR_BYTES), len)
            };
            let verdict = f(bytes);
            n += 1;
            tail += total;
            ring.tail.store(tail, Ordering::Release);
            if verdict == Control::Stop {
                break;
            }
        }
        n
    }

    /// Wait up to `timeout` for committed records and dispatch them in
    /// commit order, invoking `f` once per record. The shutdown signal is
    /// observed during the wait and turns the call into
    /// [`Poll::Interrupted`].
    pub async fn poll<F>(&mut self, timeout: Duration, shutdown: &Shutdown, f: &mut F) -> Poll
    where
        F: FnMut(&[u8]) -> Control,
    {
        let deadline = Instant::now() + timeout;
        let ring = Arc::clone(&self.ring);
        loop {
            if shutdown.is_triggered() {
                return Poll::Interrupted;
            }
            // Arm the wakeup before re-checking for data so a commit landing
            // between the check and the wait is never lost.
            let notified = ring.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let n = self.drain_now(f);
            if n > 0 {
                return Poll::Processed(n);
            }

            tokio::select! {
                () = notified => {}
                () = shutdown.triggered() => return Poll::Interrupted,
                () = tokio::time::sleep_until(deadline) => return Poll::TimedOut,
            }
        }
    }
}
