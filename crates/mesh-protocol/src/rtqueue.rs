//! Lock-free SPSC queue feeding local MIDI input into the router task.
//!
//! The platform MIDI callback runs on a real-time thread and must never
//! block on network I/O or take a lock. Each local input port owns the
//! producer half of one of these queues; the router's input pump owns the
//! consumer half and drains it asynchronously.
//!
//! Design:
//!   - All slots pre-allocated; no heap traffic after creation
//!   - Head and tail on separate cache lines to avoid false sharing
//!   - Bounded; when full the oldest message is dropped and counted —
//!     on a real-time path losing old data beats blocking
//!   - `tokio::sync::Notify` wakes the async consumer
//!
//! Safety: SPSC only. One thread pushes, one task pops.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::identity::DeviceId;
use crate::MAX_PAYLOAD;

/// Maximum MIDI message size per slot; larger SysEx is truncated.
pub const SLOT_SIZE: usize = MAX_PAYLOAD;

#[repr(C)]
struct Slot {
    data: [u8; SLOT_SIZE],
    len: u16,
    device: DeviceId,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            data: [0u8; SLOT_SIZE],
            len: 0,
            device: 0,
        }
    }
}

/// Cache line size for padding.
const CACHE_LINE: usize = 64;

#[repr(C)]
struct Inner {
    /// Write position (producer only)
    head: AtomicUsize,
    _pad_head: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],

    /// Read position (consumer only)
    tail: AtomicUsize,
    _pad_tail: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],

    /// Messages lost to overflow
    dropped: AtomicU64,

    slots: Box<[UnsafeCell<Slot>]>,
    capacity: usize,
}

// SAFETY: SPSC contract — head is only written by the producer, tail by the
// consumer; the atomics provide the required ordering.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "capacity must be a power of two"
        );

        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(UnsafeCell::new(Slot::default()));
        }

        Self {
            head: AtomicUsize::new(0),
            _pad_head: [0u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            tail: AtomicUsize::new(0),
            _pad_tail: [0u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            dropped: AtomicU64::new(0),
            slots: slots.into_boxed_slice(),
            capacity,
        }
    }

    /// SAFETY: producer thread only.
    #[inline]
    fn push(&self, device: DeviceId, data: &[u8]) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= self.capacity {
            return false;
        }

        let idx = head & (self.capacity - 1);
        let len = data.len().min(SLOT_SIZE);

        // SAFETY: sole producer; the consumer only reads at `tail`, which
        // is behind `head` here.
        unsafe {
            let slot = &mut *self.slots[idx].get();
            slot.data[..len].copy_from_slice(&data[..len]);
            slot.len = len as u16;
            slot.device = device;
        }

        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// SAFETY: consumer task only.
    #[inline]
    fn pop(&self, buf: &mut [u8; SLOT_SIZE]) -> Option<(DeviceId, usize)> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        let idx = tail & (self.capacity - 1);

        // SAFETY: sole consumer; the producer has moved past this slot.
        let (device, len) = unsafe {
            let slot = &*self.slots[idx].get();
            let len = slot.len as usize;
            buf[..len].copy_from_slice(&slot.data[..len]);
            (slot.device, len)
        };

        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some((device, len))
    }

    #[inline]
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }
}

/// Producer half. Lives on the MIDI callback thread.
pub struct InputProducer {
    inner: Arc<Inner>,
    notify: Arc<tokio::sync::Notify>,
}

/// Consumer half. Drained by the router's input pump.
pub struct InputConsumer {
    inner: Arc<Inner>,
    notify: Arc<tokio::sync::Notify>,
}

/// Create an input queue pair. Capacity must be a power of two.
pub fn input_queue(capacity: usize) -> (InputProducer, InputConsumer) {
    let inner = Arc::new(Inner::new(capacity));
    let notify = Arc::new(tokio::sync::Notify::new());

    (
        InputProducer {
            inner: Arc::clone(&inner),
            notify: Arc::clone(&notify),
        },
        InputConsumer { inner, notify },
    )
}

impl InputProducer {
    /// Enqueue a message, dropping the oldest if the queue is full.
    /// Never blocks; safe on the real-time callback thread.
    #[inline]
    pub fn push(&self, device: DeviceId, data: &[u8]) {
        if !self.inner.push(device, data) {
            // Full — advance tail to make room (drop oldest) and retry
            let tail = self.inner.tail.load(Ordering::Relaxed);
            self.inner
                .tail
                .store(tail.wrapping_add(1), Ordering::Release);
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = self.inner.push(device, data);
        }
        self.notify.notify_one();
    }

    /// Messages lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl InputConsumer {
    /// Try to pop without waiting.
    #[inline]
    pub fn try_pop(&self, buf: &mut [u8; SLOT_SIZE]) -> Option<(DeviceId, usize)> {
        self.inner.pop(buf)
    }

    /// Wait for the next message.
    pub async fn pop(&self, buf: &mut [u8; SLOT_SIZE]) -> (DeviceId, usize) {
        loop {
            if let Some(msg) = self.inner.pop(buf) {
                return msg;
            }
            self.notify.notified().await;
        }
    }

    /// Messages currently queued.
    #[inline]
    pub fn available(&self) -> usize {
        self.inner.len()
    }
}
