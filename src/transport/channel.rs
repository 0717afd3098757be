//! Lock-free single-producer/single-consumer byte ring, one per CPU.
//!
//! Grounded on the head/tail `AtomicU64` ring buffer in
//! `Thaumy-perf-event-open`'s `src/sample/rb/mod.rs`: a producer advances
//! `head` only after the bytes it wrote are visible, a consumer advances
//! `tail` only after it has copied out what it read, and the two never
//! touch each other's cursor except to load it. Unlike a `perf_event_open`
//! ring buffer — which the kernel always writes to, overwriting unread data
//! on overflow — this channel's producer checks free space up front and
//! drops the newest frame on overflow (§4.4: "producers never block").

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Fixed-capacity byte ring shared between one producer and one consumer.
///
/// Safety: `buf` is only ever written by the producer in the byte range
/// `[head, head + len)` (mod `capacity`), which `try_push` has already
/// proven is disjoint from the unread range `[tail, head)` the consumer may
/// be reading. The consumer only reads `[tail, tail + len)`, which the
/// producer never touches until `tail` has advanced past it. This makes the
/// shared `UnsafeCell<u8>` slice race-free despite looking like a plain
/// shared mutable buffer.
pub struct RingChannel {
    capacity: u64,
    buf: Box<[UnsafeCell<u8>]>,
    head: AtomicU64,
    tail: AtomicU64,
    dropped: AtomicU64,
}

unsafe impl Sync for RingChannel {}

impl RingChannel {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring channel capacity must be nonzero");
        let buf = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        Self {
            capacity: capacity as u64,
            buf,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) {
        let cap = self.capacity;
        for (i, b) in bytes.iter().enumerate() {
            let idx = (offset + i as u64) % cap;
            unsafe { *self.buf[idx as usize].get() = *b };
        }
    }

    fn read_at(&self, offset: u64, out: &mut [u8]) {
        let cap = self.capacity;
        for (i, b) in out.iter_mut().enumerate() {
            let idx = (offset + i as u64) % cap;
            *b = unsafe { *self.buf[idx as usize].get() };
        }
    }

    /// Producer-side: writes `bytes` as one frame if there is room, dropping
    /// (and counting) it otherwise. Only safe to call from the single
    /// producer thread for this channel.
    fn try_push(&self, bytes: &[u8]) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let used = head - tail;
        let free = self.capacity - used;
        if bytes.len() as u64 > free {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.write_at(head, bytes);
        self.head.store(head + bytes.len() as u64, Ordering::Release);
        true
    }

    /// Consumer-side: pops the next frame into `out`, returning `true` if
    /// one was available. Only safe to call from the single consumer thread
    /// for this channel.
    fn try_pop(&self, out: &mut Vec<u8>) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if head == tail {
            return false;
        }
        let mut size_buf = [0u8; 4];
        self.read_at(tail, &mut size_buf);
        let size = u32::from_le_bytes(size_buf) as usize;

        out.resize(size, 0);
        self.read_at(tail, out);
        self.tail.store(tail + size as u64, Ordering::Release);
        true
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Relaxed)
    }
}

/// The write half of a [`RingChannel`], owned by the sampling coordinator's
/// per-CPU worker.
#[derive(Clone)]
pub struct Producer {
    channel: Arc<RingChannel>,
}

impl Producer {
    pub(super) fn new(channel: Arc<RingChannel>) -> Self {
        Self { channel }
    }

    /// Encodes and pushes `msg`. Returns `false` if it was dropped for lack
    /// of space.
    pub fn push(&self, msg: &super::Message) -> bool {
        let mut buf = Vec::with_capacity(64);
        msg.encode(&mut buf);
        self.channel.try_push(&buf)
    }

    pub fn dropped(&self) -> u64 {
        self.channel.dropped()
    }
}

/// The read half of a [`RingChannel`], owned by whatever drains events out
/// of the engine (the administrative dump path, a test harness, or an
/// external sink).
#[derive(Clone)]
pub struct Consumer {
    channel: Arc<RingChannel>,
    scratch: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl Consumer {
    pub(super) fn new(channel: Arc<RingChannel>) -> Self {
        Self {
            channel,
            scratch: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Pops and decodes the next message in emission order (ETP-O), or
    /// `None` if the channel is currently empty.
    pub fn poll(&self) -> Option<super::Message> {
        let mut scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
        if !self.channel.try_pop(&mut scratch) {
            return None;
        }
        super::Message::decode(&scratch).map(|(msg, _)| msg)
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Message;

    fn metadata(ts: u64, pid: u32) -> Message {
        Message::TaskMetadata {
            timestamp_ns: ts,
            pid,
            comm: *b"proc\0\0\0\0\0\0\0\0\0\0\0\0",
            cgroup_id: 1,
        }
    }

    #[test]
    fn pushed_messages_are_popped_in_order() {
        let channel = Arc::new(RingChannel::new(1024));
        let producer = Producer::new(Arc::clone(&channel));
        let consumer = Consumer::new(channel);

        for i in 0..5u32 {
            assert!(producer.push(&metadata(i as u64, i)));
        }

        for i in 0..5u32 {
            let msg = consumer.poll().expect("message should be present");
            assert_eq!(msg.timestamp_ns(), i as u64);
        }
        assert!(consumer.poll().is_none());
    }

    #[test]
    fn overflow_drops_newest_and_is_counted() {
        let channel = Arc::new(RingChannel::new(32));
        let producer = Producer::new(Arc::clone(&channel));
        let consumer = Consumer::new(channel);

        let mut pushed = 0;
        let mut refused = 0;
        for i in 0..20u32 {
            if producer.push(&metadata(i as u64, i)) {
                pushed += 1;
            } else {
                refused += 1;
            }
        }
        assert!(refused > 0);
        assert_eq!(producer.dropped(), refused as u64);

        let mut drained = 0;
        while consumer.poll().is_some() {
            drained += 1;
        }
        assert_eq!(drained, pushed);
    }
}
