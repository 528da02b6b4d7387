//! Message hand-off between bus interrupt paths and the poll loop.
//!
//! Three primitives cover every crossing:
//!
//! * [`TelemetrySlot`] keeps only the newest value of one message kind. A new
//!   push overwrites anything the reader has not taken yet.
//! * [`TxQueue`] is a bounded FIFO of outbound frames. The drain path peeks,
//!   transmits, and only pops once the controller accepted the frame, so a
//!   busy bus delays frames without losing or reordering them.
//! * [`PayloadCell`] publishes the latest 8-byte payload of a periodic frame.
//!
//! All of them are single-producer/single-consumer; `split` hands out exactly
//! one endpoint per side.

use core::cell::UnsafeCell;
use core::fmt;

use heapless::spsc::{Consumer, Producer, Queue};
use portable_atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::can::{BusError, CanFrame, CanTransmit};

/// Outbound frames each bus queue holds.
pub const TX_QUEUE_DEPTH: usize = 75;
/// Ring slots behind [`TX_QUEUE_DEPTH`]; the ring keeps one slot free.
pub const TX_QUEUE_SLOTS: usize = TX_QUEUE_DEPTH + 1;

const INDEX_MASK: u8 = 0b011;
const FRESH: u8 = 0b100;

/// Overwrite-latest slot built as a triple buffer.
///
/// The writer always fills a buffer the reader cannot see, then swaps it in
/// with one atomic exchange, so a half-written value is never observable.
pub struct TelemetrySlot<T> {
    buffers: [UnsafeCell<T>; 3],
    // Index of the buffer holding the latest published value, plus the FRESH bit.
    back: AtomicU8,
}

// SAFETY: the writer and reader each own a distinct buffer index at all times
// and only exchange ownership through `back`.
unsafe impl<T: Send> Sync for TelemetrySlot<T> {}

impl<T: Copy + Default> TelemetrySlot<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: [
                UnsafeCell::new(T::default()),
                UnsafeCell::new(T::default()),
                UnsafeCell::new(T::default()),
            ],
            back: AtomicU8::new(1),
        }
    }
}

impl<T: Copy + Default> Default for TelemetrySlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> TelemetrySlot<T> {
    /// Splits the slot into its writer and reader halves.
    pub fn split(&mut self) -> (SlotWriter<'_, T>, SlotReader<'_, T>) {
        self.back.store(1, Ordering::Relaxed);
        let slot: &Self = self;
        (
            SlotWriter { slot, index: 0 },
            SlotReader { slot, index: 2 },
        )
    }
}

/// Producer half of a [`TelemetrySlot`].
pub struct SlotWriter<'a, T> {
    slot: &'a TelemetrySlot<T>,
    index: u8,
}

impl<T: Copy> SlotWriter<'_, T> {
    /// Publishes `value`, replacing any value the reader has not taken.
    pub fn push(&mut self, value: T) {
        // SAFETY: `self.index` is owned by the writer until it is exchanged below.
        unsafe {
            *self.slot.buffers[usize::from(self.index)].get() = value;
        }
        let previous = self.slot.back.swap(self.index | FRESH, Ordering::AcqRel);
        self.index = previous & INDEX_MASK;
    }
}

/// Consumer half of a [`TelemetrySlot`].
pub struct SlotReader<'a, T> {
    slot: &'a TelemetrySlot<T>,
    index: u8,
}

impl<T: Copy> SlotReader<'_, T> {
    /// Takes ownership of the newest unread value. Returns `false` when none is pending.
    pub fn pop(&mut self) -> bool {
        if self.slot.back.load(Ordering::Acquire) & FRESH == 0 {
            return false;
        }
        let previous = self.slot.back.swap(self.index, Ordering::AcqRel);
        self.index = previous & INDEX_MASK;
        true
    }

    /// Value taken by the last successful [`pop`](Self::pop).
    #[must_use]
    pub fn output(&self) -> T {
        // SAFETY: `self.index` is owned by the reader; the writer never touches it.
        unsafe { *self.slot.buffers[usize::from(self.index)].get() }
    }

    /// Pops and returns the newest unread value.
    pub fn take(&mut self) -> Option<T> {
        self.pop().then(|| self.output())
    }
}

/// Failure to queue an outbound frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnqueueError {
    /// The queue is at capacity; the frame was dropped.
    Full,
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full => f.write_str("transmit queue full"),
        }
    }
}

/// Result of one drain attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DrainOutcome {
    /// The head frame was accepted and removed.
    Sent,
    /// The bus refused the head frame; it stays queued.
    Retry(BusError),
    /// Nothing to send; the drain trigger is disarmed.
    Idle,
}

/// Bounded transmit FIFO with an armed flag standing in for the TX-ready interrupt enable.
///
/// `N` counts ring slots, so the queue holds `N - 1` frames.
pub struct TxQueue<const N: usize = TX_QUEUE_SLOTS> {
    frames: Queue<CanFrame, N>,
    armed: AtomicBool,
}

impl<const N: usize> TxQueue<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frames: Queue::new(),
            armed: AtomicBool::new(false),
        }
    }

    pub fn split(&mut self) -> (TxProducer<'_>, TxConsumer<'_>) {
        let Self { frames, armed } = self;
        let armed: &AtomicBool = armed;
        let (producer, consumer) = frames.split();
        (
            TxProducer {
                inner: producer,
                armed,
            },
            TxConsumer {
                inner: consumer,
                armed,
            },
        )
    }
}

impl<const N: usize> Default for TxQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Enqueue side of a [`TxQueue`].
pub struct TxProducer<'a> {
    inner: Producer<'a, CanFrame>,
    armed: &'a AtomicBool,
}

impl TxProducer<'_> {
    /// Queues `frame` and arms the drain trigger.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Full`] and drops the frame when the queue is full.
    pub fn push(&mut self, frame: CanFrame) -> Result<(), EnqueueError> {
        self.inner
            .enqueue(frame)
            .map_err(|_| EnqueueError::Full)?;
        self.armed.store(true, Ordering::Release);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// Drain side of a [`TxQueue`].
pub struct TxConsumer<'a> {
    inner: Consumer<'a, CanFrame>,
    armed: &'a AtomicBool,
}

impl TxConsumer<'_> {
    #[must_use]
    pub fn peek(&self) -> Option<&CanFrame> {
        self.inner.peek()
    }

    pub fn pop(&mut self) -> Option<CanFrame> {
        self.inner.dequeue()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the producer has queued frames since the last idle drain.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Attempts to transmit the head frame, popping it only when `bus` accepts it.
    pub fn drain_one<B>(&mut self, bus: &mut B) -> DrainOutcome
    where
        B: CanTransmit + ?Sized,
    {
        if self.inner.peek().is_none() {
            self.armed.store(false, Ordering::Release);
            // A push may have landed between the peek and the disarm.
            if self.inner.peek().is_none() {
                return DrainOutcome::Idle;
            }
            self.armed.store(true, Ordering::Release);
        }

        let Some(frame) = self.inner.peek() else {
            return DrainOutcome::Idle;
        };
        match bus.transmit(frame) {
            Ok(()) => {
                let _ = self.inner.dequeue();
                DrainOutcome::Sent
            }
            Err(error) => DrainOutcome::Retry(error),
        }
    }
}

/// Latest-value cell for one 8-byte payload, plus a count of frames dropped
/// while publishing it.
pub struct PayloadCell {
    bytes: AtomicU64,
    dropped: AtomicU32,
}

impl PayloadCell {
    #[must_use]
    pub const fn new(initial: [u8; 8]) -> Self {
        Self {
            bytes: AtomicU64::new(u64::from_le_bytes(initial)),
            dropped: AtomicU32::new(0),
        }
    }

    pub fn store(&self, payload: [u8; 8]) {
        self.bytes
            .store(u64::from_le_bytes(payload), Ordering::Release);
    }

    #[must_use]
    pub fn load(&self) -> [u8; 8] {
        self.bytes.load(Ordering::Acquire).to_le_bytes()
    }

    pub fn note_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}
