//! Host platform interfaces.
//!
//! The driver is written against a small set of traits describing what it
//! needs from the platform: a SPI peripheral with bounded polled transfers
//! and (optionally) DMA, a chip-select output (plain
//! [`embedded_hal::digital::OutputPin`]), a monotonic millisecond tick, a
//! short-sleep primitive ([`embedded_hal::delay::DelayNs`]), a lock, cache
//! maintenance, and a card-detect input. Single-threaded, cacheless hosts
//! can use the [`NoLock`] / [`NoCache`] / [`SpinFlag`] implementations from
//! this module and supply nothing else.

use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::delay::DelayNs;

// ****************************************************************************
//
// SPI
//
// ****************************************************************************

/// The ways a [`SpiBus`] implementation can fail.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The peripheral did not finish within the caller's bound.
    Timeout,
    /// Any other peripheral-level failure.
    Fault,
}

/// A full-duplex SPI master connected to the card.
///
/// Polled transfers block for at most `timeout_ms` and report expiry as
/// [`BusError::Timeout`]. The `start_*_dma` methods only *start* a transfer:
/// completion must be reported through the [`DmaEvents`] router wired into
/// the peripheral's interrupt handlers, and the implementation must not
/// touch the buffers once it has signalled completion or [`SpiBus::abort`]
/// has returned. Implementations without a DMA engine can return
/// [`BusError::Fault`] from the `start_*_dma` methods; the driver only calls
/// them when DMA was requested at construction.
pub trait SpiBus {
    /// Send `tx`, discarding whatever the card shifts back.
    fn write(&mut self, tx: &[u8], timeout_ms: u32) -> Result<(), BusError>;

    /// Send `tx` while capturing the same number of bytes into `rx`.
    ///
    /// `tx` and `rx` are the same length.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8], timeout_ms: u32) -> Result<(), BusError>;

    /// Start a DMA transmit of `tx`.
    fn start_write_dma(&mut self, tx: &[u8]) -> Result<(), BusError>;

    /// Start a DMA transmit of `tx` with reception into `rx` (same length).
    fn start_transfer_dma(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError>;

    /// Stop an in-flight DMA transfer and return the peripheral to an idle
    /// state. Called when a completion wait expires.
    fn abort(&mut self);
}

// ****************************************************************************
//
// Time
//
// ****************************************************************************

/// A free-running monotonic millisecond tick.
///
/// Wrap-around is fine; all driver arithmetic on the tick is wrapping.
pub trait Clock {
    /// Milliseconds since some arbitrary epoch.
    fn ticks_ms(&self) -> u32;
}

/// A point in time a fixed budget after its creation.
#[derive(Debug, Copy, Clone)]
pub struct Deadline {
    started: u32,
    budget_ms: u32,
}

impl Deadline {
    /// Start a deadline `budget_ms` from now.
    pub fn new<CLK: Clock>(clock: &CLK, budget_ms: u32) -> Deadline {
        Deadline {
            started: clock.ticks_ms(),
            budget_ms,
        }
    }

    /// Has the budget elapsed?
    pub fn expired<CLK: Clock>(&self, clock: &CLK) -> bool {
        clock.ticks_ms().wrapping_sub(self.started) >= self.budget_ms
    }
}

// ****************************************************************************
//
// Locking
//
// ****************************************************************************

/// Mutual exclusion around a whole command/data transaction.
///
/// Acquisition is bounded: a caller that cannot get the lock within
/// `timeout_ms` is told so rather than parked forever. Implementations
/// backed by an RTOS must also refuse acquisition from interrupt context
/// (return `false` immediately), because the driver blocks and an ISR must
/// not.
///
/// # Safety
///
/// An implementation must guarantee that while `acquire` has returned `true`
/// to one context, no other context can also obtain `true` until `release`
/// is called. The driver relies on this for the soundness of sharing a
/// handle between threads.
pub unsafe trait RawBusLock {
    /// Try to take the lock, waiting at most `timeout_ms`.
    fn acquire(&self, timeout_ms: u32) -> bool;

    /// Release a lock previously acquired by this context.
    fn release(&self);
}

/// The lock for builds without an RTOS.
///
/// Acquisition always succeeds and compiles down to nothing. `NoLock` is
/// deliberately `!Sync`: a handle built with it cannot be shared between
/// threads, which is exactly the situation in which skipping the lock is
/// sound.
pub struct NoLock {
    _not_sync: PhantomData<Cell<()>>,
}

impl NoLock {
    /// Create the no-op lock.
    pub const fn new() -> NoLock {
        NoLock {
            _not_sync: PhantomData,
        }
    }
}

impl Default for NoLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawBusLock for NoLock {
    fn acquire(&self, _timeout_ms: u32) -> bool {
        true
    }

    fn release(&self) {}
}

// ****************************************************************************
//
// DMA completion routing
//
// ****************************************************************************

/// A single-slot completion signal, settable from interrupt context.
///
/// The default [`Completion::wait`] is a bounded 1 ms poll on
/// [`Completion::is_complete`] — correct for bare-metal builds, where the
/// flag is flipped by the DMA interrupt underneath the spinning caller.
/// RTOS-backed implementations should pair the flag with a binary semaphore
/// and override `wait` to park the task instead.
pub trait Completion {
    /// Clear the signal before starting a transfer.
    fn reset(&self);

    /// Mark the transfer finished. Safe to call from an ISR.
    fn complete(&self);

    /// Has [`Completion::complete`] been called since the last reset?
    fn is_complete(&self) -> bool;

    /// Block until the signal is set, or `timeout_ms` elapses.
    fn wait<CLK, D>(&self, clock: &CLK, delayer: &mut D, timeout_ms: u32) -> bool
    where
        CLK: Clock,
        D: DelayNs,
    {
        let deadline = Deadline::new(clock, timeout_ms);
        while !self.is_complete() {
            if deadline.expired(clock) {
                return false;
            }
            delayer.delay_ms(1);
        }
        true
    }
}

/// The plain-flag [`Completion`] for builds without an RTOS.
pub struct SpinFlag {
    set: AtomicBool,
}

impl SpinFlag {
    /// Create a cleared flag.
    pub const fn new() -> SpinFlag {
        SpinFlag {
            set: AtomicBool::new(false),
        }
    }
}

impl Default for SpinFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion for SpinFlag {
    fn reset(&self) {
        self.set.store(false, Ordering::Relaxed);
    }

    fn complete(&self) {
        self.set.store(true, Ordering::Release);
    }

    fn is_complete(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }
}

/// Routes SPI DMA completion interrupts to the task waiting on them.
///
/// The SPI peripheral has one set of completion interrupts and no user-data
/// pointer to hang a handle off, so the platform's ISR glue and the driver
/// meet in this object instead: the interrupt handlers call
/// [`tx_complete`](DmaEvents::tx_complete) /
/// [`rx_complete`](DmaEvents::rx_complete) /
/// [`txrx_complete`](DmaEvents::txrx_complete) / [`error`](DmaEvents::error),
/// and the driver waits on the signals inside. One router serves exactly one
/// card handle at a time: [`crate::SdCard::new_with_dma`] claims it and
/// [`crate::SdCard::deinit`] releases it. Multi-card hosts need one router
/// per SPI peripheral.
pub struct DmaEvents<S: Completion> {
    tx: S,
    rx: S,
    claimed: AtomicBool,
}

impl<S: Completion> DmaEvents<S> {
    /// Create a router from a pair of completion signals.
    pub const fn new(tx: S, rx: S) -> DmaEvents<S> {
        DmaEvents {
            tx,
            rx,
            claimed: AtomicBool::new(false),
        }
    }

    /// Transmit-only DMA finished. Call from the tx-complete ISR.
    pub fn tx_complete(&self) {
        self.tx.complete();
    }

    /// Receive DMA finished. Call from the rx-complete ISR.
    pub fn rx_complete(&self) {
        self.rx.complete();
    }

    /// Combined transmit-receive DMA finished. Call from the txrx-complete
    /// ISR.
    pub fn txrx_complete(&self) {
        self.rx.complete();
    }

    /// The peripheral reported an error. Wakes both waiters so whichever
    /// side is blocked returns promptly.
    pub fn error(&self) {
        self.tx.complete();
        self.rx.complete();
    }

    pub(crate) fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    pub(crate) fn tx(&self) -> &S {
        &self.tx
    }

    pub(crate) fn rx(&self) -> &S {
        &self.rx
    }
}

// ****************************************************************************
//
// Cache maintenance
//
// ****************************************************************************

/// Data-cache maintenance for DMA buffers.
///
/// The associated alignment exists so the clean/invalidate ranges can never
/// straddle a cache line that also holds unrelated data; buffers that do not
/// meet it are transferred polled instead (never bounced through a hidden
/// aligned copy).
pub trait CacheOps {
    /// Required start alignment, in bytes, for DMA buffers. The cache line
    /// size on hosts with a data cache, 4 otherwise.
    const DMA_ALIGNMENT: usize;

    /// Write back any dirty lines covering `buf` before the DMA engine reads
    /// from memory.
    fn clean(&mut self, buf: &[u8]);

    /// Drop any lines covering `buf` so later reads come from memory.
    fn invalidate(&mut self, buf: &mut [u8]);
}

/// Cache maintenance for hosts without a data cache: both operations are
/// no-ops and the DMA alignment requirement drops to the bus word size.
pub struct NoCache;

impl CacheOps for NoCache {
    const DMA_ALIGNMENT: usize = 4;

    fn clean(&mut self, _buf: &[u8]) {}

    fn invalidate(&mut self, _buf: &mut [u8]) {}
}

// ****************************************************************************
//
// Card detect
//
// ****************************************************************************

/// A card-detect input.
///
/// Sampled before the lock is taken, concurrently with bus traffic from
/// another task, which is why this is narrower than
/// [`embedded_hal::digital::InputPin`] (whose methods need `&mut self`).
/// Reading a GPIO input register satisfies this trivially.
pub trait DetectPin {
    /// Current electrical level of the pin.
    fn is_high(&self) -> bool;
}

/// Placeholder detect pin for handles without a card-detect switch.
///
/// This type is never constructed; it exists to give the detect type
/// parameter a default.
pub struct NoCardDetect;

impl DetectPin for NoCardDetect {
    fn is_high(&self) -> bool {
        true
    }
}

// ****************************************************************************
//
// Unit Tests
//
// ****************************************************************************


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
