//! Implements the BlockDevice trait for an SD/SDHC card in SPI mode.
//!
//! This module owns the public handle: entry checks, card-detect sampling,
//! locking, the retry policy and the diagnostic counters. The wire protocol
//! itself lives in [`spi`](self::spi) (private) and the protocol constants in
//! [`proto`].

pub mod proto;
mod spi;

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx};
use crate::host::{
    CacheOps, Clock, Completion, DetectPin, DmaEvents, NoCardDetect, RawBusLock, SpiBus, SpinFlag,
};
use crate::{debug, warn};
use spi::SpiSdInner;

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// The ways in which operations on an [`SdCard`] can fail.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// A bus-level or protocol-level failure. Also returned for data
    /// operations attempted before a successful [`SdCard::init_card`].
    Bus,
    /// A bounded wait expired: no response, no data token, the card never
    /// released its busy line, or a DMA transfer had to be aborted.
    Timeout,
    /// The handle lock could not be taken within its timeout, or the call
    /// came from interrupt context.
    Busy,
    /// Invalid arguments (an empty block slice).
    Param,
    /// Card-detect reports an empty socket.
    NoMedia,
    /// The card flagged a CRC mismatch for data it received.
    Crc,
    /// The card rejected written data.
    Write,
    /// The operation is not available on this card or build.
    Unsupported,
}

fn status_code(result: &Result<(), Error>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(Error::Bus) => 1,
        Err(Error::Timeout) => 2,
        Err(Error::Busy) => 3,
        Err(Error::Param) => 4,
        Err(Error::NoMedia) => 5,
        Err(Error::Crc) => 6,
        Err(Error::Write) => 7,
        Err(Error::Unsupported) => 8,
    }
}

fn status_from_code(code: u8) -> Result<(), Error> {
    match code {
        1 => Err(Error::Bus),
        2 => Err(Error::Timeout),
        3 => Err(Error::Busy),
        4 => Err(Error::Param),
        5 => Err(Error::NoMedia),
        6 => Err(Error::Crc),
        7 => Err(Error::Write),
        8 => Err(Error::Unsupported),
        _ => Ok(()),
    }
}

/// Driver timeouts and transfer policy, with datasheet-derived defaults.
///
/// All bounds are in milliseconds against the host's monotonic tick.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// Use DMA for whole-block transfers when the buffer alignment allows
    /// it. Needs a [`DmaEvents`] router, i.e. [`SdCard::new_with_dma`].
    pub use_dma: bool,
    /// Per-call bound for polled SPI transfers.
    pub spi_io_timeout_ms: u32,
    /// Bound for the wait-ready preamble in front of every command.
    pub cmd_timeout_ms: u32,
    /// Bound for a start-of-block token to appear.
    pub data_token_timeout_ms: u32,
    /// Bound for the card to finish programming after written data.
    pub write_busy_timeout_ms: u32,
    /// Bound for each polling stage of the initialization handshake.
    pub init_timeout_ms: u32,
    /// Bound for a DMA transfer to complete before it is aborted.
    pub dma_timeout_ms: u32,
    /// Bound for taking the handle lock.
    pub mutex_timeout_ms: u32,
    /// Extra attempts for a failed single-block transfer. Multi-block
    /// transfers are never retried: the card has committed state that only
    /// a stop command may terminate.
    pub max_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            use_dma: false,
            spi_io_timeout_ms: 50,
            cmd_timeout_ms: 100,
            data_token_timeout_ms: 200,
            write_busy_timeout_ms: 500,
            init_timeout_ms: 1000,
            dma_timeout_ms: 500,
            mutex_timeout_ms: 1000,
            max_retries: 2,
        }
    }
}

/// A snapshot of the driver's diagnostic counters.
///
/// Counters are sampled without taking the handle lock, so a snapshot taken
/// while an operation is in flight may split across fields. That is the
/// intended, diagnostics-grade contract.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Read operations that passed entry checks.
    pub read_ops: u32,
    /// Write operations that passed entry checks.
    pub write_ops: u32,
    /// Blocks requested by read operations.
    pub read_blocks: u32,
    /// Blocks submitted by write operations.
    pub write_blocks: u32,
    /// Calls to [`SdCard::init_card`] that reached the wire.
    pub init_attempts: u32,
    /// Single-block attempts repeated after a failure.
    pub retries: u32,
    /// Statuses recorded as anything other than OK.
    pub error_count: u32,
    /// The subset of `error_count` that were timeouts.
    pub timeout_count: u32,
}

#[derive(Default)]
struct Counters {
    read_ops: AtomicU32,
    write_ops: AtomicU32,
    read_blocks: AtomicU32,
    write_blocks: AtomicU32,
    init_attempts: AtomicU32,
    retries: AtomicU32,
    error_count: AtomicU32,
    timeout_count: AtomicU32,
}

impl Counters {
    fn snapshot(&self) -> Stats {
        Stats {
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            read_blocks: self.read_blocks.load(Ordering::Relaxed),
            write_blocks: self.write_blocks.load(Ordering::Relaxed),
            init_attempts: self.init_attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.read_ops.store(0, Ordering::Relaxed);
        self.write_ops.store(0, Ordering::Relaxed);
        self.read_blocks.store(0, Ordering::Relaxed);
        self.write_blocks.store(0, Ordering::Relaxed);
        self.init_attempts.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
        self.timeout_count.store(0, Ordering::Relaxed);
    }
}

struct CardDetect<CD: DetectPin> {
    pin: CD,
    active_low: bool,
}

impl<CD: DetectPin> CardDetect<CD> {
    fn card_present(&self) -> bool {
        let level = self.pin.is_high();
        if self.active_low {
            !level
        } else {
            level
        }
    }
}

// ****************************************************************************
//
// The handle
//
// ****************************************************************************

/// Driver handle for an SD or SDHC card on a SPI bus.
///
/// One handle per card. All data operations go through the handle lock `L`,
/// so a handle built with a real lock can be shared by reference between the
/// tasks of an RTOS; a handle built with [`crate::host::NoLock`] cannot be
/// shared at all (it is `!Sync`), which keeps the lockless build sound.
///
/// The handle starts unbound to any card state: call
/// [`init_card`](SdCard::init_card) to run the on-wire handshake before any
/// data operation. An operation that finds the card absent (via the optional
/// card-detect pin) clears the initialized state again.
pub struct SdCard<'d, SPI, CS, CLK, D, L, C, CD = NoCardDetect, S = SpinFlag>
where
    SPI: SpiBus,
    CS: OutputPin,
    CLK: Clock,
    D: DelayNs,
    L: RawBusLock,
    C: CacheOps,
    CD: DetectPin,
    S: Completion,
{
    inner: UnsafeCell<SpiSdInner<'d, SPI, CS, CLK, D, C, S>>,
    lock: L,
    detect: Option<CardDetect<CD>>,
    mutex_timeout_ms: u32,
    initialized: AtomicBool,
    sdhc: AtomicBool,
    capacity_blocks: AtomicU32,
    last_status: AtomicU8,
    counters: Counters,
}

// The UnsafeCell contents only move between threads under the lock, whose
// implementation promises mutual exclusion; everything reachable without the
// lock is atomic or itself Sync.
unsafe impl<'d, SPI, CS, CLK, D, L, C, CD, S> Sync for SdCard<'d, SPI, CS, CLK, D, L, C, CD, S>
where
    SPI: SpiBus + Send,
    CS: OutputPin + Send,
    CLK: Clock + Send,
    D: DelayNs + Send,
    L: RawBusLock + Sync,
    C: CacheOps + Send,
    CD: DetectPin + Sync,
    S: Completion + Sync,
{
}

struct LockGuard<'a, L: RawBusLock>(&'a L);

impl<L: RawBusLock> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl<'d, SPI, CS, CLK, D, L, C> SdCard<'d, SPI, CS, CLK, D, L, C, NoCardDetect, SpinFlag>
where
    SPI: SpiBus,
    CS: OutputPin,
    CLK: Clock,
    D: DelayNs,
    L: RawBusLock,
    C: CacheOps,
{
    /// Create a handle that uses polled transfers only.
    ///
    /// The card is not touched; call [`init_card`](SdCard::init_card) to run
    /// the handshake.
    pub fn new(spi: SPI, cs: CS, clock: CLK, delayer: D, lock: L, cache: C, config: Config) -> Self {
        Self::build(spi, cs, clock, delayer, lock, cache, None, config)
    }
}

impl<'d, SPI, CS, CLK, D, L, C, S> SdCard<'d, SPI, CS, CLK, D, L, C, NoCardDetect, S>
where
    SPI: SpiBus,
    CS: OutputPin,
    CLK: Clock,
    D: DelayNs,
    L: RawBusLock,
    C: CacheOps,
    S: Completion,
{
    /// Create a handle that may use DMA for whole-block transfers.
    ///
    /// Claims `events` as this handle's completion router; the claim is held
    /// until [`deinit`](SdCard::deinit) and a second handle trying to claim
    /// the same router gets `Error::Busy`. The platform's SPI interrupt glue
    /// must already be dispatching into `events`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_with_dma(
        spi: SPI,
        cs: CS,
        clock: CLK,
        delayer: D,
        lock: L,
        cache: C,
        events: &'d DmaEvents<S>,
        config: Config,
    ) -> Result<Self, Error> {
        if !events.claim() {
            return Err(Error::Busy);
        }
        Ok(Self::build(
            spi,
            cs,
            clock,
            delayer,
            lock,
            cache,
            Some(events),
            config,
        ))
    }
}

impl<'d, SPI, CS, CLK, D, L, C, CD, S> SdCard<'d, SPI, CS, CLK, D, L, C, CD, S>
where
    SPI: SpiBus,
    CS: OutputPin,
    CLK: Clock,
    D: DelayNs,
    L: RawBusLock,
    C: CacheOps,
    CD: DetectPin,
    S: Completion,
{
    #[allow(clippy::too_many_arguments)]
    fn build(
        spi: SPI,
        cs: CS,
        clock: CLK,
        delayer: D,
        lock: L,
        cache: C,
        events: Option<&'d DmaEvents<S>>,
        config: Config,
    ) -> Self {
        SdCard {
            mutex_timeout_ms: config.mutex_timeout_ms,
            inner: UnsafeCell::new(SpiSdInner::new(
                spi, cs, clock, delayer, cache, events, config,
            )),
            lock,
            detect: None,
            initialized: AtomicBool::new(false),
            sdhc: AtomicBool::new(false),
            capacity_blocks: AtomicU32::new(0),
            last_status: AtomicU8::new(0),
            counters: Counters::default(),
        }
    }

    /// Bind an optional card-detect switch to the handle.
    ///
    /// `active_low` picks the polarity: `true` means a low pin level reports
    /// a card present. Builder-style, so it must run before the handle is
    /// shared.
    pub fn with_card_detect<P: DetectPin>(
        self,
        pin: P,
        active_low: bool,
    ) -> SdCard<'d, SPI, CS, CLK, D, L, C, P, S> {
        SdCard {
            inner: self.inner,
            lock: self.lock,
            detect: Some(CardDetect { pin, active_low }),
            mutex_timeout_ms: self.mutex_timeout_ms,
            initialized: self.initialized,
            sdhc: self.sdhc,
            capacity_blocks: self.capacity_blocks,
            last_status: self.last_status,
            counters: self.counters,
        }
    }

    // ************************************************************************
    //
    // Envelope plumbing
    //
    // ************************************************************************

    /// True when a card sits in the socket, or no card-detect is configured.
    pub fn is_card_present(&self) -> bool {
        match &self.detect {
            Some(cd) => cd.card_present(),
            None => true,
        }
    }

    /// Card-detect fast path, run before taking the lock. Observing an
    /// empty socket invalidates the card state.
    fn check_media(&self) -> Result<(), Error> {
        if self.is_card_present() {
            Ok(())
        } else {
            self.initialized.store(false, Ordering::Relaxed);
            Err(Error::NoMedia)
        }
    }

    fn take_lock(&self) -> Result<LockGuard<'_, L>, Error> {
        if self.lock.acquire(self.mutex_timeout_ms) {
            Ok(LockGuard(&self.lock))
        } else {
            Err(Error::Busy)
        }
    }

    /// Exclusive access to the wire engine.
    ///
    /// Sound because the caller proves it holds the lock, and the lock's
    /// contract is mutual exclusion over everything in the cell.
    #[allow(clippy::mut_from_ref)]
    fn engine(&self, _guard: &LockGuard<'_, L>) -> &mut SpiSdInner<'d, SPI, CS, CLK, D, C, S> {
        unsafe { &mut *self.inner.get() }
    }

    /// Every status handed to a caller passes through here first.
    fn record(&self, result: Result<(), Error>) -> Result<(), Error> {
        self.last_status.store(status_code(&result), Ordering::Relaxed);
        if let Err(e) = result {
            self.counters.error_count.fetch_add(1, Ordering::Relaxed);
            if e == Error::Timeout {
                self.counters.timeout_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn block_address(&self, sector: BlockIdx) -> u32 {
        if self.sdhc.load(Ordering::Relaxed) {
            sector.0
        } else {
            sector.0 * Block::LEN_U32
        }
    }

    /// Run a single-block transfer with the retry policy: every failed
    /// attempt is recorded, and attempts after the first are preceded by a
    /// 1 ms backoff.
    fn run_retried<F>(
        &self,
        inner: &mut SpiSdInner<'d, SPI, CS, CLK, D, C, S>,
        mut op: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&mut SpiSdInner<'d, SPI, CS, CLK, D, C, S>) -> Result<(), Error>,
    {
        let max_retries = inner.config().max_retries;
        let mut attempt = 0;
        loop {
            match op(&mut *inner) {
                Ok(()) => return self.record(Ok(())),
                Err(e) => {
                    let _ = self.record(Err(e));
                    if attempt >= max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    warn!("Retrying block transfer, attempt {}", attempt);
                    inner.backoff();
                }
            }
        }
    }

    // ************************************************************************
    //
    // Public operations
    //
    // ************************************************************************

    /// Run the on-wire initialization handshake: idle clocks, CMD0, CMD8,
    /// the ACMD41 loop, CMD58 (CCS), CMD16 for byte-addressed cards and a
    /// CSD read for the capacity.
    ///
    /// The bus must be running at 400 kHz or below; the caller may raise the
    /// clock once this returns `Ok`.
    pub fn init_card(&self) -> Result<(), Error> {
        if let Err(e) = self.check_media() {
            return self.record(Err(e));
        }
        self.counters.init_attempts.fetch_add(1, Ordering::Relaxed);
        let guard = match self.take_lock() {
            Ok(guard) => guard,
            Err(e) => return self.record(Err(e)),
        };
        self.initialized.store(false, Ordering::Relaxed);
        let result = self.engine(&guard).initialize();
        drop(guard);
        match result {
            Ok(info) => {
                self.sdhc.store(info.sdhc, Ordering::Relaxed);
                self.capacity_blocks
                    .store(info.capacity_blocks, Ordering::Relaxed);
                self.initialized.store(true, Ordering::Relaxed);
                self.record(Ok(()))
            }
            Err(e) => self.record(Err(e)),
        }
    }

    /// Read `blocks.len()` blocks starting at `start`.
    ///
    /// A single-block read uses READ_SINGLE_BLOCK and is retried per
    /// [`Config::max_retries`]; longer reads use READ_MULTIPLE_BLOCK with no
    /// retry.
    pub fn read_blocks(&self, blocks: &mut [Block], start: BlockIdx) -> Result<(), Error> {
        if blocks.is_empty() {
            return self.record(Err(Error::Param));
        }
        if let Err(e) = self.check_media() {
            return self.record(Err(e));
        }
        let guard = match self.take_lock() {
            Ok(guard) => guard,
            Err(e) => return self.record(Err(e)),
        };
        if !self.initialized.load(Ordering::Relaxed) {
            return self.record(Err(Error::Bus));
        }
        self.counters.read_ops.fetch_add(1, Ordering::Relaxed);
        self.counters
            .read_blocks
            .fetch_add(blocks.len() as u32, Ordering::Relaxed);
        let address = self.block_address(start);
        let inner = self.engine(&guard);
        if blocks.len() == 1 {
            self.run_retried(inner, |inner| inner.read_single(&mut blocks[0], address))
        } else {
            let result = inner.read_multi(blocks, address);
            self.record(result)
        }
    }

    /// Write `blocks.len()` blocks starting at `start`.
    ///
    /// A single-block write uses WRITE_BLOCK and is retried per
    /// [`Config::max_retries`]; longer writes use WRITE_MULTIPLE_BLOCK with
    /// no retry.
    pub fn write_blocks(&self, blocks: &[Block], start: BlockIdx) -> Result<(), Error> {
        if blocks.is_empty() {
            return self.record(Err(Error::Param));
        }
        if let Err(e) = self.check_media() {
            return self.record(Err(e));
        }
        let guard = match self.take_lock() {
            Ok(guard) => guard,
            Err(e) => return self.record(Err(e)),
        };
        if !self.initialized.load(Ordering::Relaxed) {
            return self.record(Err(Error::Bus));
        }
        self.counters.write_ops.fetch_add(1, Ordering::Relaxed);
        self.counters
            .write_blocks
            .fetch_add(blocks.len() as u32, Ordering::Relaxed);
        let address = self.block_address(start);
        let inner = self.engine(&guard);
        if blocks.len() == 1 {
            self.run_retried(inner, |inner| inner.write_single(&blocks[0], address))
        } else {
            let result = inner.write_multi(blocks, address);
            self.record(result)
        }
    }

    /// Read with READ_MULTIPLE_BLOCK even for a single block. No retry.
    pub fn read_blocks_multi(&self, blocks: &mut [Block], start: BlockIdx) -> Result<(), Error> {
        if blocks.is_empty() {
            return self.record(Err(Error::Param));
        }
        if let Err(e) = self.check_media() {
            return self.record(Err(e));
        }
        let guard = match self.take_lock() {
            Ok(guard) => guard,
            Err(e) => return self.record(Err(e)),
        };
        if !self.initialized.load(Ordering::Relaxed) {
            return self.record(Err(Error::Bus));
        }
        self.counters.read_ops.fetch_add(1, Ordering::Relaxed);
        self.counters
            .read_blocks
            .fetch_add(blocks.len() as u32, Ordering::Relaxed);
        let address = self.block_address(start);
        let result = self.engine(&guard).read_multi(blocks, address);
        self.record(result)
    }

    /// Write with WRITE_MULTIPLE_BLOCK even for a single block. No retry.
    pub fn write_blocks_multi(&self, blocks: &[Block], start: BlockIdx) -> Result<(), Error> {
        if blocks.is_empty() {
            return self.record(Err(Error::Param));
        }
        if let Err(e) = self.check_media() {
            return self.record(Err(e));
        }
        let guard = match self.take_lock() {
            Ok(guard) => guard,
            Err(e) => return self.record(Err(e)),
        };
        if !self.initialized.load(Ordering::Relaxed) {
            return self.record(Err(Error::Bus));
        }
        self.counters.write_ops.fetch_add(1, Ordering::Relaxed);
        self.counters
            .write_blocks
            .fetch_add(blocks.len() as u32, Ordering::Relaxed);
        let address = self.block_address(start);
        let result = self.engine(&guard).write_multi(blocks, address);
        self.record(result)
    }

    /// Wait until the card has finished programming any outstanding data.
    ///
    /// Returns `Error::Timeout` if the card holds its busy line past
    /// [`Config::write_busy_timeout_ms`].
    pub fn sync(&self) -> Result<(), Error> {
        if !self.initialized.load(Ordering::Relaxed) {
            return self.record(Err(Error::Bus));
        }
        if let Err(e) = self.check_media() {
            return self.record(Err(e));
        }
        let guard = match self.take_lock() {
            Ok(guard) => guard,
            Err(e) => return self.record(Err(e)),
        };
        let result = self.engine(&guard).flush_busy();
        drop(guard);
        self.record(result)
    }

    // ************************************************************************
    //
    // Getters and teardown
    //
    // ************************************************************************

    /// Is the card high-capacity (block-addressed)? Meaningful after
    /// [`init_card`](SdCard::init_card).
    pub fn is_sdhc(&self) -> bool {
        self.sdhc.load(Ordering::Relaxed)
    }

    /// Has the handshake completed since the last power-up or card change?
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Relaxed)
    }

    /// Card capacity in 512-byte blocks; zero when the CSD was unreadable.
    pub fn block_count(&self) -> BlockCount {
        BlockCount(self.capacity_blocks.load(Ordering::Relaxed))
    }

    /// The outcome of the most recently recorded operation.
    pub fn last_status(&self) -> Result<(), Error> {
        status_from_code(self.last_status.load(Ordering::Relaxed))
    }

    /// Snapshot the diagnostic counters.
    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// Zero the diagnostic counters.
    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Tear the handle down, releasing its claim on the DMA completion
    /// router (if any). Consuming the handle makes this safe after any
    /// failure and impossible to repeat.
    pub fn deinit(mut self) {
        if let Some(events) = self.inner.get_mut().events() {
            events.release();
        }
    }
}

impl<'d, SPI, CS, CLK, D, L, C, CD, S> BlockDevice for SdCard<'d, SPI, CS, CLK, D, L, C, CD, S>
where
    SPI: SpiBus,
    CS: OutputPin,
    CLK: Clock,
    D: DelayNs,
    L: RawBusLock,
    C: CacheOps,
    CD: DetectPin,
    S: Completion,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        debug!("Read {} blocks @ {}", blocks.len(), start_block_idx.0);
        self.read_blocks(blocks, start_block_idx)
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        debug!("Writing {} blocks @ {}", blocks.len(), start_block_idx.0);
        self.write_blocks(blocks, start_block_idx)
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        if !self.is_initialized() {
            return Err(Error::Bus);
        }
        Ok(self.block_count())
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
