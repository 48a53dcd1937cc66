//! Useful library code for tests
//!
//! A byte-level simulated SD card sitting on a simulated SPI bus, plus
//! implementations of the host traits that drive it. The card model speaks
//! the SPI-mode subset of the SD protocol — command frames, R1/R3/R7
//! responses, data tokens, data-response codes and busy signalling — and is
//! full duplex like the real thing: the MOSI side is parsed even while the
//! card is streaming read data, which is how CMD12 reaches a card mid-burst.
//! Knobs cover the failure modes the driver has to survive.

// Each integration test binary compiles its own copy of this module and
// uses a different slice of it.
#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use spi_sdcard::host::{
    BusError, CacheOps, Clock, DetectPin, DmaEvents, RawBusLock, SpiBus, SpinFlag,
};
use spi_sdcard::{Config, SdCard};

pub const CMD9: u8 = 9;
pub const CMD12: u8 = 12;
pub const CMD16: u8 = 16;
pub const CMD17: u8 = 17;
pub const CMD18: u8 = 18;
pub const CMD24: u8 = 24;
pub const CMD25: u8 = 25;
pub const CMD55: u8 = 55;
pub const CMD58: u8 = 58;
pub const ACMD41: u8 = 41;

/// 8 GB class SDHC card: C_SIZE = 15159 -> 15_523_840 blocks.
pub const CSD_V2_8GB: [u8; 16] = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x3B, 0x37, 0x7F, 0x80, 0x0A, 0x40, 0x40, 0x01,
];

/// 1 GiB SDSC card: C_SIZE = 4095, C_SIZE_MULT = 7, READ_BL_LEN = 9.
pub const CSD_V1_1GB: [u8; 16] = [
    0x00, 0x26, 0x00, 0x32, 0x5F, 0x09, 0x83, 0xFF, 0xC0, 0x03, 0x80, 0x00, 0x40, 0x00, 0x00, 0x01,
];

/// Everything the bus recorded, for framing and addressing assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Select,
    Deselect,
    /// One polled or DMA transfer; `cs_low` is the CS level during it.
    Xfer {
        cs_low: bool,
        dma: bool,
        mosi: Vec<u8>,
    },
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataPhase {
    /// Waiting for the single-block write token (0xFE).
    SingleWriteToken,
    /// Waiting for a multi-write token (0xFC) or stop-tran (0xFD).
    MultiWriteToken,
    /// Consuming a 512 + 2 byte data packet.
    Payload { multi: bool },
}

struct ReadStream {
    next_sector: u32,
    streamed: u32,
}

/// SPI-level model of an SD card in SPI mode.
pub struct CardModel {
    /// Present as SDHC (CMD8 answered, CCS set). Otherwise a v1 card that
    /// rejects CMD8 and addresses in bytes.
    pub sdhc: bool,
    pub csd: [u8; 16],
    /// CMD55+ACMD41 round-trips before the card reports ready.
    pub acmd41_polls_needed: u32,
    /// Never release ready during ACMD41 (init timeout testing).
    pub acmd41_never_ready: bool,
    /// Never answer the start token for the Nth streamed block (0-based)
    /// of a multi-block read.
    pub withhold_token_at: Option<u32>,
    /// Never answer the start token for single-block and CSD reads.
    pub withhold_single_token: bool,
    /// Refuse CMD16 with an error R1.
    pub fail_cmd16: bool,
    /// Overrides for the data-response byte, consumed front to back;
    /// afterwards every write is accepted.
    pub write_responses: VecDeque<u8>,
    /// Hold the line busy (0x00) until this absolute time.
    pub busy_until_ms: Option<u32>,
    /// Block store; blocks never written read back as a sector-derived
    /// pattern.
    pub blocks: HashMap<u32, [u8; 512]>,
    /// Every well-formed command frame the card saw, with its argument.
    pub cmd_log: Vec<(u8, u32)>,

    ready: bool,
    acmd: bool,
    acmd41_polls_seen: u32,
    frame: Vec<u8>,
    resp: VecDeque<u8>,
    read_stream: Option<ReadStream>,
    data_phase: Option<DataPhase>,
    write_buf: Vec<u8>,
    write_addr: u32,
    blocks_written_in_stream: u32,
}

impl CardModel {
    pub fn new(sdhc: bool) -> CardModel {
        CardModel {
            sdhc,
            csd: if sdhc { CSD_V2_8GB } else { CSD_V1_1GB },
            acmd41_polls_needed: 2,
            acmd41_never_ready: false,
            withhold_token_at: None,
            withhold_single_token: false,
            fail_cmd16: false,
            write_responses: VecDeque::new(),
            busy_until_ms: None,
            blocks: HashMap::new(),
            cmd_log: Vec::new(),
            ready: false,
            acmd: false,
            acmd41_polls_seen: 0,
            frame: Vec::new(),
            resp: VecDeque::new(),
            read_stream: None,
            data_phase: None,
            write_buf: Vec::new(),
            write_addr: 0,
            blocks_written_in_stream: 0,
        }
    }

    /// Pattern for sectors nobody has written yet.
    pub fn pattern(sector: u32) -> [u8; 512] {
        let mut data = [0u8; 512];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (sector as u8).wrapping_add(i as u8).wrapping_mul(31);
        }
        data
    }

    pub fn block_contents(&self, sector: u32) -> [u8; 512] {
        self.blocks
            .get(&sector)
            .copied()
            .unwrap_or_else(|| Self::pattern(sector))
    }

    fn sector_of(&self, address: u32) -> u32 {
        if self.sdhc {
            address
        } else {
            address / 512
        }
    }

    /// 0xFF gap, start token, payload, junk CRC.
    fn queue_data_packet(&mut self, payload: &[u8]) {
        self.resp.push_back(0xFF);
        self.resp.push_back(0xFE);
        self.resp.extend(payload.iter().copied());
        self.resp.push_back(0xAA);
        self.resp.push_back(0x55);
    }

    fn queue_next_read_block(&mut self) {
        let (sector, withheld) = match self.read_stream.as_ref() {
            Some(s) => (s.next_sector, self.withhold_token_at == Some(s.streamed)),
            None => return,
        };
        if withheld {
            // Starve this block; the host will time out and send CMD12.
            return;
        }
        let payload = self.block_contents(sector);
        let stream = self.read_stream.as_mut().unwrap();
        stream.next_sector += 1;
        stream.streamed += 1;
        self.queue_data_packet(&payload);
    }

    fn finish_write_packet(&mut self, multi: bool) {
        let response = self.write_responses.pop_front().unwrap_or(0x05);
        let accepted = response & 0x1F == 0x05;
        if accepted {
            let mut data = [0u8; 512];
            data.copy_from_slice(&self.write_buf[..512]);
            let offset = if multi { self.blocks_written_in_stream } else { 0 };
            self.blocks.insert(self.write_addr + offset, data);
            if multi {
                self.blocks_written_in_stream += 1;
            }
        }
        self.data_phase = if multi {
            Some(DataPhase::MultiWriteToken)
        } else {
            None
        };
        self.resp.push_back(response);
        // A short programming window after the data response.
        self.resp.extend([0x00, 0x00]);
    }

    fn handle_command(&mut self, cmd: u8, arg: u32) {
        let was_acmd = self.acmd;
        self.acmd = false;
        self.cmd_log.push((cmd, arg));
        // One stuff byte of turnaround before every response.
        self.resp.push_back(0xFF);
        match (cmd, was_acmd) {
            (0, _) => {
                self.ready = false;
                self.acmd41_polls_seen = 0;
                self.read_stream = None;
                self.data_phase = None;
                self.resp.clear();
                self.resp.extend([0xFF, 0x01]);
            }
            (8, _) => {
                if self.sdhc {
                    // R7: idle R1 plus the echoed voltage/check pattern.
                    self.resp.extend([0x01, 0x00, 0x00, 0x01, 0xAA]);
                } else {
                    // v1 cards reject SEND_IF_COND as illegal.
                    self.resp.push_back(0x05);
                }
            }
            (CMD55, _) => {
                self.acmd = true;
                self.resp.push_back(if self.ready { 0x00 } else { 0x01 });
            }
            (ACMD41, true) => {
                self.acmd41_polls_seen += 1;
                let done =
                    !self.acmd41_never_ready && self.acmd41_polls_seen >= self.acmd41_polls_needed;
                if done {
                    self.ready = true;
                }
                self.resp.push_back(if done { 0x00 } else { 0x01 });
            }
            (CMD58, _) => {
                self.resp.push_back(0x00);
                let ocr0 = if self.sdhc { 0xC0 } else { 0x80 };
                self.resp.extend([ocr0, 0xFF, 0x80, 0x00]);
            }
            (CMD16, _) => {
                self.resp
                    .push_back(if self.fail_cmd16 { 0x04 } else { 0x00 });
            }
            (CMD9, _) => {
                self.resp.push_back(0x00);
                if !self.withhold_single_token {
                    let csd = self.csd;
                    self.queue_data_packet(&csd);
                }
            }
            (CMD17, _) => {
                self.resp.push_back(0x00);
                if !self.withhold_single_token {
                    let payload = self.block_contents(self.sector_of(arg));
                    self.queue_data_packet(&payload);
                }
            }
            (CMD18, _) => {
                self.resp.push_back(0x00);
                self.read_stream = Some(ReadStream {
                    next_sector: self.sector_of(arg),
                    streamed: 0,
                });
            }
            (CMD12, _) => {
                self.read_stream = None;
                self.resp.clear();
                self.resp.extend([0xFF, 0x00]);
            }
            (CMD24, _) => {
                self.write_addr = self.sector_of(arg);
                self.blocks_written_in_stream = 0;
                self.data_phase = Some(DataPhase::SingleWriteToken);
                self.resp.push_back(0x00);
            }
            (CMD25, _) => {
                self.write_addr = self.sector_of(arg);
                self.blocks_written_in_stream = 0;
                self.data_phase = Some(DataPhase::MultiWriteToken);
                self.resp.push_back(0x00);
            }
            _ => {
                self.resp.push_back(0x04);
            }
        }
    }

    /// MOSI side: tokens, write payloads and command frames are decoded
    /// regardless of what the card is driving back.
    fn absorb(&mut self, mosi: u8) {
        match self.data_phase {
            Some(DataPhase::SingleWriteToken) => {
                if mosi == 0xFE {
                    self.data_phase = Some(DataPhase::Payload { multi: false });
                    self.write_buf.clear();
                }
            }
            Some(DataPhase::MultiWriteToken) => {
                if mosi == 0xFC {
                    self.data_phase = Some(DataPhase::Payload { multi: true });
                    self.write_buf.clear();
                } else if mosi == 0xFD {
                    self.data_phase = None;
                    // Brief busy after stop-tran.
                    self.resp.extend([0x00, 0x00]);
                }
            }
            Some(DataPhase::Payload { multi }) => {
                self.write_buf.push(mosi);
                if self.write_buf.len() == 512 + 2 {
                    self.finish_write_packet(multi);
                }
            }
            None => {
                if self.frame.is_empty() {
                    if mosi & 0xC0 == 0x40 {
                        self.frame.push(mosi);
                    }
                } else {
                    self.frame.push(mosi);
                    if self.frame.len() == 6 {
                        let cmd = self.frame[0] & 0x3F;
                        let arg = u32::from_be_bytes([
                            self.frame[1],
                            self.frame[2],
                            self.frame[3],
                            self.frame[4],
                        ]);
                        self.frame.clear();
                        self.handle_command(cmd, arg);
                    }
                }
            }
        }
    }

    /// MISO side: queued response bytes, then busy, then read-stream data,
    /// then idle.
    fn emit(&mut self, now_ms: u32) -> u8 {
        if let Some(byte) = self.resp.pop_front() {
            return byte;
        }
        if let Some(until) = self.busy_until_ms {
            if now_ms < until {
                return 0x00;
            }
            self.busy_until_ms = None;
        }
        if self.read_stream.is_some() {
            self.queue_next_read_block();
            if let Some(byte) = self.resp.pop_front() {
                return byte;
            }
        }
        0xFF
    }

    fn exchange(&mut self, mosi: u8, now_ms: u32) -> u8 {
        self.absorb(mosi);
        self.emit(now_ms)
    }
}

// ****************************************************************************
//
// Host trait implementations
//
// ****************************************************************************

/// The card, the bus trace and the simulated clock, shared by every
/// simulated peripheral of one test.
pub struct SimState {
    pub card: CardModel,
    pub trace: Vec<TraceEvent>,
    pub clock_ms: u32,
    cs_low: bool,
    pub cache_cleans: u32,
    pub cache_invalidates: u32,
    /// When set, DMA transfers start but never signal completion.
    pub stall_dma: bool,
}

pub type Shared = Arc<Mutex<SimState>>;

pub fn new_shared(card: CardModel) -> Shared {
    Arc::new(Mutex::new(SimState {
        card,
        trace: Vec::new(),
        clock_ms: 0,
        cs_low: false,
        cache_cleans: 0,
        cache_invalidates: 0,
        stall_dma: false,
    }))
}

pub struct SimBus {
    state: Shared,
    events: Option<&'static DmaEvents<SpinFlag>>,
}

impl SimBus {
    pub fn new(state: Shared) -> SimBus {
        SimBus {
            state,
            events: None,
        }
    }

    pub fn with_events(state: Shared, events: &'static DmaEvents<SpinFlag>) -> SimBus {
        SimBus {
            state,
            events: Some(events),
        }
    }

    fn run(&mut self, tx: &[u8], rx: Option<&mut [u8]>, dma: bool) {
        let mut state = self.state.lock().unwrap();
        let cs_low = state.cs_low;
        let now = state.clock_ms;
        let mut mosi = Vec::with_capacity(tx.len());
        match rx {
            Some(rx) => {
                for (t, r) in tx.iter().zip(rx.iter_mut()) {
                    mosi.push(*t);
                    *r = state.card.exchange(*t, now);
                }
            }
            None => {
                for t in tx {
                    mosi.push(*t);
                    state.card.exchange(*t, now);
                }
            }
        }
        state.trace.push(TraceEvent::Xfer { cs_low, dma, mosi });
    }
}

impl SpiBus for SimBus {
    fn write(&mut self, tx: &[u8], _timeout_ms: u32) -> Result<(), BusError> {
        self.run(tx, None, false);
        Ok(())
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8], _timeout_ms: u32) -> Result<(), BusError> {
        self.run(tx, Some(rx), false);
        Ok(())
    }

    fn start_write_dma(&mut self, tx: &[u8]) -> Result<(), BusError> {
        if self.state.lock().unwrap().stall_dma {
            return Ok(());
        }
        self.run(tx, None, true);
        self.events.expect("DMA without events").tx_complete();
        Ok(())
    }

    fn start_transfer_dma(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        if self.state.lock().unwrap().stall_dma {
            return Ok(());
        }
        self.run(tx, Some(rx), true);
        self.events.expect("DMA without events").txrx_complete();
        Ok(())
    }

    fn abort(&mut self) {
        self.state.lock().unwrap().trace.push(TraceEvent::Abort);
    }
}

pub struct SimCsPin {
    state: Shared,
}

impl SimCsPin {
    pub fn new(state: Shared) -> SimCsPin {
        SimCsPin { state }
    }
}

impl embedded_hal::digital::ErrorType for SimCsPin {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::OutputPin for SimCsPin {
    // The trace records level changes, not writes; re-asserting the current
    // level (e.g. CS high during the power-on clocks) is not an edge.
    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap();
        if !state.cs_low {
            state.cs_low = true;
            state.trace.push(TraceEvent::Select);
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut state = self.state.lock().unwrap();
        if state.cs_low {
            state.cs_low = false;
            state.trace.push(TraceEvent::Deselect);
        }
        Ok(())
    }
}

pub struct SimClock {
    state: Shared,
}

impl SimClock {
    pub fn new(state: Shared) -> SimClock {
        SimClock { state }
    }
}

impl Clock for SimClock {
    fn ticks_ms(&self) -> u32 {
        self.state.lock().unwrap().clock_ms
    }
}

/// Advances simulated time instead of sleeping.
pub struct SimDelay {
    state: Shared,
}

impl SimDelay {
    pub fn new(state: Shared) -> SimDelay {
        SimDelay { state }
    }
}

impl embedded_hal::delay::DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        let mut state = self.state.lock().unwrap();
        state.clock_ms += ns.div_ceil(1_000_000);
    }
}

/// A real blocking lock with a timeout, like an RTOS mutex.
pub struct StdBusLock {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl StdBusLock {
    pub fn new() -> StdBusLock {
        StdBusLock {
            locked: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

impl Default for StdBusLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawBusLock for StdBusLock {
    fn acquire(&self, timeout_ms: u32) -> bool {
        let guard = self.locked.lock().unwrap();
        let (mut guard, result) = self
            .cv
            .wait_timeout_while(
                guard,
                std::time::Duration::from_millis(u64::from(timeout_ms)),
                |locked| *locked,
            )
            .unwrap();
        if result.timed_out() && *guard {
            return false;
        }
        *guard = true;
        true
    }

    fn release(&self) {
        *self.locked.lock().unwrap() = false;
        self.cv.notify_one();
    }
}

/// A lock handle the test can also hold, to provoke contention.
#[derive(Clone)]
pub struct SharedLock(pub Arc<StdBusLock>);

impl SharedLock {
    pub fn new() -> SharedLock {
        SharedLock(Arc::new(StdBusLock::new()))
    }
}

impl Default for SharedLock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawBusLock for SharedLock {
    fn acquire(&self, timeout_ms: u32) -> bool {
        self.0.acquire(timeout_ms)
    }

    fn release(&self) {
        self.0.release()
    }
}

/// Counts maintenance calls and demands cache-line alignment for DMA.
pub struct CountingCache {
    state: Shared,
}

impl CountingCache {
    pub fn new(state: Shared) -> CountingCache {
        CountingCache { state }
    }
}

impl CacheOps for CountingCache {
    const DMA_ALIGNMENT: usize = 32;

    fn clean(&mut self, _buf: &[u8]) {
        self.state.lock().unwrap().cache_cleans += 1;
    }

    fn invalidate(&mut self, _buf: &mut [u8]) {
        self.state.lock().unwrap().cache_invalidates += 1;
    }
}

/// Card-detect switch the test can flip, active-high.
pub struct SimDetect {
    present: Arc<AtomicBool>,
}

impl SimDetect {
    pub fn new(present: Arc<AtomicBool>) -> SimDetect {
        SimDetect { present }
    }
}

impl DetectPin for SimDetect {
    fn is_high(&self) -> bool {
        self.present.load(Ordering::Relaxed)
    }
}

// ****************************************************************************
//
// Harness assembly
//
// ****************************************************************************

pub type SimCard =
    SdCard<'static, SimBus, SimCsPin, SimClock, SimDelay, StdBusLock, spi_sdcard::host::NoCache>;

/// Blocks guaranteed to satisfy a 32-byte DMA alignment requirement.
#[repr(align(32))]
pub struct AlignedBlocks<const N: usize>(pub [spi_sdcard::Block; N]);

impl<const N: usize> AlignedBlocks<N> {
    pub fn new() -> Self {
        AlignedBlocks(core::array::from_fn(|_| spi_sdcard::Block::new()))
    }
}

impl<const N: usize> Default for AlignedBlocks<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocks guaranteed to sit one byte past a 32-byte boundary.
#[repr(C, align(32))]
pub struct UnalignedBlocks<const N: usize> {
    _pad: u8,
    pub blocks: [spi_sdcard::Block; N],
}

impl<const N: usize> UnalignedBlocks<N> {
    pub fn new() -> Self {
        UnalignedBlocks {
            _pad: 0,
            blocks: core::array::from_fn(|_| spi_sdcard::Block::new()),
        }
    }
}

impl<const N: usize> Default for UnalignedBlocks<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A polled-mode handle over a fresh card model.
pub fn polled_card(card: CardModel, config: Config) -> (SimCard, Shared) {
    let _ = env_logger::builder().is_test(true).try_init();
    let state = new_shared(card);
    let sd = SdCard::new(
        SimBus::new(state.clone()),
        SimCsPin::new(state.clone()),
        SimClock::new(state.clone()),
        SimDelay::new(state.clone()),
        StdBusLock::new(),
        spi_sdcard::host::NoCache,
        config,
    );
    (sd, state)
}

pub type LockSimCard =
    SdCard<'static, SimBus, SimCsPin, SimClock, SimDelay, SharedLock, spi_sdcard::host::NoCache>;

/// Like [`polled_card`] but the caller keeps a handle on the lock.
pub fn contended_card(card: CardModel, config: Config) -> (LockSimCard, Shared, SharedLock) {
    let _ = env_logger::builder().is_test(true).try_init();
    let state = new_shared(card);
    let lock = SharedLock::new();
    let sd = SdCard::new(
        SimBus::new(state.clone()),
        SimCsPin::new(state.clone()),
        SimClock::new(state.clone()),
        SimDelay::new(state.clone()),
        lock.clone(),
        spi_sdcard::host::NoCache,
        config,
    );
    (sd, state, lock)
}

pub type DetectSimCard = SdCard<
    'static,
    SimBus,
    SimCsPin,
    SimClock,
    SimDelay,
    StdBusLock,
    spi_sdcard::host::NoCache,
    SimDetect,
>;

/// A polled-mode handle with a card-detect switch the test can flip.
pub fn detect_card(card: CardModel, config: Config) -> (DetectSimCard, Shared, Arc<AtomicBool>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let state = new_shared(card);
    let present = Arc::new(AtomicBool::new(true));
    let sd = SdCard::new(
        SimBus::new(state.clone()),
        SimCsPin::new(state.clone()),
        SimClock::new(state.clone()),
        SimDelay::new(state.clone()),
        StdBusLock::new(),
        spi_sdcard::host::NoCache,
        config,
    )
    .with_card_detect(SimDetect::new(present.clone()), false);
    (sd, state, present)
}

pub type DmaSimCard =
    SdCard<'static, SimBus, SimCsPin, SimClock, SimDelay, StdBusLock, CountingCache>;

/// A DMA-capable handle with a counting cache and a claimed event router.
pub fn dma_card(
    card: CardModel,
    config: Config,
    events: &'static DmaEvents<SpinFlag>,
) -> (DmaSimCard, Shared) {
    let _ = env_logger::builder().is_test(true).try_init();
    let state = new_shared(card);
    let sd = SdCard::new_with_dma(
        SimBus::with_events(state.clone(), events),
        SimCsPin::new(state.clone()),
        SimClock::new(state.clone()),
        SimDelay::new(state.clone()),
        StdBusLock::new(),
        CountingCache::new(state.clone()),
        events,
        config,
    )
    .expect("router already claimed");
    (sd, state)
}

/// Assert the CS framing property over the whole trace: transactions never
/// nest, and every CS-high edge is followed by exactly one idle byte clocked
/// with CS high before anything else happens on the bus.
pub fn assert_cs_framing(trace: &[TraceEvent]) {
    let mut selected = false;
    let mut events = trace.iter().peekable();
    while let Some(event) = events.next() {
        match event {
            TraceEvent::Select => {
                assert!(!selected, "nested CS assert");
                selected = true;
            }
            TraceEvent::Deselect => {
                assert!(selected, "CS deasserted while already high");
                selected = false;
                match events.peek() {
                    Some(TraceEvent::Xfer { cs_low, mosi, .. }) => {
                        assert!(!*cs_low, "trailing byte sent with CS low");
                        assert_eq!(mosi.as_slice(), &[0xFF], "trailing byte is not idle");
                    }
                    other => panic!("expected trailing idle byte after deselect, got {other:?}"),
                }
            }
            TraceEvent::Xfer { .. } | TraceEvent::Abort => {}
        }
    }
    assert!(!selected, "CS left asserted at end of trace");
}

/// All bytes shifted out while CS was low.
pub fn selected_bytes(trace: &[TraceEvent]) -> Vec<u8> {
    trace
        .iter()
        .filter_map(|event| match event {
            TraceEvent::Xfer {
                cs_low: true, mosi, ..
            } => Some(mosi.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}
