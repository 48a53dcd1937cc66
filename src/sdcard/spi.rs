//! The SD-SPI wire engine.
//!
//! Everything that actually toggles the bus lives here: byte and buffer
//! primitives (polled or DMA), chip-select framing, the command/response
//! engine, the initialization handshake and the block data paths. The public
//! wrapper in the parent module owns entry checks, locking and statistics;
//! by the time a method on [`SpiSdInner`] runs, the caller holds the handle
//! lock.

use byteorder::{BigEndian, ByteOrder};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

use super::proto::*;
use super::{Config, Error};
use crate::blockdevice::Block;
use crate::host::{BusError, CacheOps, Clock, Completion, Deadline, DmaEvents, SpiBus};
use crate::{debug, trace, warn};

/// One block of 0xFF, used to keep the line high while clocking data out of
/// the card during receive-only phases. Shared by every handle; read-only.
/// The alignment covers the strictest DMA requirement.
#[repr(align(32))]
struct IdleClocks([u8; Block::LEN]);

static IDLE_CLOCKS: IdleClocks = IdleClocks([0xFF; Block::LEN]);

/// What the initialization handshake discovered about the card.
pub(crate) struct CardInfo {
    pub sdhc: bool,
    pub capacity_blocks: u32,
}

/// Wire-level driver state: the bus binding and the transfer configuration.
pub(crate) struct SpiSdInner<'d, SPI, CS, CLK, D, C, S>
where
    SPI: SpiBus,
    CS: OutputPin,
    CLK: Clock,
    D: DelayNs,
    C: CacheOps,
    S: Completion,
{
    spi: SPI,
    cs: CS,
    clock: CLK,
    delayer: D,
    cache: C,
    events: Option<&'d DmaEvents<S>>,
    config: Config,
}

impl<'d, SPI, CS, CLK, D, C, S> SpiSdInner<'d, SPI, CS, CLK, D, C, S>
where
    SPI: SpiBus,
    CS: OutputPin,
    CLK: Clock,
    D: DelayNs,
    C: CacheOps,
    S: Completion,
{
    pub(crate) fn new(
        spi: SPI,
        cs: CS,
        clock: CLK,
        delayer: D,
        cache: C,
        events: Option<&'d DmaEvents<S>>,
        config: Config,
    ) -> Self {
        SpiSdInner {
            spi,
            cs,
            clock,
            delayer,
            cache,
            events,
            config,
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn events(&self) -> Option<&'d DmaEvents<S>> {
        self.events
    }

    /// The 1 ms pause between retries and polling rounds. Suspends the task
    /// under an RTOS-backed delay implementation.
    pub(crate) fn backoff(&mut self) {
        self.delayer.delay_ms(1);
    }

    // ************************************************************************
    //
    // Bus primitives
    //
    // ************************************************************************

    fn map_bus(err: BusError) -> Error {
        match err {
            BusError::Timeout => Error::Timeout,
            BusError::Fault => Error::Bus,
        }
    }

    /// Send a buffer, polled or by DMA. DMA callers have already checked
    /// alignment; tx caches are cleaned before the engine reads memory.
    fn transmit(&mut self, buf: &[u8], dma: bool) -> Result<(), Error> {
        if dma {
            let events = self.events.ok_or(Error::Bus)?;
            events.tx().reset();
            self.cache.clean(buf);
            self.spi.start_write_dma(buf).map_err(|_| Error::Bus)?;
            if !events
                .tx()
                .wait(&self.clock, &mut self.delayer, self.config.dma_timeout_ms)
            {
                self.spi.abort();
                return Err(Error::Timeout);
            }
            return Ok(());
        }
        self.spi
            .write(buf, self.config.spi_io_timeout_ms)
            .map_err(Self::map_bus)
    }

    /// Exchange buffers, polled or by DMA. The rx range is invalidated both
    /// before the transfer and after it, to defeat speculative line refills
    /// while the engine was writing memory.
    fn transmit_receive(&mut self, tx: &[u8], rx: &mut [u8], dma: bool) -> Result<(), Error> {
        if dma {
            let events = self.events.ok_or(Error::Bus)?;
            events.rx().reset();
            self.cache.clean(tx);
            self.cache.invalidate(rx);
            self.spi.start_transfer_dma(tx, rx).map_err(|_| Error::Bus)?;
            if !events
                .rx()
                .wait(&self.clock, &mut self.delayer, self.config.dma_timeout_ms)
            {
                self.spi.abort();
                return Err(Error::Timeout);
            }
            self.cache.invalidate(rx);
            return Ok(());
        }
        self.spi
            .transfer(tx, rx, self.config.spi_io_timeout_ms)
            .map_err(Self::map_bus)
    }

    /// Receive a byte by clocking out 0xFF, with a caller-chosen bound.
    fn read_byte_bounded(&mut self, timeout_ms: u32) -> Result<u8, Error> {
        let mut rx = [0xFF; 1];
        self.spi
            .transfer(&[0xFF], &mut rx, timeout_ms)
            .map_err(Self::map_bus)?;
        Ok(rx[0])
    }

    /// Receive a byte by clocking out 0xFF.
    fn read_byte(&mut self) -> Result<u8, Error> {
        self.read_byte_bounded(self.config.spi_io_timeout_ms)
    }

    /// Send a byte and ignore what comes back.
    fn write_byte(&mut self, out: u8) -> Result<(), Error> {
        self.spi
            .write(&[out], self.config.spi_io_timeout_ms)
            .map_err(Self::map_bus)
    }

    // ************************************************************************
    //
    // Chip-select discipline
    //
    // ************************************************************************

    fn select(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::Bus)
    }

    /// Raise CS and clock one trailing idle byte with CS high. The extra
    /// byte shifts the card out of its internal busy state and is required
    /// after every transaction, error paths included.
    fn end_transaction(&mut self) {
        let _ = self.cs.set_high();
        let _ = self.write_byte(0xFF);
    }

    // ************************************************************************
    //
    // Waiting on the card
    //
    // ************************************************************************

    /// Poll until the card releases the line (0xFF), or `timeout_ms`
    /// elapses. A busy card holds the line at 0x00.
    fn wait_ready(&mut self, timeout_ms: u32) -> Result<(), Error> {
        let io_ms = timeout_ms.min(self.config.spi_io_timeout_ms).max(1);
        let deadline = Deadline::new(&self.clock, timeout_ms);
        loop {
            if self.read_byte_bounded(io_ms).map_err(|_| Error::Bus)? == 0xFF {
                return Ok(());
            }
            if deadline.expired(&self.clock) {
                return Err(Error::Timeout);
            }
            self.backoff();
        }
    }

    /// Poll until the start-of-block token appears, or `timeout_ms` elapses.
    fn wait_token(&mut self, token: u8, timeout_ms: u32) -> Result<(), Error> {
        let io_ms = timeout_ms.min(self.config.spi_io_timeout_ms).max(1);
        let deadline = Deadline::new(&self.clock, timeout_ms);
        loop {
            if self.read_byte_bounded(io_ms).map_err(|_| Error::Bus)? == token {
                return Ok(());
            }
            if deadline.expired(&self.clock) {
                return Err(Error::Timeout);
            }
            self.backoff();
        }
    }

    // ************************************************************************
    //
    // Command / response engine
    //
    // ************************************************************************

    /// Frame and send a command, then poll for its R1 response.
    ///
    /// Returns the R1 byte whatever it encodes; interpreting idle/error
    /// flags is the caller's job. The wait-ready preamble doubles as the
    /// inter-command spacing the card needs, so no separate delay is
    /// inserted between commands.
    fn command(&mut self, cmd: u8, arg: u32, crc: u8) -> Result<u8, Error> {
        self.wait_ready(self.config.cmd_timeout_ms)?;

        let mut frame = [0xFF; 7];
        frame[1] = 0x40 | cmd;
        BigEndian::write_u32(&mut frame[2..6], arg);
        frame[6] = crc;
        self.transmit(&frame, false).map_err(|_| Error::Bus)?;

        // The R1 byte is the first one with the top bit clear, within a
        // narrow window after the frame.
        for _ in 0..10 {
            let r1 = self.read_byte().map_err(|_| Error::Bus)?;
            if r1 & 0x80 == 0 {
                return Ok(r1);
            }
        }
        Err(Error::Timeout)
    }

    /// Send a command and require the card to answer R1 = ready.
    fn command_ready(&mut self, cmd: u8, arg: u32) -> Result<(), Error> {
        match self.command(cmd, arg, CRC_DEFAULT) {
            Ok(R1_READY_STATE) => Ok(()),
            Ok(_r) => {
                warn!("CMD{} rejected: R1 = {:x}", cmd, _r);
                Err(Error::Bus)
            }
            Err(_) => Err(Error::Bus),
        }
    }

    /// Read the four trailing bytes of an R3/R7 response.
    fn read_trailer(&mut self) -> Result<u32, Error> {
        let mut raw = [0xFF; 4];
        self.transmit_receive(&IDLE_CLOCKS.0[..4], &mut raw, false)?;
        Ok(BigEndian::read_u32(&raw))
    }

    /// Clock out and discard the two CRC bytes that follow every data block.
    fn discard_crc(&mut self) -> Result<(), Error> {
        let mut crc = [0xFF; 2];
        self.transmit_receive(&IDLE_CLOCKS.0[..2], &mut crc, false)
    }

    // ************************************************************************
    //
    // Initialization handshake
    //
    // ************************************************************************

    pub(crate) fn initialize(&mut self) -> Result<CardInfo, Error> {
        // At least 74 clock cycles with CS high let the card enter SPI mode.
        let _ = self.cs.set_high();
        self.transmit(&IDLE_CLOCKS.0[..10], false)?;

        trace!("Reset card..");
        let deadline = Deadline::new(&self.clock, self.config.init_timeout_ms);
        loop {
            self.select()?;
            let r1 = self.command(CMD0, 0, CRC_CMD0);
            self.end_transaction();
            if matches!(r1, Ok(R1_IDLE_STATE)) {
                break;
            }
            if deadline.expired(&self.clock) {
                warn!("No idle response to GO_IDLE_STATE");
                return Err(Error::Bus);
            }
            self.backoff();
        }

        // CMD8 probes for a v2 card; a valid R7 echoes the voltage range
        // and check pattern. v1 cards answer illegal-command.
        self.select()?;
        let mut sdv2 = false;
        if let Ok(r1) = self.command(CMD8, IF_COND_ARG, CRC_CMD8) {
            let r7 = self.read_trailer().unwrap_or(0);
            sdv2 = r1 == R1_IDLE_STATE && (r7 & 0xFFFF) == IF_COND_ARG;
        }
        self.end_transaction();
        debug!("SEND_IF_COND: v2 = {}", sdv2);

        // ACMD41, with HCS for v2 cards, until the card leaves idle.
        let acmd_arg = if sdv2 { ACMD41_HCS } else { 0 };
        let deadline = Deadline::new(&self.clock, self.config.init_timeout_ms);
        loop {
            self.select()?;
            let _ = self.command(CMD55, 0, CRC_DEFAULT);
            let r1 = self.command(ACMD41, acmd_arg, CRC_DEFAULT);
            self.end_transaction();
            if matches!(r1, Ok(R1_READY_STATE)) {
                break;
            }
            if deadline.expired(&self.clock) {
                warn!("Card stuck in idle during ACMD41");
                return Err(Error::Timeout);
            }
            self.backoff();
        }

        // The CCS bit of the OCR picks block addressing vs byte addressing.
        let mut sdhc = false;
        self.select()?;
        if let Ok(R1_READY_STATE) = self.command(CMD58, 0, CRC_DEFAULT) {
            if let Ok(ocr) = self.read_trailer() {
                sdhc = ocr & OCR_CCS != 0;
            }
        }
        self.end_transaction();

        if !sdhc {
            // Byte-addressed cards must be pinned to 512-byte blocks.
            self.set_block_length(Block::LEN_U32)?;
        }

        // A CSD read failure is not fatal; the capacity just stays unknown.
        let capacity_blocks = match self.read_csd() {
            Ok(csd) => csd_capacity_blocks(&csd),
            Err(_e) => {
                warn!("CSD read failed: {:?}", _e);
                0
            }
        };

        debug!(
            "Card ready: sdhc = {}, capacity = {} blocks",
            sdhc, capacity_blocks
        );
        Ok(CardInfo {
            sdhc,
            capacity_blocks,
        })
    }

    fn set_block_length(&mut self, len: u32) -> Result<(), Error> {
        self.select()?;
        let result = self.command_ready(CMD16, len);
        self.end_transaction();
        result
    }

    fn read_csd(&mut self) -> Result<[u8; 16], Error> {
        self.select()?;
        let result = self.read_csd_payload();
        self.end_transaction();
        result
    }

    fn read_csd_payload(&mut self) -> Result<[u8; 16], Error> {
        self.command_ready(CMD9, 0)?;
        self.wait_token(DATA_START_BLOCK, self.config.data_token_timeout_ms)?;
        let mut csd = [0u8; 16];
        self.transmit_receive(&IDLE_CLOCKS.0[..16], &mut csd, false)?;
        let _ = self.discard_crc();
        Ok(csd)
    }

    // ************************************************************************
    //
    // Block data engine
    //
    // ************************************************************************

    /// Whether this buffer may go to the DMA engine: DMA enabled, a
    /// completion router present, and the start address aligned. Unaligned
    /// buffers fall through to polled transfers.
    fn dma_eligible(&self, buf: &[u8]) -> bool {
        self.config.use_dma
            && self.events.is_some()
            && buf.as_ptr() as usize % C::DMA_ALIGNMENT == 0
    }

    pub(crate) fn read_single(&mut self, block: &mut Block, address: u32) -> Result<(), Error> {
        self.select()?;
        let result = self.read_single_payload(block, address);
        self.end_transaction();
        result
    }

    fn read_single_payload(&mut self, block: &mut Block, address: u32) -> Result<(), Error> {
        self.command_ready(CMD17, address)?;
        self.wait_token(DATA_START_BLOCK, self.config.data_token_timeout_ms)?;
        let dma = self.dma_eligible(&block.contents);
        self.transmit_receive(&IDLE_CLOCKS.0, &mut block.contents, dma)?;
        let _ = self.discard_crc();
        Ok(())
    }

    pub(crate) fn read_multi(&mut self, blocks: &mut [Block], address: u32) -> Result<(), Error> {
        self.select()?;
        if self.command_ready(CMD18, address).is_err() {
            self.end_transaction();
            return Err(Error::Bus);
        }
        let mut result = Ok(());
        for block in blocks.iter_mut() {
            result = self.stream_block_in(block);
            if result.is_err() {
                break;
            }
        }
        // The stream is committed in the card; terminate it even after a
        // partial failure.
        let _ = self.command(CMD12, 0, CRC_DEFAULT);
        self.end_transaction();
        result
    }

    fn stream_block_in(&mut self, block: &mut Block) -> Result<(), Error> {
        self.wait_token(DATA_START_BLOCK, self.config.data_token_timeout_ms)?;
        let dma = self.dma_eligible(&block.contents);
        self.transmit_receive(&IDLE_CLOCKS.0, &mut block.contents, dma)?;
        let _ = self.discard_crc();
        Ok(())
    }

    pub(crate) fn write_single(&mut self, block: &Block, address: u32) -> Result<(), Error> {
        self.select()?;
        let result = self.write_single_payload(block, address);
        self.end_transaction();
        result
    }

    fn write_single_payload(&mut self, block: &Block, address: u32) -> Result<(), Error> {
        self.command_ready(CMD24, address)?;
        let _ = self.write_byte(DATA_START_BLOCK);
        let dma = self.dma_eligible(&block.contents);
        self.transmit(&block.contents, dma)?;
        self.finish_data_packet()
    }

    /// Dummy CRC, data-response nibble, then wait out the programming
    /// window.
    fn finish_data_packet(&mut self) -> Result<(), Error> {
        let _ = self.write_byte(0xFF);
        let _ = self.write_byte(0xFF);
        let response = self.read_byte().map_err(|_| Error::Bus)?;
        match response & DATA_RES_MASK {
            DATA_RES_ACCEPTED => {}
            DATA_RES_CRC_ERROR => return Err(Error::Crc),
            _ => return Err(Error::Write),
        }
        self.wait_ready(self.config.write_busy_timeout_ms)
    }

    pub(crate) fn write_multi(&mut self, blocks: &[Block], address: u32) -> Result<(), Error> {
        self.select()?;
        if self.command_ready(CMD25, address).is_err() {
            self.end_transaction();
            return Err(Error::Bus);
        }
        let mut result = Ok(());
        for block in blocks.iter() {
            result = self.stream_block_out(block);
            if result.is_err() {
                break;
            }
        }
        // Stop-tran closes the stream even after a failed block.
        let _ = self.write_byte(STOP_TRAN_TOKEN);
        let _ = self.wait_ready(self.config.write_busy_timeout_ms);
        self.end_transaction();
        result
    }

    fn stream_block_out(&mut self, block: &Block) -> Result<(), Error> {
        let _ = self.write_byte(WRITE_MULTIPLE_TOKEN);
        let dma = self.dma_eligible(&block.contents);
        self.transmit(&block.contents, dma)?;
        self.finish_data_packet()
    }

    // ************************************************************************
    //
    // Sync
    //
    // ************************************************************************

    /// Wait for the card to release its busy line, bracketed by CS framing.
    pub(crate) fn flush_busy(&mut self) -> Result<(), Error> {
        self.select()?;
        let result = self.wait_ready(self.config.write_busy_timeout_ms);
        self.end_transaction();
        result
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
