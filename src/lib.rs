//! # spi-sdcard
//!
//! > An SD/SDHC SPI-mode block device driver for Embedded Rust
//!
//! This crate drives an SD or SDHC memory card over a plain SPI bus (SPI
//! mode, not the 4-bit SD bus) and exposes it as a 512-byte
//! [`BlockDevice`]. It is written in pure-Rust, is `#![no_std]` and does not
//! use `alloc`. Every wait on the wire is bounded by a configurable timeout,
//! access is serialised through a host-supplied lock so the handle can be
//! shared between tasks of a cooperative RTOS, and whole-block transfers can
//! be handed to a DMA engine with the cache maintenance that implies.
//!
//! ## Using the crate
//!
//! You supply the pieces of your platform the driver cannot know about: a
//! SPI peripheral (polled and, optionally, DMA transfers), a chip-select
//! pin, a millisecond tick, a short-sleep primitive, a lock, and cache
//! maintenance (or [`host::NoCache`]). See the [`host`] module for the
//! traits involved.
//!
//! ```rust
//! use spi_sdcard::host::{CacheOps, Clock, RawBusLock, SpiBus};
//! use spi_sdcard::{Block, BlockIdx, Config, Error, SdCard};
//!
//! fn mount_and_read<SPI, CS, CLK, D, L, C>(
//!     spi: SPI,
//!     cs: CS,
//!     clock: CLK,
//!     delay: D,
//!     lock: L,
//!     cache: C,
//! ) -> Result<(), Error>
//! where
//!     SPI: SpiBus,
//!     CS: embedded_hal::digital::OutputPin,
//!     CLK: Clock,
//!     D: embedded_hal::delay::DelayNs,
//!     L: RawBusLock,
//!     C: CacheOps,
//! {
//!     let card = SdCard::new(spi, cs, clock, delay, lock, cache, Config::default());
//!     card.init_card()?;
//!     let mut blocks = [Block::new()];
//!     card.read_blocks(&mut blocks, BlockIdx(0))?;
//!     Ok(())
//! }
//! ```
//!
//! The caller is responsible for running the bus at 400 kHz or below until
//! [`SdCard::init_card`] returns, and may then raise the clock; the driver
//! neither sets nor checks the bus frequency.
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log`
//!   crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over
//!   defmt instead.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

// ****************************************************************************
//
// Modules and re-exports
//
// ****************************************************************************

pub mod blockdevice;
pub mod host;
pub mod sdcard;

#[doc(inline)]
pub use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx};

#[doc(inline)]
pub use crate::sdcard::{Config, Error, SdCard, Stats};

// ****************************************************************************
//
// Logging shims
//
// ****************************************************************************

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
