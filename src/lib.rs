//! # sdcard-spi
//!
//! > An SD card block-device driver over SPI, written in Embedded Rust
//!
//! This crate drives an SD card attached to a plain four-wire SPI bus and
//! exposes it through the narrow [`BlockDevice`] contract a filesystem
//! mounts on top of: `readblocks`, `writeblocks` and `ioctl`. It is
//! pure-Rust, `#![no_std]`, does not allocate, and is designed for
//! readability and simplicity over performance.
//!
//! The driver speaks the SD/SPI command subset: the two-generation
//! initialization handshake (V1 and V2 cards, byte- and block-addressed),
//! capacity discovery through the CSD register, and single/multiple block
//! transfers with data-token framing. Everything is synchronous and
//! blocking; callers sharing the bus across execution contexts provide
//! their own mutual exclusion.
//!
//! ## Using the crate
//!
//! You need an SPI peripheral implementing
//! `embedded_hal::blocking::spi::Transfer<u8>` plus this crate's
//! [`SpiClock`] (identification must run at a low clock before the driver
//! switches to the operating rate), and a chip-select
//! `embedded_hal::digital::v2::OutputPin`.
//!
//! ```rust,ignore
//! use sdcard_spi::{BlockDevice, SdCard, IOCTL_BLOCK_COUNT};
//!
//! let card = SdCard::new(spi, cs);
//! match card.init() {
//!     Ok(mut card) => {
//!         defmt::info!("card holds {} blocks", card.ioctl(IOCTL_BLOCK_COUNT, 0));
//!         let mut block = [0u8; 512];
//!         card.readblocks(0, &mut block, 0).unwrap();
//!     }
//!     Err((e, _card)) => defmt::error!("no card: {:?}", e),
//! }
//! ```
//!
//! ## Features
//!
//! * `defmt-log`: By turning off the default features and enabling the
//! `defmt-log` feature you can configure this crate to log messages over
//! defmt instead.
//!
//! Make sure that either the `log` feature or the `defmt-log` feature is
//! enabled.

#![cfg_attr(not(test), no_std)]

pub mod block_device;
pub mod sdcard;

pub use crate::block_device::{
    BlockDevice, MemoryBlockDevice, IOCTL_BLOCK_COUNT, IOCTL_BLOCK_SIZE, IOCTL_ERASE, IOCTL_SYNC,
};
pub use crate::sdcard::{
    CardType, Csd, Error as SdCardError, InitOpts, NotInit, Ready, SdCard, SpiClock,
};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
