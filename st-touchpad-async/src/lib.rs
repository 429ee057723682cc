//! An asynchronous, `no_std` driver for ST multi-touch touchpad controllers.
//!
//! The controller sits on a chip-select (SPI) bus and streams fixed-size
//! bursts of 8-byte event records. On top of that event stream this crate
//! provides:
//!
//! - decoding of event bursts into typed [`op::Event`]s,
//! - folding pointer events into multi-finger [`op::TouchReport`]s,
//! - tracking of the device-side mode bits (debug, heat map, dome switch,
//!   active scan) with minimal mode-change command sequences,
//! - in-field firmware reprogramming (erase, chunked writes, DMA commit),
//! - capture of the raw heat-map image used for host-side streaming.
//!
//! The main entry point is the [`StTouchpad`] struct, which takes an async SPI
//! device, the board reset and interrupt lines and a delay provider.
//!
//! # Usage
//!
//! See the `touchpad-task-async` crate for the task loop, the double-buffered
//! heat-map pipeline and the update/console entry points built on top of this
//! driver.

#![no_std]

pub mod conf;
pub mod op;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

mod tp;
pub use tp::*;
