//! Task glue for the ST touchpad: interrupt servicing, heat-map streaming,
//! firmware-update entry points and the operator console.
//!
//! The pieces are wired together through a shared [`task::TouchpadEvents`]
//! hub and a driver behind an async mutex.
//!
//! # Usage
//!
//! ```ignore
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use embassy_sync::mutex::Mutex;
//! use embassy_time::{Delay, Instant};
//! use st_touchpad_async::{conf::Config, StTouchpad};
//! use touchpad_task_async::heatmap::{FrameRing, HeatMapStreamer};
//! use touchpad_task_async::task::{stream_heat_map, TouchpadEvents, TouchpadTask};
//!
//! static EVENTS: TouchpadEvents<CriticalSectionRawMutex> = TouchpadEvents::new();
//!
//! // In the INT falling-edge handler:
//! EVENTS.on_interrupt(Instant::now());
//!
//! // At start-up:
//! let touchpad = Mutex::new(StTouchpad::new(spi, (rst, int), Delay, Config::default()));
//! // RING is a `static_cell::StaticCell<FrameRing<CriticalSectionRawMutex>>`.
//! let ring = RING.init(FrameRing::new());
//! let (producer, consumer) = ring.split();
//!
//! // Touch task:
//! TouchpadTask::new(&touchpad, &EVENTS, producer, hid_reports, Delay).run().await;
//!
//! // Streaming task:
//! stream_heat_map(&mut HeatMapStreamer::new(consumer), &EVENTS, &mut iso_ep, &mut Delay).await;
//! ```

#![no_std]
#![deny(missing_docs)]

pub mod console;
pub mod heatmap;
pub mod task;
