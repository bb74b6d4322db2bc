//! # Kernel Log Output
//!
//! Routes the [`log`] facade to whatever byte sink the kernel has at hand,
//! without allocating.
//!
//! ## Overview
//!
//! The memory subsystem reports through `log::{trace, debug, info, warn, error}`
//! only. Where those lines end up is decided once, at boot, by installing a
//! [`SinkLogger`] around a [`LineSink`]:
//!
//! ```text
//! info!("...") ──► SinkLogger ──► LineBuffer<N> ──► LineSink::emit(&str)
//!                  (level filter)  ("[LEVEL] target: msg")
//! ```
//!
//! * [`QemuDebugSink`]: QEMU's debug console (I/O port `0x402`, `-debugcon stdio`).
//! * [`NullSink`]: drops everything.
//! * Anything else implementing [`LineSink`], e.g. a serial port or a test recorder.
//!
//! Lines longer than [`LINE_CAPACITY`] bytes are cut at a character boundary
//! and end in `...`. Without an installed logger the facade is a no-op, so
//! diagnostics never fail the caller.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_log::{NullSink, SinkLogger};
//! use log::{LevelFilter, info};
//!
//! static LOGGER: SinkLogger<NullSink> = SinkLogger::new(NullSink, LevelFilter::Debug);
//!
//! LOGGER.init().expect("logger initialization");
//! info!("memory manager online");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod line_buffer;
mod logger;
mod sink;

pub use line_buffer::LineBuffer;
pub use logger::{LINE_CAPACITY, SinkLogger};
pub use sink::{LineSink, NullSink, QemuDebugSink};
