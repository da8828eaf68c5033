//! # heaptrail
//!
//! Tracing memory profiler engine for a cooperative managed runtime.
//!
//! heaptrail intercepts every heap allocation and deallocation performed by
//! the host process, correlates each event with the managed call stack (and
//! optionally the native call stack) at the moment of the event, and streams
//! the result to a compact, seekable binary capture file. Captures are then
//! reduced offline into snapshots: full heap at a point in time, high-water
//! -mark contribution per call site, surviving (leaked) allocations, and
//! temporary-allocation patterns.
//!
//! ## Architecture
//!
//! - Interceptors for the `malloc` and `mmap` families are installed by
//!   rewriting relocation entries in every loaded image ([`hooks`]).
//! - A per-thread shadow stack mirrors the runtime's frame chain and emits
//!   pushes/pops lazily, only when an allocation actually happens
//!   ([`runtime`]).
//! - A single-writer encoder appends delta/varint-compressed records to a
//!   byte sink ([`format`], [`sink`]).
//! - A reader replays the record stream, rebuilding per-thread stacks, and
//!   feeds [`aggregate`] reducers keyed by call-site location.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use heaptrail::{Tracker, TrackerConfig};
//! use heaptrail::sink::FileSink;
//!
//! let sink = FileSink::create("capture.bin", true).unwrap();
//! let tracker = Tracker::create(Box::new(sink), TrackerConfig::default()).unwrap();
//! // ... traced workload runs ...
//! Tracker::destroy(tracker);
//! ```

pub mod aggregate;
pub mod config;
pub mod core;
pub mod ds;
pub mod error;
pub mod format;
pub mod hooks;
pub mod native;
pub mod runtime;
pub mod sink;

pub(crate) mod sync;
pub(crate) mod util;

pub use crate::config::TrackerConfig;
pub use crate::core::tracker::Tracker;
pub use crate::error::{TrackerError, TrackerResult};
pub use crate::format::{AllocatorKind, FileFormat, Frame, HeaderInfo};
