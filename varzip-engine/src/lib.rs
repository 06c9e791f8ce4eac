//! # varzip Engine
//!
//! The compression/decompression engine:
//!
//! - [`record`]: keys, variant descriptions, and owned cells
//! - [`buffer`]: per-column accumulators of typed cells, including the
//!   signed cell varint and the decode-side function mode
//! - [`queue`]: the registering MPMC queue feeding the worker pools
//! - [`config`]: per-archive configuration (no process-wide state)
//! - [`writer`] / [`reader`]: the compressing and decompressing halves,
//!   each owning a worker pool with per-stream part ordering
//! - [`optimize`]: the post-pass that rewrites an archive with identical
//!   column streams stored as links
//! - [`pipeline`]: the four-stage barrier pipeline over the record I/O
//!   collaborator traits
//! - [`io`]: the collaborator traits plus in-memory implementations

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod config;
pub mod io;
pub mod optimize;
pub mod pipeline;
pub mod queue;
pub mod reader;
pub mod record;
pub mod writer;

pub use config::Config;
pub use reader::VariantReader;
pub use record::{Cell, KeyDesc, KeyKind, ValueType, VariantDesc};
pub use writer::VariantWriter;
