//! # varzip Archive
//!
//! The archive container and its post-pass optimizer:
//!
//! - [`archive`]: named append-only streams of parts with a footer index;
//!   parts are written at reserved slots so their order is deterministic,
//!   and a stream may be linked to another to share its bytes
//! - [`graph`]: the node/edge optimizer that decides which column streams
//!   are stored explicitly and which become references to an identical
//!   stream

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod graph;

pub use archive::Archive;
pub use graph::{Edge, GraphOptimizer, Node};
