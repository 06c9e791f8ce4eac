//! # varzip Range Coder
//!
//! Entropy-coding layer of varzip:
//!
//! - [`coder`]: carry-less range encoder/decoder over 64-bit state
//! - [`model`]: adaptive frequency models (dense, adjustable, adjustable with
//!   inline storage) behind one [`model::FreqModel`] trait
//! - [`context_map`]: open-addressing map from a 64-bit context to an owned
//!   model instance
//!
//! The coders are polymorphic over the concrete model through the trait, so
//! a codec mixes alphabets of different sizes (binary decision models,
//! 16-ary symbol models, 256-ary byte models) against the same coder state.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod coder;
pub mod context_map;
pub mod model;

pub use coder::{RangeDecoder, RangeEncoder};
pub use context_map::ContextMap;
pub use model::{AdjustableModel, AdjustableModelEmb, CoderModel, DenseModel, FreqModel};

/// 64-bit context tag addressing one model inside a [`ContextMap`].
pub type Context = u64;
