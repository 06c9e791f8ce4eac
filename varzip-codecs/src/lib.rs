//! # varzip Codecs
//!
//! Column codecs of the varzip compressor:
//!
//! - [`textpp`]: reversible text preprocessing (word dictionary, packed
//!   numbers, base letters, zero and bar runs) applied ahead of the block
//!   coder for string columns
//! - [`field`]: the dictionary + context range coder for INFO and FORMAT
//!   columns
//! - [`pbwt`]: the positional Burrows-Wheeler permutation maintained across
//!   genotype rows
//! - [`genotype`]: the genotype column codec (bias transform, haplotype
//!   reorder, PBWT, context-mixed run-length range coding)
//!
//! Every codec instance is owned by exactly one column and is single
//! threaded; the engine serializes access per column.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod field;
pub mod genotype;
pub mod pbwt;
pub mod textpp;

pub use field::FieldCodec;
pub use genotype::GenotypeCodec;
pub use pbwt::Pbwt;
pub use textpp::TextPreproc;
