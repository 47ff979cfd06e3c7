//! Feature decoding and comparison.
//!
//! A feature blob is 512 bytes: 128 little-endian IEEE-754 `f32` values, one
//! per embedding dimension. Two derived forms are used during search:
//!
//! - [`Signature`]: 128 sign bits packed into four `u32` words, compared by
//!   Hamming distance as a cheap prefilter.
//! - [`FloatVector`]: the 128 floats, compared with [`cosine_like_score`].

pub mod codec;
pub mod compare;

pub use codec::{decode_float_vector, decode_signature, FeatureBlob, FloatVector, Signature};
pub use compare::{cosine_like_score, hamming_distance, hamming_within_bound};

/// Number of embedding dimensions in a feature blob.
pub const DIMENSIONS: usize = 128;

/// Size of a feature blob in bytes.
pub const FEATURE_BYTES: usize = DIMENSIONS * 4;

/// Number of `u32` words in a signature.
pub const SIGNATURE_WORDS: usize = DIMENSIONS / 32;

/// Largest possible Hamming distance between two signatures.
pub const MAX_HAMMING_DISTANCE: u32 = DIMENSIONS as u32;
