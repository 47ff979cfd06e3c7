//! Signature prefilter and float comparator.

use super::codec::{FloatVector, Signature};
use super::SIGNATURE_WORDS;

/// Added to the denominator of [`cosine_like_score`] so zero vectors score 0.
const SCORE_EPSILON: f32 = 1e-6;

/// True iff the Hamming distance between two signatures is at most `bound`.
///
/// Stops counting as soon as the running distance exceeds `bound`. The maximum
/// distance is 128, so any `bound >= 128` accepts every pair.
#[inline]
pub fn hamming_within_bound(a: &Signature, b: &Signature, bound: u32) -> bool {
    let mut distance = 0u32;
    for i in 0..SIGNATURE_WORDS {
        distance += (a.0[i] ^ b.0[i]).count_ones();
        if distance > bound {
            return false;
        }
    }
    true
}

/// Full Hamming distance between two signatures.
#[inline]
pub fn hamming_distance(a: &Signature, b: &Signature) -> u32 {
    a.0.iter()
        .zip(b.0.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// `dot(a, b) / (sqrt(|a|^2 * |b|^2) + 1e-6)`.
///
/// Both inputs are fixed-size so a dimension mismatch cannot reach this point.
#[inline]
pub fn cosine_like_score(a: &FloatVector, b: &FloatVector) -> f32 {
    let mut dot: f32 = 0.0;
    let mut norm_a: f32 = 0.0;
    let mut norm_b: f32 = 0.0;

    // Chunks of 8 so LLVM can vectorize the three accumulations.
    for (ca, cb) in a.chunks_exact(8).zip(b.chunks_exact(8)) {
        let mut d = [0.0f32; 8];
        let mut na = [0.0f32; 8];
        let mut nb = [0.0f32; 8];
        for j in 0..8 {
            d[j] = ca[j] * cb[j];
            na[j] = ca[j] * ca[j];
            nb[j] = cb[j] * cb[j];
        }
        for j in 0..8 {
            dot += d[j];
            norm_a += na[j];
            norm_b += nb[j];
        }
    }

    dot / ((norm_a * norm_b).sqrt() + SCORE_EPSILON)
}
