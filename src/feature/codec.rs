use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{DIMENSIONS, FEATURE_BYTES, SIGNATURE_WORDS};
use crate::error::{GalleryError, Result};

/// Decoded embedding: one `f32` per dimension.
pub type FloatVector = [f32; DIMENSIONS];

/// Binarized feature: bit `i` is the sign bit of dimension `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Signature(pub [u32; SIGNATURE_WORDS]);

impl Signature {
    pub fn words(&self) -> &[u32; SIGNATURE_WORDS] {
        &self.0
    }
}

/// An opaque, validated 512-byte feature blob.
#[derive(Clone, PartialEq, Eq)]
pub struct FeatureBlob([u8; FEATURE_BYTES]);

impl FeatureBlob {
    pub fn as_bytes(&self) -> &[u8; FEATURE_BYTES] {
        &self.0
    }

    /// Decode a standard base64 string into a blob, checking its length.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| GalleryError::Validation(format!("feature is not valid base64: {e}")))?;
        Self::try_from(raw.as_slice())
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Build a blob from float values (test fixtures, enrollment tools).
    pub fn from_floats(values: &FloatVector) -> Self {
        let mut raw = [0u8; FEATURE_BYTES];
        for (chunk, v) in raw.chunks_exact_mut(4).zip(values.iter()) {
            chunk.copy_from_slice(&v.to_le_bytes());
        }
        Self(raw)
    }

    pub fn signature(&self) -> Signature {
        signature_of(&self.0)
    }

    pub fn float_vector(&self) -> FloatVector {
        floats_of(&self.0)
    }

    /// True if every dimension decodes to a finite float. NaN or infinite
    /// dimensions make every score against this blob NaN.
    pub fn is_finite(&self) -> bool {
        floats_of(&self.0).iter().all(|v| v.is_finite())
    }
}

impl std::fmt::Debug for FeatureBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FeatureBlob({} bytes)", FEATURE_BYTES)
    }
}

impl TryFrom<&[u8]> for FeatureBlob {
    type Error = GalleryError;

    fn try_from(raw: &[u8]) -> Result<Self> {
        let arr: [u8; FEATURE_BYTES] =
            raw.try_into()
                .map_err(|_| GalleryError::InvalidFeatureLength {
                    expected: FEATURE_BYTES,
                    actual: raw.len(),
                })?;
        Ok(Self(arr))
    }
}

/// Pack the sign bit of each 32-bit little-endian word into a 128-bit signature.
///
/// Word `i` contributes bit `i % 32` of output word `i / 32`. The sign bit is
/// the top bit of the word's most significant byte, i.e. `raw[4 * i + 3]`.
pub fn decode_signature(raw: &[u8]) -> Result<Signature> {
    let arr = check_len(raw)?;
    Ok(signature_of(arr))
}

/// Reinterpret each 4-byte little-endian group as an IEEE-754 `f32`.
pub fn decode_float_vector(raw: &[u8]) -> Result<FloatVector> {
    let arr = check_len(raw)?;
    Ok(floats_of(arr))
}

fn check_len(raw: &[u8]) -> Result<&[u8; FEATURE_BYTES]> {
    raw.try_into().map_err(|_| GalleryError::InvalidFeatureLength {
        expected: FEATURE_BYTES,
        actual: raw.len(),
    })
}

#[inline]
fn signature_of(raw: &[u8; FEATURE_BYTES]) -> Signature {
    let mut words = [0u32; SIGNATURE_WORDS];
    for i in 0..DIMENSIONS {
        let msb = raw[4 * i + 3];
        let bit = u32::from(msb >> 7);
        words[i / 32] |= bit << (i % 32);
    }
    Signature(words)
}

#[inline]
fn floats_of(raw: &[u8; FEATURE_BYTES]) -> FloatVector {
    let mut out = [0.0f32; DIMENSIONS];
    for (v, chunk) in out.iter_mut().zip(raw.chunks_exact(4)) {
        *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}
