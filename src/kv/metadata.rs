//! Metadata shapes attached to stored KV entries (§3's
//! `TransformationMetadata` / `ChunkManifest`).

use serde::{Deserialize, Serialize};

use crate::options::{Compression, Mode, Quality};

/// Warn/error thresholds on key and metadata sizes (§4.D "Metadata size
/// guards").
pub const KEY_WARN_BYTES: usize = 400;
pub const KEY_ERROR_BYTES: usize = 512;
pub const METADATA_WARN_BYTES: usize = 800;
pub const METADATA_ERROR_BYTES: usize = 1024;

/// Accepted drift between an expected and an actually-retrieved chunk
/// size before the read is considered corrupt. Either bound satisfies
/// the tolerance (whichever is looser for the given size).
pub const TOLERANCE_ABSOLUTE_BYTES: u64 = 2048;
pub const TOLERANCE_RELATIVE: f64 = 0.001;

pub fn within_tolerance(actual: u64, expected: u64) -> bool {
    if actual == expected {
        return true;
    }
    let diff = actual.abs_diff(expected);
    if diff <= TOLERANCE_ABSOLUTE_BYTES {
        return true;
    }
    (diff as f64) <= (expected as f64) * TOLERANCE_RELATIVE
}

/// Record attached to every stored entry (single or chunked-manifest).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationMetadata {
    pub content_type: String,
    pub content_length: u64,
    /// Milliseconds since epoch.
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub cache_tags: Vec<String>,
    pub cache_version: u64,
    pub is_chunked: bool,
    /// Authoritative total byte size. For single entries this equals
    /// the stored blob length; for chunked entries it equals
    /// `sum(manifest.actual_chunk_sizes)`.
    pub actual_total_video_size: u64,
    pub store_indefinitely: bool,
    pub mode: Mode,
    pub quality: Option<Quality>,
    pub compression: Option<Compression>,
    pub derivative: Option<String>,
    #[serde(default)]
    pub custom_data: serde_json::Value,
}

/// JSON value stored at the base key of a chunked entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub total_size: u64,
    pub chunk_count: u64,
    pub actual_chunk_sizes: Vec<u64>,
    pub standard_chunk_size: u64,
    pub original_content_type: String,
}

impl ChunkManifest {
    /// Validates the structural invariants from §3: chunk count matches
    /// the size list, sizes sum to the total, every size is positive
    /// and does not exceed `standard_chunk_size` (equality allowed only
    /// for all but the last chunk).
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_count as usize != self.actual_chunk_sizes.len() {
            return Err(format!(
                "chunk_count {} does not match actual_chunk_sizes length {}",
                self.chunk_count,
                self.actual_chunk_sizes.len()
            ));
        }
        let sum: u64 = self.actual_chunk_sizes.iter().sum();
        if sum != self.total_size {
            return Err(format!("sum of chunk sizes {sum} != total_size {}", self.total_size));
        }
        for (i, &size) in self.actual_chunk_sizes.iter().enumerate() {
            if size == 0 {
                return Err(format!("chunk {i} has zero size"));
            }
            let is_last = i + 1 == self.actual_chunk_sizes.len();
            if size > self.standard_chunk_size || (!is_last && size != self.standard_chunk_size) {
                return Err(format!("chunk {i} size {size} violates standard_chunk_size {}", self.standard_chunk_size));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_accepts_small_absolute_drift() {
        assert!(within_tolerance(10_000_000, 10_000_500));
    }

    #[test]
    fn tolerance_rejects_large_drift() {
        assert!(!within_tolerance(10_000_000, 9_000_000));
    }

    #[test]
    fn manifest_validates_chunk_sum_invariant() {
        let m = ChunkManifest {
            total_size: 14_680_064,
            chunk_count: 3,
            actual_chunk_sizes: vec![5_242_880, 5_242_880, 4_194_304],
            standard_chunk_size: 5_242_880,
            original_content_type: "video/mp4".to_string(),
        };
        assert!(m.validate().is_ok());
    }

    #[test]
    fn manifest_rejects_size_mismatch() {
        let mut m = ChunkManifest {
            total_size: 100,
            chunk_count: 1,
            actual_chunk_sizes: vec![99],
            standard_chunk_size: 100,
            original_content_type: "video/mp4".to_string(),
        };
        assert!(m.validate().is_err());
        m.actual_chunk_sizes = vec![100];
        m.total_size = 100;
        assert!(m.validate().is_ok());
    }

    #[test]
    fn manifest_rejects_non_final_undersized_chunk() {
        let m = ChunkManifest {
            total_size: 200,
            chunk_count: 2,
            actual_chunk_sizes: vec![50, 150],
            standard_chunk_size: 100,
            original_content_type: "video/mp4".to_string(),
        };
        assert!(m.validate().is_err());
    }
}
