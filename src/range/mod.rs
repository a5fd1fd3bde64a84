//! Range Handler (component H).
//!
//! Parses a single-range `Range` header and assembles the 206 header
//! set, grounded in the reference gateway's `routes/blob.rs`
//! (`parse_range_header` / `handle_range_request`) but inclusive-end
//! semantics throughout to match this system's data model rather than
//! that module's half-open internal representation.

/// A satisfiable byte range resolved against a known total size.
/// `start`/`end` are both inclusive, matching `Content-Range: bytes
/// start-end/total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range_header(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Parses `bytes=A-B`, `bytes=A-`, and `bytes=-S` (suffix) against a
/// known `total_size`. `end` is clamped to `total_size - 1`. Returns
/// `None` on a malformed header or an unsatisfiable range (`start >
/// end`, `start >= total_size`) -- callers apply the configured
/// unsatisfiable-range policy (§4.H / `strict_range_416`).
pub fn parse_range(header: &str, total_size: u64) -> Option<ByteRange> {
    if total_size == 0 {
        return None;
    }
    let spec = header.strip_prefix("bytes=")?;

    let (start, end) = if let Some(suffix) = spec.strip_prefix('-') {
        let suffix_len: u64 = suffix.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        let start = total_size.saturating_sub(suffix_len);
        (start, total_size - 1)
    } else {
        let mut parts = spec.splitn(2, '-');
        let start: u64 = parts.next()?.parse().ok()?;
        let end_part = parts.next()?;
        let end = if end_part.is_empty() {
            total_size - 1
        } else {
            end_part.parse::<u64>().ok()?.min(total_size - 1)
        };
        (start, end)
    };

    if start >= total_size || start > end {
        return None;
    }

    Some(ByteRange { start, end, total: total_size })
}

/// Builds the `Content-Range: bytes */{total}` value for a 416
/// response under the strict policy.
pub fn unsatisfiable_content_range(total_size: u64) -> String {
    format!("bytes */{total_size}")
}
