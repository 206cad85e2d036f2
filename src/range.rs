//! HTTP `Range` header resolution.
//!
//! Pure functions only: a header value plus the authoritative object size go
//! in, a validated inclusive byte interval comes out.  Translation of the
//! failures into status codes happens in [`crate::streamer`].

use thiserror::Error;

/// Validated inclusive interval `[start, end]` over an object's bytes.
///
/// Construction goes through [`ByteRange::new`], which refuses inverted
/// intervals, so `start <= end` holds for every value of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    /// Build an interval, or `None` when `start > end`.
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// The whole object, or `None` for an empty object.
    pub fn full(size: u64) -> Option<Self> {
        size.checked_sub(1).map(|end| Self { start: 0, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered (always at least one).
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for a `Content-Range` header on a 206 response.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

/// Outcome of resolving an optional `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeRequest {
    /// No usable header: serve the whole object.
    Full,
    /// A satisfiable single range.
    Partial(ByteRange),
}

/// Failures raised by [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RangeError {
    /// The header does not follow `bytes=<start>-<end>`.
    #[error("malformed range header")]
    Malformed,
    /// The first requested byte lies beyond the end of the object.
    #[error("range not satisfiable for object of {size} bytes")]
    Unsatisfiable { size: u64 },
}

/// Resolve an optional `Range` header against an object of `size` bytes.
///
/// Only the first comma-separated group of a multi-range header is honored.
/// A malformed header is reported as [`RangeError::Malformed`]; callers
/// serving content treat that like an absent header.
pub fn resolve(header: Option<&str>, size: u64) -> Result<RangeRequest, RangeError> {
    let Some(header) = header else {
        return Ok(RangeRequest::Full);
    };

    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?;
    let first = spec.split(',').next().unwrap_or_default().trim();
    let (start_s, end_s) = first.split_once('-').ok_or(RangeError::Malformed)?;
    let (start_s, end_s) = (start_s.trim(), end_s.trim());

    let start = parse_bound(start_s)?;
    let end = parse_bound(end_s)?;

    let (start, end) = match (start, end) {
        (Some(start), Some(end)) => {
            if start > end {
                return Err(RangeError::Malformed);
            }
            (start, end)
        }
        (Some(start), None) => (start, size.saturating_sub(1)),
        (None, Some(suffix)) => {
            if suffix == 0 {
                return Err(RangeError::Malformed);
            }
            (size.saturating_sub(suffix), size.saturating_sub(1))
        }
        (None, None) => return Err(RangeError::Malformed),
    };

    if start >= size {
        return Err(RangeError::Unsatisfiable { size });
    }
    let end = end.min(size - 1);

    ByteRange::new(start, end)
        .map(RangeRequest::Partial)
        .ok_or(RangeError::Malformed)
}

/// Parse one side of a range spec; empty means "omitted".
fn parse_bound(s: &str) -> Result<Option<u64>, RangeError> {
    if s.is_empty() {
        return Ok(None);
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    s.parse().map(Some).map_err(|_| RangeError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(start: u64, end: u64) -> Result<RangeRequest, RangeError> {
        Ok(RangeRequest::Partial(ByteRange::new(start, end).unwrap()))
    }

    #[test]
    fn test_absent_header_is_full() {
        assert_eq!(resolve(None, 1000), Ok(RangeRequest::Full));
        assert_eq!(resolve(None, 0), Ok(RangeRequest::Full));
    }

    #[test]
    fn test_start_end() {
        assert_eq!(resolve(Some("bytes=0-4"), 16), partial(0, 4));
        assert_eq!(resolve(Some("bytes=10-20"), 1000), partial(10, 20));
        assert_eq!(resolve(Some("bytes=999-999"), 1000), partial(999, 999));
    }

    #[test]
    fn test_every_valid_interval_round_trips() {
        let size = 37;
        for start in 0..size {
            for end in start..size {
                let header = format!("bytes={start}-{end}");
                assert_eq!(resolve(Some(&header), size), partial(start, end));
            }
        }
    }

    #[test]
    fn test_end_clamped_to_size() {
        assert_eq!(resolve(Some("bytes=0-100"), 16), partial(0, 15));
    }

    #[test]
    fn test_open_ended() {
        assert_eq!(resolve(Some("bytes=100-"), 1000), partial(100, 999));
        assert_eq!(resolve(Some("bytes=0-"), 1), partial(0, 0));
    }

    #[test]
    fn test_suffix() {
        assert_eq!(resolve(Some("bytes=-100"), 1000), partial(900, 999));
        assert_eq!(resolve(Some("bytes=-100"), 50), partial(0, 49));
        assert_eq!(resolve(Some("bytes=-1"), 50), partial(49, 49));
    }

    #[test]
    fn test_unsatisfiable_start() {
        assert_eq!(
            resolve(Some("bytes=2000-3000"), 1000),
            Err(RangeError::Unsatisfiable { size: 1000 })
        );
        assert_eq!(
            resolve(Some("bytes=1000-"), 1000),
            Err(RangeError::Unsatisfiable { size: 1000 })
        );
        assert_eq!(
            resolve(Some("bytes=1500-2000"), 1000),
            Err(RangeError::Unsatisfiable { size: 1000 })
        );
    }

    #[test]
    fn test_empty_object_rejects_every_range() {
        assert_eq!(
            resolve(Some("bytes=0-"), 0),
            Err(RangeError::Unsatisfiable { size: 0 })
        );
        assert_eq!(
            resolve(Some("bytes=-5"), 0),
            Err(RangeError::Unsatisfiable { size: 0 })
        );
    }

    #[test]
    fn test_malformed() {
        for header in [
            "",
            "bytes=",
            "bytes=-",
            "bytes=abc-def",
            "bytes=5-3",
            "bytes=-0",
            "chars=0-4",
            "bytes=1-2-3",
            "bytes=+1-2",
            "bytes 0-4",
        ] {
            assert_eq!(
                resolve(Some(header), 1000),
                Err(RangeError::Malformed),
                "header {header:?}"
            );
        }
    }

    #[test]
    fn test_only_first_group_of_multi_range_is_used() {
        assert_eq!(resolve(Some("bytes=0-99,200-299"), 1000), partial(0, 99));
        assert_eq!(resolve(Some("bytes=-10, 0-5"), 1000), partial(990, 999));
    }

    #[test]
    fn test_surrounding_whitespace_tolerated() {
        assert_eq!(resolve(Some("  bytes=1-2 "), 10), partial(1, 2));
    }

    #[test]
    fn test_byte_range_helpers() {
        let range = ByteRange::new(500, 999).unwrap();
        assert_eq!(range.len(), 500);
        assert_eq!(range.content_range(1000), "bytes 500-999/1000");
        assert!(ByteRange::new(5, 4).is_none());
        assert_eq!(ByteRange::full(0), None);
        assert_eq!(ByteRange::full(10), ByteRange::new(0, 9));
    }
}
