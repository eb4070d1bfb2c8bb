//! Byte-range and conditional-request evaluation for cached blobs.
//!
//! Upstream clients resume multi-gigabyte downloads with `Range` requests
//! and validate resumption with `If-Range` / `If-None-Match` against the
//! blob's strong ETag, which is simply the quoted digest. This module is
//! pure: it looks at request headers and the blob size and decides what to
//! serve; the registry handlers do the serving.

use axum::http::{header, HeaderMap};

/// What a conditional/ranged blob request should be answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOutcome {
    /// `If-None-Match` matched the ETag: 304, no body.
    NotModified,
    /// Serve the whole blob with 200.
    Full,
    /// Serve `[start..=end]` with 206.
    Partial { start: u64, end: u64 },
    /// The requested range cannot be satisfied: 416.
    Unsatisfiable,
}

/// Evaluate the conditional and range headers against a blob of `size`
/// bytes whose strong ETag is `etag`.
///
/// Range grammar is `bytes=<start>-<end>` with either endpoint optional:
/// a missing start defaults to 0 and a missing end to `size - 1`. An
/// `If-Range` value that does not equal the ETag downgrades the request to
/// a full response rather than failing it.
pub fn evaluate(headers: &HeaderMap, size: u64, etag: &str) -> RangeOutcome {
    if let Some(inm) = header_str(headers, header::IF_NONE_MATCH) {
        if inm == etag {
            return RangeOutcome::NotModified;
        }
    }

    let Some(range) = header_str(headers, header::RANGE) else {
        return RangeOutcome::Full;
    };

    if let Some(if_range) = header_str(headers, header::IF_RANGE) {
        if if_range != etag {
            return RangeOutcome::Full;
        }
    }

    let Some(spec) = range.strip_prefix("bytes=") else {
        // Unknown range unit; serve the full representation.
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        // Multipart ranges are not supported; a full 200 is always valid.
        return RangeOutcome::Full;
    }
    let Some((start_str, end_str)) = spec.split_once('-') else {
        return RangeOutcome::Full;
    };

    let start = if start_str.trim().is_empty() {
        0
    } else {
        match start_str.trim().parse::<u64>() {
            Ok(n) => n,
            Err(_) => return RangeOutcome::Unsatisfiable,
        }
    };
    let end = if end_str.trim().is_empty() {
        size.saturating_sub(1)
    } else {
        match end_str.trim().parse::<u64>() {
            Ok(n) => n,
            Err(_) => return RangeOutcome::Unsatisfiable,
        }
    };

    if end >= size || start > end {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Partial { start, end }
}

/// `Content-Range` value for a satisfied partial response.
pub fn content_range(start: u64, end: u64, size: u64) -> String {
    format!("bytes {start}-{end}/{size}")
}

/// `Content-Range` value for a 416 response.
pub fn unsatisfiable_content_range(size: u64) -> String {
    format!("bytes */{size}")
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SIZE: u64 = 10 * 1024 * 1024;
    const ETAG: &str = "\"sha256:abc\"";

    fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_no_headers_serves_full() {
        assert_eq!(evaluate(&HeaderMap::new(), SIZE, ETAG), RangeOutcome::Full);
    }

    #[test]
    fn test_if_none_match_hit() {
        let h = headers(&[(header::IF_NONE_MATCH, ETAG)]);
        assert_eq!(evaluate(&h, SIZE, ETAG), RangeOutcome::NotModified);
    }

    #[test]
    fn test_if_none_match_miss_serves_full() {
        let h = headers(&[(header::IF_NONE_MATCH, "\"sha256:other\"")]);
        assert_eq!(evaluate(&h, SIZE, ETAG), RangeOutcome::Full);
    }

    #[test]
    fn test_interior_range() {
        let h = headers(&[(header::RANGE, "bytes=1048576-2097151")]);
        assert_eq!(
            evaluate(&h, SIZE, ETAG),
            RangeOutcome::Partial {
                start: 1048576,
                end: 2097151
            }
        );
    }

    #[test]
    fn test_open_ended_range_defaults_to_last_byte() {
        let h = headers(&[(header::RANGE, "bytes=100-")]);
        assert_eq!(
            evaluate(&h, SIZE, ETAG),
            RangeOutcome::Partial {
                start: 100,
                end: SIZE - 1
            }
        );
    }

    #[test]
    fn test_open_start_defaults_to_zero() {
        let h = headers(&[(header::RANGE, "bytes=-4095")]);
        assert_eq!(
            evaluate(&h, SIZE, ETAG),
            RangeOutcome::Partial {
                start: 0,
                end: 4095
            }
        );
    }

    #[test]
    fn test_range_past_end_is_unsatisfiable() {
        let h = headers(&[(header::RANGE, "bytes=20000000-20000001")]);
        assert_eq!(evaluate(&h, SIZE, ETAG), RangeOutcome::Unsatisfiable);
    }

    #[test]
    fn test_inverted_range_is_unsatisfiable() {
        let h = headers(&[(header::RANGE, "bytes=2-1")]);
        assert_eq!(evaluate(&h, SIZE, ETAG), RangeOutcome::Unsatisfiable);
    }

    #[test]
    fn test_garbage_endpoint_is_unsatisfiable() {
        let h = headers(&[(header::RANGE, "bytes=abc-def")]);
        assert_eq!(evaluate(&h, SIZE, ETAG), RangeOutcome::Unsatisfiable);
    }

    #[test]
    fn test_unknown_unit_serves_full() {
        let h = headers(&[(header::RANGE, "items=0-4")]);
        assert_eq!(evaluate(&h, SIZE, ETAG), RangeOutcome::Full);
    }

    #[test]
    fn test_multipart_range_serves_full() {
        let h = headers(&[(header::RANGE, "bytes=0-1,5-9")]);
        assert_eq!(evaluate(&h, SIZE, ETAG), RangeOutcome::Full);
    }

    #[test]
    fn test_if_range_mismatch_downgrades_to_full() {
        let h = headers(&[
            (header::RANGE, "bytes=0-99"),
            (header::IF_RANGE, "\"sha256:stale\""),
        ]);
        assert_eq!(evaluate(&h, SIZE, ETAG), RangeOutcome::Full);
    }

    #[test]
    fn test_if_range_match_honors_range() {
        let h = headers(&[(header::RANGE, "bytes=0-99"), (header::IF_RANGE, ETAG)]);
        assert_eq!(
            evaluate(&h, SIZE, ETAG),
            RangeOutcome::Partial { start: 0, end: 99 }
        );
    }

    #[test]
    fn test_any_range_on_empty_blob_is_unsatisfiable() {
        let h = headers(&[(header::RANGE, "bytes=0-")]);
        assert_eq!(evaluate(&h, 0, ETAG), RangeOutcome::Unsatisfiable);
    }

    #[test]
    fn test_content_range_formatting() {
        assert_eq!(content_range(0, 99, 1000), "bytes 0-99/1000");
        assert_eq!(unsatisfiable_content_range(1000), "bytes */1000");
    }
}
