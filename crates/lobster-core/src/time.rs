/// Current UTC timestamp in ISO 8601 format.
pub fn utc_now() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Compact ISO timestamp usable as a ZFS snapshot tag (no colons).
pub fn snapshot_tag() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_now_format() {
        let ts = utc_now();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), 20);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
    }

    #[test]
    fn test_now_ms_is_recent() {
        // Sanity bound: after 2020-01-01 and before 2100.
        let ms = now_ms();
        assert!(ms > 1_577_836_800_000);
        assert!(ms < 4_102_444_800_000);
    }

    #[test]
    fn test_snapshot_tag_has_no_separators() {
        let tag = snapshot_tag();
        assert_eq!(tag.len(), 16);
        assert!(!tag.contains(':'));
        assert!(!tag.contains('-'));
        assert!(tag.ends_with('Z'));
    }
}
