//! Identifier and object-name generation.
//!
//! Folder identifiers look like `07_20240224_161937_1708791577123`:
//!
//! * zero-padded capture counter (resumed from storage on startup),
//! * local calendar date-time of the trigger,
//! * the trigger's logical timestamp in Unix milliseconds.
//!
//! The counter makes names sort in creation order as plain strings up to
//! counter 99; past that the field grows to three digits and
//! [`creation_order`] is the ordering to use.  The trailing timestamp keeps
//! names unique even if the counter is ever reset.

use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local, TimeZone};

use crate::protocol::Role;

/// Build the folder identifier for one capture event.
pub fn folder_id<Tz: TimeZone>(counter: u32, at: &DateTime<Tz>, logical_ts: i64) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{:02}_{}_{}", counter, at.format("%Y%m%d_%H%M%S"), logical_ts)
}

/// Parse the leading counter field of a folder identifier.
///
/// Returns `None` for anything that was not produced by [`folder_id`]
/// (stray directories, temp files, etc.).
pub fn parse_counter(folder: &str) -> Option<u32> {
    let (head, rest) = folder.split_once('_')?;
    if head.is_empty() || !head.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // date field must follow
    let date = rest.get(..8)?;
    if !date.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    head.parse().ok()
}

/// Folder ids by counter, then by name.  Foreign names sort last.
pub fn creation_order(a: &str, b: &str) -> cmp::Ordering {
    match (parse_counter(a), parse_counter(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => cmp::Ordering::Less,
        (None, Some(_)) => cmp::Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Next counter value given the folder names already present in storage.
///
/// One past the highest parsed counter, never below `baseline`.
pub fn next_counter<'a, I>(names: I, baseline: u32) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter_map(parse_counter)
        .max()
        .map(|max| max.saturating_add(1).max(baseline))
        .unwrap_or(baseline)
}

/// Generates session identifiers that are unique and sort in creation order
/// within one process, e.g. `20240224-161937-123-0004`.
#[derive(Debug, Default)]
pub struct SessionIds {
    seq: AtomicU64,
}

impl SessionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        self.next_at(&Local::now())
    }

    pub fn next_at<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:04}", now.format("%Y%m%d-%H%M%S-%3f"), seq)
    }
}

/// Object name for one device's segment of a capture.
///
/// `1708791577123_conductor_3f2a9c1d.mp4` – the capture timestamp first so
/// a folder listing groups by capture, then role and a short device tag.
pub fn segment_filename(logical_ts: i64, role: Role, device_id: &str, extension: &str) -> String {
    let tag: String = device_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    let tag = if tag.is_empty() { "device".to_string() } else { tag };
    format!("{logical_ts}_{role}_{tag}.{}", extension.trim_start_matches('.'))
}

/// Sibling metadata object name for a segment (`<stem>.json`).
pub fn metadata_filename(segment_filename: &str) -> String {
    match segment_filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => format!("{stem}.json"),
        _ => format!("{segment_filename}.json"),
    }
}

/// True if `part` can be used as one path component of an object key.
pub fn is_safe_component(part: &str) -> bool {
    !part.is_empty()
        && part != "."
        && part != ".."
        && !part.contains(['/', '\\', '\0'])
        && !part.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::HashSet;

    #[test]
    fn test_folder_id_format() {
        let at = Utc.with_ymd_and_hms(2024, 2, 24, 16, 19, 37).unwrap();
        let id = folder_id(0, &at, 1_708_791_577_123);
        assert_eq!(id, "00_20240224_161937_1708791577123");

        let id = folder_id(123, &at, 5);
        assert_eq!(id, "123_20240224_161937_5");
    }

    #[test]
    fn test_parse_counter() {
        assert_eq!(parse_counter("00_20240224_161937_1708791577123"), Some(0));
        assert_eq!(parse_counter("17_20240224_161937_1"), Some(17));
        assert_eq!(parse_counter("lost+found"), None);
        assert_eq!(parse_counter("_20240224"), None);
        assert_eq!(parse_counter("ab_20240224_161937_1"), None);
        assert_eq!(parse_counter("3_notadate"), None);
    }

    #[test]
    fn test_next_counter() {
        assert_eq!(next_counter(Vec::<&str>::new(), 0), 0);
        assert_eq!(next_counter(["junk", ".tmp"], 4), 4);
        let names = [
            "00_20240224_161937_1",
            "02_20240224_162000_2",
            "01_20240224_161950_3",
        ];
        assert_eq!(next_counter(names, 0), 3);
        assert_eq!(next_counter(names, 10), 10);
    }

    #[test]
    fn test_folder_ids_unique_over_1000_triggers() {
        let start = Utc.with_ymd_and_hms(2024, 2, 24, 16, 19, 37).unwrap();
        let mut seen = HashSet::new();
        for i in 0..1000u32 {
            let at = start + Duration::milliseconds(i as i64);
            assert!(seen.insert(folder_id(i, &at, at.timestamp_millis())));
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_folder_ids_sort_in_creation_order() {
        let start = Utc.with_ymd_and_hms(2024, 2, 24, 16, 19, 37).unwrap();
        let ids: Vec<String> = (0..50u32)
            .map(|i| {
                let at = start + Duration::seconds(i as i64);
                folder_id(i, &at, at.timestamp_millis())
            })
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_creation_order_past_two_digits() {
        let mut ids = vec![
            "100_20240224_170000_3".to_string(),
            "notes".to_string(),
            "99_20240224_165959_2".to_string(),
            "07_20240224_161937_1".to_string(),
        ];
        ids.sort_by(|a, b| creation_order(a, b));
        assert_eq!(
            ids,
            vec![
                "07_20240224_161937_1",
                "99_20240224_165959_2",
                "100_20240224_170000_3",
                "notes"
            ]
        );
    }

    #[test]
    fn test_session_ids_unique_and_ordered() {
        let gen = SessionIds::new();
        let now = Utc.with_ymd_and_hms(2024, 2, 24, 16, 19, 37).unwrap();
        let a = gen.next_at(&now);
        let b = gen.next_at(&now);
        assert_ne!(a, b);
        assert!(a < b);
        assert!(a.starts_with("20240224-161937-000-"));
    }

    #[test]
    fn test_segment_and_metadata_names() {
        let name = segment_filename(42, Role::Conductor, "3f2a9c1d-aaaa-bbbb", "mp4");
        assert_eq!(name, "42_conductor_3f2a9c1d.mp4");
        assert_eq!(metadata_filename(&name), "42_conductor_3f2a9c1d.json");
        assert_eq!(
            segment_filename(1, Role::Participant, "---", ".webm"),
            "1_participant_device.webm"
        );
        assert_eq!(metadata_filename("noext"), "noext.json");
    }

    #[test]
    fn test_is_safe_component() {
        assert!(is_safe_component("00_20240224_161937_1"));
        assert!(!is_safe_component(".."));
        assert!(!is_safe_component("a/b"));
        assert!(!is_safe_component("a\\b"));
        assert!(!is_safe_component(".hidden"));
        assert!(!is_safe_component(""));
    }
}
