//! Core types for the `bqstream` change capture library.
//!
//! This module defines the fundamental types used throughout the library.
//! All types use smart constructors to ensure validity at construction time,
//! following the "parse, don't validate" principle.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The hard ceiling on rows per warehouse insert call.
///
/// Streaming inserts to the warehouse are limited to 10,000 rows per
/// request; every batch the library assembles is capped at this value no
/// matter what batch size is configured.
pub const INSERT_ROW_CEILING: usize = 10_000;

/// The name of a host table enrolled for change capture.
///
/// `TableName` values are guaranteed to be non-empty and at most 255
/// characters. Once constructed, a `TableName` is always valid - no further
/// validation needed.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct TableName(String);

/// The name of a tracked attribute (column) on an enrolled table.
///
/// `AttributeName` values are guaranteed to be non-empty and at most 255
/// characters.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct AttributeName(String);

/// A globally unique identifier for a queued change, using UUIDv7 format.
///
/// `ChangeId` values are guaranteed to be UUIDv7, which provides:
/// - Time-based ordering capability
/// - Globally unique identification
/// - Monotonic sort order for changes captured in sequence
#[nutype(
    validate(predicate = |id: &Uuid| id.get_version() == Some(uuid::Version::SortRand)),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ChangeId(Uuid);

impl ChangeId {
    /// Creates a new `ChangeId` with the current timestamp.
    ///
    /// This is a convenience method that generates a new `UUIDv7`.
    pub fn new() -> Self {
        // This will always succeed as Uuid::now_v7() always returns a valid v7 UUID
        Self::try_new(Uuid::now_v7()).expect("Uuid::now_v7() should always return a valid v7 UUID")
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

/// The configured number of change records drained per dispatch tick.
///
/// Bounded between 1 and [`INSERT_ROW_CEILING`]; the warehouse rejects
/// larger insert calls, so the type refuses to represent them.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct BatchSize(usize);

impl BatchSize {
    /// The default batch size (1000 rows per dispatch tick).
    pub fn default_size() -> Self {
        Self::try_new(1000).expect("1000 is always a valid batch size")
    }

    /// The largest permitted batch size, equal to [`INSERT_ROW_CEILING`].
    pub fn max() -> Self {
        Self::try_new(INSERT_ROW_CEILING).expect("the insert ceiling is always a valid batch size")
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self::default_size()
    }
}

/// A timestamp for when a change was observed or a row was created.
///
/// This wrapper ensures consistent timestamp handling throughout the system
/// and enables future enhancements like custom serialization formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Converts the timestamp into the underlying `DateTime`.
    pub const fn into_datetime(self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl From<Timestamp> for DateTime<Utc> {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.into_datetime()
    }
}

impl AsRef<DateTime<Utc>> for Timestamp {
    fn as_ref(&self) -> &DateTime<Utc> {
        self.as_datetime()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn table_name_accepts_valid_strings(s in "[a-zA-Z0-9_-]{1,255}") {
            let result = TableName::try_new(s.clone());
            prop_assert!(result.is_ok());
            let table = result.unwrap();
            prop_assert_eq!(table.as_ref(), &s);
        }

        #[test]
        fn table_name_trims_whitespace(s in " {0,10}[a-zA-Z0-9_-]{1,240} {0,10}") {
            let result = TableName::try_new(s.clone());
            prop_assert!(result.is_ok());
            let table = result.unwrap();
            prop_assert_eq!(table.as_ref(), s.trim());
        }

        #[test]
        fn table_name_rejects_empty_strings(s in " {0,50}") {
            let result = TableName::try_new(s);
            prop_assert!(result.is_err());
        }

        #[test]
        fn attribute_name_roundtrip_serialization(s in "[a-zA-Z0-9_]{1,255}") {
            let attr = AttributeName::try_new(s).unwrap();
            let json = serde_json::to_string(&attr).unwrap();
            let deserialized: AttributeName = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(attr, deserialized);
        }

        #[test]
        fn batch_size_accepts_values_in_range(n in 1usize..=10_000usize) {
            let result = BatchSize::try_new(n);
            prop_assert!(result.is_ok());
            let size: usize = result.unwrap().into();
            prop_assert_eq!(size, n);
        }

        #[test]
        fn batch_size_rejects_values_over_ceiling(n in 10_001usize..=100_000usize) {
            let result = BatchSize::try_new(n);
            prop_assert!(result.is_err());
        }

        #[test]
        fn change_id_ordering_is_consistent(uuid_bytes1 in any::<[u8; 16]>(), uuid_bytes2 in any::<[u8; 16]>()) {
            // Create two valid v7 UUIDs by forcing version and variant bits
            let mut bytes1 = uuid_bytes1;
            bytes1[6] = (bytes1[6] & 0x0F) | 0x70;
            bytes1[8] = (bytes1[8] & 0x3F) | 0x80;

            let mut bytes2 = uuid_bytes2;
            bytes2[6] = (bytes2[6] & 0x0F) | 0x70;
            bytes2[8] = (bytes2[8] & 0x3F) | 0x80;

            let id1 = ChangeId::try_new(Uuid::from_bytes(bytes1)).unwrap();
            let id2 = ChangeId::try_new(Uuid::from_bytes(bytes2)).unwrap();

            if id1 < id2 {
                prop_assert!(id2 >= id1);
            }
            if id1 == id2 {
                prop_assert!(id1 >= id2 && id2 >= id1);
            }
        }

        #[test]
        fn timestamp_ordering_matches_datetime_ordering(
            secs1 in i64::MIN/1000..i64::MAX/1000,
            nanos1 in 0u32..1_000_000_000u32,
            secs2 in i64::MIN/1000..i64::MAX/1000,
            nanos2 in 0u32..1_000_000_000u32
        ) {
            use chrono::TimeZone;

            if let (Some(dt1), Some(dt2)) = (
                Utc.timestamp_opt(secs1, nanos1).single(),
                Utc.timestamp_opt(secs2, nanos2).single()
            ) {
                let ts1 = Timestamp::new(dt1);
                let ts2 = Timestamp::new(dt2);

                prop_assert_eq!(ts1 < ts2, dt1 < dt2);
                prop_assert_eq!(ts1 == ts2, dt1 == dt2);
                prop_assert_eq!(ts1 > ts2, dt1 > dt2);
            }
        }
    }

    #[test]
    fn batch_size_default_is_one_thousand() {
        let size: usize = BatchSize::default().into();
        assert_eq!(size, 1000);
    }

    #[test]
    fn batch_size_max_equals_insert_ceiling() {
        let size: usize = BatchSize::max().into();
        assert_eq!(size, INSERT_ROW_CEILING);
    }

    #[test]
    fn batch_size_rejects_zero() {
        assert!(BatchSize::try_new(0).is_err());
    }

    #[test]
    fn change_id_new_creates_valid_v7() {
        let change_id = ChangeId::new();
        assert_eq!(
            change_id.as_ref().get_version(),
            Some(uuid::Version::SortRand)
        );
    }

    #[test]
    fn change_id_default_creates_new() {
        let id1 = ChangeId::default();
        let id2 = ChangeId::default();
        // They should be different (extremely high probability)
        assert_ne!(id1, id2);
    }

    #[test]
    fn table_name_rejects_specific_invalid_cases() {
        assert!(TableName::try_new("").is_err());
        assert!(TableName::try_new("   ").is_err());

        let long_string = "a".repeat(256);
        assert!(TableName::try_new(long_string).is_err());

        let max_string = "a".repeat(255);
        assert!(TableName::try_new(max_string).is_ok());
    }

    #[test]
    fn timestamp_now_creates_current_time() {
        let before = Utc::now();
        let timestamp = Timestamp::now();
        let after = Utc::now();

        assert!(timestamp.as_datetime() >= &before);
        assert!(timestamp.as_datetime() <= &after);
    }
}
