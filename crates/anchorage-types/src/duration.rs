//! Serde adapters that store `Duration` values as whole milliseconds.
//!
//! History and config files are read by humans and by other languages, so
//! durations go over the wire as plain integers rather than serde's default
//! `{ secs, nanos }` struct.

/// Round `value` up to the next whole millisecond, the precision durations
/// are recorded with.
pub fn ceil_millis(value: std::time::Duration) -> std::time::Duration {
    let whole = std::time::Duration::from_millis(u64::try_from(value.as_millis()).unwrap_or(u64::MAX));
    if whole < value {
        whole.saturating_add(std::time::Duration::from_millis(1))
    } else {
        whole
    }
}

/// `Duration` <-> `u64` milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `Option<Duration>` <-> nullable `u64` milliseconds.
pub mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
