//! Serialization helpers for configuration types
//!
//! Durations in Breakwater config records serialize as integer milliseconds
//! for JSON/TOML compatibility.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Custom serialization module for `Duration` as milliseconds.
///
/// # Usage
/// ```rust
/// use std::time::Duration;
///
/// use breakwater_resilience::serde_util::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_millis")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_millis {
    use super::*;

    /// Serialize a `Duration` as milliseconds (u64).
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserialize milliseconds (u64) into a `Duration`.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Like [`duration_millis`], for optional durations.
pub mod duration_millis_opt {
    use super::*;

    /// Serialize an `Option<Duration>` as milliseconds (u64) or null.
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize milliseconds (u64) or null into an `Option<Duration>`.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct TestStruct {
        #[serde(with = "duration_millis")]
        timeout: Duration,
        #[serde(with = "duration_millis_opt", default)]
        budget: Option<Duration>,
    }

    #[test]
    fn test_duration_millis_serialize() {
        let data =
            TestStruct { timeout: Duration::from_millis(1500), budget: Some(Duration::from_secs(2)) };

        let json = serde_json::to_string(&data).expect("should serialize");
        assert!(json.contains("1500"));
        assert!(json.contains("2000"));
    }

    #[test]
    fn test_duration_millis_roundtrip() {
        let data = TestStruct { timeout: Duration::from_millis(250), budget: None };

        let json = serde_json::to_string(&data).expect("should serialize");
        let back: TestStruct = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back, data);
    }

    #[test]
    fn test_missing_optional_duration_defaults_to_none() {
        let back: TestStruct =
            serde_json::from_str(r#"{"timeout": 100}"#).expect("should deserialize");
        assert_eq!(back.budget, None);
    }
}
