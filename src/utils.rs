use std::time::Duration;
use crate::errors::{Result, StreamError};

/// Parse a duration string like "500ms", "2s", "1m" into a std::time::Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(StreamError::config("Empty duration string"));
    }

    let duration = humantime::parse_duration(s)
        .map_err(|e| StreamError::config(format!("Invalid duration '{}': {}", s, e)))?;

    if duration.is_zero() {
        return Err(StreamError::config("Duration must be positive"));
    }

    Ok(duration)
}

/// Serde adapter so config files can say `refresh_interval = "2s"`.
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        super::parse_duration(&value).map_err(serde::de::Error::custom)
    }
}
