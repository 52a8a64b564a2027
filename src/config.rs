//! Configuration types.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Default broadcast capacity for parcel change events.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Tokens the classifier builds its patterns from.
///
/// Every token is matched literally (it is regex-escaped before use).
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Label that directly precedes the pickup code (whitespace allowed between).
    pub code_label: String,
    /// Labels that directly follow the locker number. Longer labels win.
    pub locker_labels: Vec<String>,
    /// Markers that open the location span ("arrived at" / "at").
    pub location_openers: Vec<String>,
    /// Punctuation that closes the location span and may not occur inside it.
    pub location_terminators: Vec<String>,
    /// Words that also close the location span ("please").
    pub location_closers: Vec<String>,
    /// Phrases that on their own make a message relevant.
    pub marker_phrases: Vec<String>,
    /// Carrier keywords; relevant only together with an arrival keyword.
    pub carrier_keywords: Vec<String>,
    /// Arrival keywords; relevant only together with a carrier keyword.
    pub arrival_keywords: Vec<String>,
    /// Location used when none can be extracted.
    pub unknown_location: String,
    /// Minimum digit run length of a pickup code.
    pub min_code_digits: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            code_label: "取件码".to_string(),
            locker_labels: vec!["号快递柜".to_string(), "号柜".to_string()],
            location_openers: vec!["已到".to_string(), "在".to_string()],
            location_terminators: vec!["，".to_string(), "。".to_string()],
            location_closers: vec!["请".to_string()],
            marker_phrases: vec!["递管家".to_string(), "取件码".to_string()],
            carrier_keywords: vec!["快递".to_string()],
            arrival_keywords: vec!["到".to_string()],
            unknown_location: "未知位置".to_string(),
            min_code_digits: 5,
        }
    }
}

/// Largest accepted change-event buffer. `tokio::sync::broadcast` allocates
/// every slot up front.
pub const MAX_EVENT_CAPACITY: usize = 65_536;

/// Runtime settings for the tracker binary.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Location of the libSQL database file.
    pub db_path: PathBuf,
    /// JSON-lines inbox export to scan.
    pub inbox_path: PathBuf,
    /// Capacity of the change-event broadcast channel.
    pub event_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/pickup-tracker.db"),
            inbox_path: PathBuf::from("./data/inbox.jsonl"),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl TrackerConfig {
    /// Build from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, test map, ...).
    ///
    /// Recognized keys: `PICKUP_DB_PATH`, `PICKUP_INBOX_PATH`, `PICKUP_EVENT_CAPACITY`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("PICKUP_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("PICKUP_INBOX_PATH") {
            config.inbox_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("PICKUP_EVENT_CAPACITY") {
            let capacity: usize = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: "PICKUP_EVENT_CAPACITY".into(),
                message: format!("{e}"),
            })?;
            if !(1..=MAX_EVENT_CAPACITY).contains(&capacity) {
                return Err(ConfigError::InvalidValue {
                    key: "PICKUP_EVENT_CAPACITY".into(),
                    message: format!("must be between 1 and {MAX_EVENT_CAPACITY}"),
                });
            }
            config.event_capacity = capacity;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_set() {
        let config = TrackerConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.db_path, PathBuf::from("./data/pickup-tracker.db"));
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn overrides_paths_and_capacity() {
        let config = TrackerConfig::from_lookup(lookup_from(&[
            ("PICKUP_DB_PATH", "/tmp/p.db"),
            ("PICKUP_INBOX_PATH", "/tmp/inbox.jsonl"),
            ("PICKUP_EVENT_CAPACITY", "16"),
        ]))
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/p.db"));
        assert_eq!(config.inbox_path, PathBuf::from("/tmp/inbox.jsonl"));
        assert_eq!(config.event_capacity, 16);
    }

    #[test]
    fn rejects_bad_capacity() {
        let err = TrackerConfig::from_lookup(lookup_from(&[("PICKUP_EVENT_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = TrackerConfig::from_lookup(lookup_from(&[("PICKUP_EVENT_CAPACITY", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_oversized_capacity() {
        for raw in ["65537", "9223372036854775808"] {
            let err = TrackerConfig::from_lookup(lookup_from(&[("PICKUP_EVENT_CAPACITY", raw)]))
                .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }), "{raw}");
        }

        let config = TrackerConfig::from_lookup(lookup_from(&[(
            "PICKUP_EVENT_CAPACITY",
            "65536",
        )]))
        .unwrap();
        assert_eq!(config.event_capacity, MAX_EVENT_CAPACITY);
    }

    #[test]
    fn parser_defaults_match_courier_format() {
        let config = ParserConfig::default();
        assert_eq!(config.code_label, "取件码");
        assert_eq!(config.min_code_digits, 5);
        assert_eq!(config.unknown_location, "未知位置");
    }
}
