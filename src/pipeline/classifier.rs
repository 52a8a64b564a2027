//! Parcel message classifier and field extractor.
//!
//! Pure, synchronous pattern matching over a single message:
//! - `is_relevant()` is a cheap, permissive pre-filter
//! - `extract()` pulls pickup code, locker number and location
//!
//! Every pattern uses first-match semantics (leftmost occurrence wins).
//! Pickup code and locker number are required; location falls back to the
//! configured unknown-location sentinel.

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::debug;

use crate::config::ParserConfig;
use crate::error::ConfigError;
use crate::parcels::ParcelRecord;
use crate::pipeline::types::{Classification, MissingField, RawMessage};

/// Bracketed sender signature, e.g. `【丰巢】`.
const SENDER_PATTERN: &str = r"【([^】]+)】";

/// Compiled classifier for parcel pickup messages.
#[derive(Debug, Clone)]
pub struct Classifier {
    code_regex: Regex,
    locker_regex: Regex,
    location_regex: Regex,
    sender_regex: Regex,
    marker_phrases: Vec<String>,
    carrier_keywords: Vec<String>,
    arrival_keywords: Vec<String>,
    unknown_location: String,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(ParserConfig::default()).expect("default parser patterns are valid")
    }
}

impl Classifier {
    /// Compile a classifier from parser tokens.
    pub fn new(config: ParserConfig) -> Result<Self, ConfigError> {
        validate(&config)?;

        let code_regex = Regex::new(&format!(
            r"{}\s*([0-9]{{{},}})",
            regex::escape(&config.code_label),
            config.min_code_digits
        ))?;

        let locker_regex = Regex::new(&format!(
            r"([0-9]+)(?:{})",
            alternation(&config.locker_labels)
        ))?;

        let stop_chars: String = config
            .location_terminators
            .iter()
            .map(|t| regex::escape(t))
            .collect();
        let closers: Vec<String> = config
            .location_terminators
            .iter()
            .chain(config.location_closers.iter())
            .cloned()
            .collect();
        let body = if stop_chars.is_empty() {
            ".+?".to_string()
        } else {
            format!("[^{stop_chars}]+?")
        };
        let location_regex = Regex::new(&format!(
            r"(?:{})({})(?:{})",
            alternation(&config.location_openers),
            body,
            alternation(&closers)
        ))?;

        Ok(Self {
            code_regex,
            locker_regex,
            location_regex,
            sender_regex: Regex::new(SENDER_PATTERN)?,
            marker_phrases: config.marker_phrases,
            carrier_keywords: config.carrier_keywords,
            arrival_keywords: config.arrival_keywords,
            unknown_location: config.unknown_location,
        })
    }

    /// Permissive relevance check.
    ///
    /// True when the message carries a labelled pickup code, contains a
    /// marker phrase, or mentions both a carrier and an arrival keyword.
    pub fn is_relevant(&self, message: &str) -> bool {
        self.code_regex.is_match(message)
            || contains_any(message, &self.marker_phrases)
            || (contains_any(message, &self.carrier_keywords)
                && contains_any(message, &self.arrival_keywords))
    }

    /// Extract a pending candidate record, or `None` when a required field
    /// is missing. Independent of [`Classifier::is_relevant`].
    pub fn extract(&self, message: &str, received_at: DateTime<Utc>) -> Option<ParcelRecord> {
        self.try_extract(message, received_at).ok()
    }

    /// Full verdict for one message: relevance filter, then extraction.
    pub fn classify(&self, message: &RawMessage) -> Classification {
        if !self.is_relevant(&message.text) {
            return Classification::NotRelevant;
        }
        match self.try_extract(&message.text, message.received_at) {
            Ok(record) => Classification::Parcel(record),
            Err(missing) => {
                debug!(
                    missing = ?missing,
                    sender = self.sender(&message.text).unwrap_or("-"),
                    "Relevant message without required field"
                );
                Classification::Incomplete { missing }
            }
        }
    }

    /// Bracketed sender signature, if any. Not stored on the record.
    pub fn sender<'a>(&self, message: &'a str) -> Option<&'a str> {
        first_capture(&self.sender_regex, message)
    }

    pub fn pickup_code<'a>(&self, message: &'a str) -> Option<&'a str> {
        first_capture(&self.code_regex, message)
    }

    pub fn locker_number<'a>(&self, message: &'a str) -> Option<&'a str> {
        first_capture(&self.locker_regex, message)
    }

    pub fn location<'a>(&self, message: &'a str) -> Option<&'a str> {
        first_capture(&self.location_regex, message)
    }

    fn try_extract(
        &self,
        message: &str,
        received_at: DateTime<Utc>,
    ) -> Result<ParcelRecord, MissingField> {
        let code = self.pickup_code(message).ok_or(MissingField::PickupCode)?;
        let locker = self
            .locker_number(message)
            .ok_or(MissingField::LockerNumber)?;
        let location = self
            .location(message)
            .unwrap_or(self.unknown_location.as_str());

        Ok(ParcelRecord::candidate(
            code,
            locker,
            location,
            message,
            received_at,
        ))
    }
}

fn validate(config: &ParserConfig) -> Result<(), ConfigError> {
    let invalid = |key: &str, message: &str| ConfigError::InvalidValue {
        key: key.into(),
        message: message.into(),
    };
    if config.code_label.is_empty() {
        return Err(invalid("code_label", "must not be empty"));
    }
    if config.min_code_digits == 0 {
        return Err(invalid("min_code_digits", "must be greater than zero"));
    }
    if !has_tokens(&config.locker_labels) {
        return Err(invalid("locker_labels", "needs at least one label"));
    }
    if !has_tokens(&config.location_openers) {
        return Err(invalid("location_openers", "needs at least one marker"));
    }
    if !has_tokens(&config.location_terminators) && !has_tokens(&config.location_closers) {
        return Err(invalid(
            "location_terminators",
            "needs at least one terminator or closer",
        ));
    }
    if config
        .location_terminators
        .iter()
        .any(|t| t.chars().count() != 1)
    {
        return Err(invalid(
            "location_terminators",
            "terminators must be single characters",
        ));
    }
    Ok(())
}

fn has_tokens(tokens: &[String]) -> bool {
    tokens.iter().any(|t| !t.is_empty())
}

/// Escaped alternation, longest token first so a longer label is preferred.
fn alternation(tokens: &[String]) -> String {
    let mut tokens: Vec<&String> = tokens.iter().filter(|t| !t.is_empty()).collect();
    tokens.sort_by(|a, b| b.len().cmp(&a.len()));
    tokens
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|")
}

fn contains_any(message: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|n| !n.is_empty() && message.contains(n.as_str()))
}

fn first_capture<'a>(regex: &Regex, message: &'a str) -> Option<&'a str> {
    regex
        .captures(message)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
