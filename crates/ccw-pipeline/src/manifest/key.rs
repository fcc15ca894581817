//! Manifest descriptor object keys
//!
//! Every batch is announced by a descriptor at
//! `<prefix>/<timestampText>/<sequenceId>_manifest.xml`; its data files sit next
//! to it under the same `<prefix>/<timestampText>/` folder.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;

use crate::error::{PipelineError, PipelineResult};

pub const MANIFEST_SUFFIX: &str = "_manifest.xml";

/// Parsed identity of one manifest descriptor object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestKey {
    prefix: String,
    timestamp_text: String,
    timestamp: DateTime<Utc>,
    sequence_id: u32,
}

impl ManifestKey {
    pub fn new(
        prefix: impl Into<String>,
        timestamp_text: impl Into<String>,
        sequence_id: u32,
    ) -> PipelineResult<Self> {
        let prefix = prefix.into();
        let timestamp_text = timestamp_text.into();
        let timestamp = parse_timestamp(&timestamp_text).ok_or_else(|| {
            PipelineError::manifest_parse(
                format!("{}/{}/{}{}", prefix, timestamp_text, sequence_id, MANIFEST_SUFFIX),
                format!("'{}' is not an RFC 3339 instant", timestamp_text),
            )
        })?;

        Ok(Self {
            prefix,
            timestamp_text,
            timestamp,
            sequence_id,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn timestamp_text(&self) -> &str {
        &self.timestamp_text
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn sequence_id(&self) -> u32 {
        self.sequence_id
    }

    /// Full object key of the descriptor.
    pub fn object_key(&self) -> String {
        format!(
            "{}/{}/{}{}",
            self.prefix, self.timestamp_text, self.sequence_id, MANIFEST_SUFFIX
        )
    }

    /// Object key of a sibling data file.
    pub fn entry_key(&self, file_name: &str) -> String {
        format!("{}/{}/{}", self.prefix, self.timestamp_text, file_name)
    }

    /// The same key moved under another prefix.
    pub fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            ..self.clone()
        }
    }
}

impl Ord for ManifestKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.sequence_id.cmp(&other.sequence_id))
            .then_with(|| self.timestamp_text.cmp(&other.timestamp_text))
            .then_with(|| self.prefix.cmp(&other.prefix))
    }
}

impl PartialOrd for ManifestKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object_key())
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Recognises descriptor keys among the objects listed under a prefix.
#[derive(Debug, Clone)]
pub struct ManifestKeyPattern {
    pattern: Regex,
}

impl ManifestKeyPattern {
    pub fn new() -> PipelineResult<Self> {
        let pattern = Regex::new(r"^(.+)/([^/]+)/(\d+)_manifest\.xml$")
            .map_err(|e| PipelineError::Config(format!("manifest key pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    /// Parse `key` if it names a descriptor directly beneath `prefix`.
    ///
    /// Returns `Ok(None)` for data files and anything nested deeper; a key that
    /// looks like a descriptor but carries an unreadable timestamp is an error.
    pub fn parse(&self, prefix: &str, key: &str) -> PipelineResult<Option<ManifestKey>> {
        let Some(captures) = self.pattern.captures(key) else {
            return Ok(None);
        };

        if &captures[1] != prefix {
            return Ok(None);
        }

        let sequence_id: u32 = captures[3]
            .parse()
            .map_err(|_| PipelineError::manifest_parse(key, "sequence id out of range"))?;

        ManifestKey::new(prefix, &captures[2], sequence_id).map(Some)
    }
}
