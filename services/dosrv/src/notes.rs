//! `key=value;key=value` notes carried on queued commands
//!
//! Producers put the command origin in `source=` and may override the write
//! register with `reg=`. Keys are case-insensitive and the first occurrence of
//! a key wins.

use std::fmt;

pub const DEFAULT_SOURCE: &str = "system";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Notes {
    entries: Vec<(String, String)>,
}

impl Notes {
    pub fn parse(text: &str) -> Self {
        let mut notes = Self::default();
        for segment in text.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let Some((key, value)) = segment.split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            if key.is_empty() || notes.get(&key).is_some() {
                continue;
            }
            notes.entries.push((key, value.trim().to_string()));
        }
        notes
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        let key = key.trim().to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Write register override; ignored unless it parses as a 16-bit address
    pub fn register_override(&self) -> Option<u16> {
        self.get("reg").and_then(|v| v.parse::<u16>().ok())
    }

    pub fn source(&self) -> &str {
        match self.get("source") {
            Some(source) if !source.is_empty() => source,
            _ => DEFAULT_SOURCE,
        }
    }

    /// Commands enqueued by the enforcement loop carry `source=auto_*`
    pub fn is_automatic(&self) -> bool {
        self.source().starts_with("auto_")
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Notes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
