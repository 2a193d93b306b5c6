//! Consumer identity normalization and deduplication.
//!
//! A consumer is the logical caller a request is attributed to. Handlers
//! attach one per request; the registry makes sure the display metadata
//! (name and group) of a given consumer is emitted only once per process.

use dashmap::DashSet;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Maximum length of a consumer identifier, in characters
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Maximum length of a consumer name or group, in characters
pub const MAX_NAME_LENGTH: usize = 64;

/// A normalized consumer identity
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Consumer {
    /// Stable identifier of the caller
    pub identifier: String,
    /// Optional display name
    pub name: Option<String>,
    /// Optional group the caller belongs to
    pub group: Option<String>,
}

impl Consumer {
    /// Normalize a consumer, trimming and truncating every field.
    ///
    /// Returns `None` when the identifier is empty after trimming. Names and
    /// groups that are empty after trimming are treated as absent.
    pub fn new(identifier: &str, name: Option<&str>, group: Option<&str>) -> Option<Self> {
        let identifier = truncate(identifier, MAX_IDENTIFIER_LENGTH);
        if identifier.is_empty() {
            return None;
        }

        Some(Self {
            identifier,
            name: name
                .map(|name| truncate(name, MAX_NAME_LENGTH))
                .filter(|name| !name.is_empty()),
            group: group
                .map(|group| truncate(group, MAX_NAME_LENGTH))
                .filter(|group| !group.is_empty()),
        })
    }

    /// Whether the consumer carries any display metadata
    pub fn has_metadata(&self) -> bool {
        self.name.is_some() || self.group.is_some()
    }

    fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.trim().chars().take(max_chars).collect()
}

/// Process-wide memory of consumers whose metadata was already emitted.
///
/// Entries are never evicted: memory grows with the number of distinct
/// (identifier, name, group) triples seen. Each entry is a single `u64`,
/// and forgetting one only causes its name and group to be sent again.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    seen: DashSet<u64>,
}

impl ConsumerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip name and group from consumers that were seen before.
    ///
    /// The first occurrence of a triple keeps its metadata; later ones only
    /// keep the identifier.
    pub fn resolve(&self, mut consumer: Consumer) -> Consumer {
        if consumer.has_metadata() && !self.seen.insert(consumer.content_hash()) {
            consumer.name = None;
            consumer.group = None;
        }
        consumer
    }

    /// Number of distinct consumers recorded so far
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no consumer was recorded yet
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forget every recorded consumer
    pub fn clear(&self) {
        self.seen.clear();
    }
}
