//! Comment ingress types.
//!
//! A [`Comment`] is the immutable unit of input: one participant contribution
//! with an id, free text, and speaker attribution. The job descriptor's wire
//! shape (`{id, comment, interview}`) is converted to this canonical shape
//! exactly once at the ingress boundary; everything downstream speaks
//! `Comment`.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker attribution used when the wire form carries none.
pub const ANONYMOUS_SPEAKER: &str = "Anonymous";

/// One participant contribution. Immutable once ingested.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    /// Caller-supplied identifier, unique within a run. Never empty.
    pub id: String,
    /// The contribution text. Never empty.
    pub text: String,
    /// Speaker attribution; [`ANONYMOUS_SPEAKER`] when the source had none.
    pub speaker: String,
    /// Optional free-form metadata carried through untouched.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub metadata: FxHashMap<String, Value>,
}

impl Comment {
    /// Build a comment with the given id, text, and speaker.
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        speaker: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            speaker: speaker.into(),
            metadata: FxHashMap::default(),
        }
    }
}

/// Assigns stable numeric ids to speakers in first-appearance order.
///
/// Crux prompts identify participants as `"id:name"` strings; the registry
/// guarantees the same corpus always yields the same ids, which keeps
/// reconciliation (and therefore resumed runs) deterministic.
#[derive(Debug, Default)]
pub struct SpeakerRegistry {
    by_name: FxHashMap<String, u32>,
    ordered: Vec<String>,
}

impl SpeakerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a comment corpus, one id per distinct speaker.
    #[must_use]
    pub fn from_comments(comments: &[Comment]) -> Self {
        let mut registry = Self::new();
        for comment in comments {
            registry.intern(&comment.speaker);
        }
        registry
    }

    /// Return the id for `name`, assigning the next id on first sight.
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = self.ordered.len() as u32 + 1;
        self.by_name.insert(name.to_string(), id);
        self.ordered.push(name.to_string());
        id
    }

    /// Look up an already-assigned id.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    /// The `"id:name"` label used in crux prompts and reconciliation.
    #[must_use]
    pub fn label(&self, name: &str) -> Option<String> {
        self.id_of(name).map(|id| format!("{id}:{name}"))
    }

    /// Number of distinct speakers seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_assigns_ids_in_first_appearance_order() {
        let comments = vec![
            Comment::new("c1", "first", "Alice"),
            Comment::new("c2", "second", "Bob"),
            Comment::new("c3", "third", "Alice"),
        ];
        let registry = SpeakerRegistry::from_comments(&comments);
        assert_eq!(registry.id_of("Alice"), Some(1));
        assert_eq!(registry.id_of("Bob"), Some(2));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.label("Bob").as_deref(), Some("2:Bob"));
    }

    #[test]
    fn registry_is_stable_across_rebuilds() {
        let comments = vec![
            Comment::new("c1", "a", "X"),
            Comment::new("c2", "b", "Y"),
        ];
        let first = SpeakerRegistry::from_comments(&comments);
        let second = SpeakerRegistry::from_comments(&comments);
        assert_eq!(first.id_of("X"), second.id_of("X"));
        assert_eq!(first.id_of("Y"), second.id_of("Y"));
    }
}
