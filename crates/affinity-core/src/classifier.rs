//! Thread classification.
//!
//! Maps a running thread to its [`Category`] purely from the thread's name and
//! the configured naming convention. There are no fallback heuristics: a thread
//! without a name is always [`Category::Other`].

use affinity_audit_types::Category;
use serde::{Deserialize, Serialize};

/// Default marker naming Owner threads.
pub const DEFAULT_OWNER_MARKER: &str = "CONTRACT_WORKER";

/// How the configured marker is compared against a thread name.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// The thread name must equal the marker.
    Exact,
    /// The thread name must start with the marker.
    #[default]
    Prefix,
}

impl MatchMode {
    /// Parse from string (case-insensitive). Unknown values fall back to prefix.
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" | "equals" | "eq" => Self::Exact,
            _ => Self::Prefix,
        }
    }
}

/// Pure, shareable thread classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadClassifier {
    marker: String,
    mode: MatchMode,
}

impl Default for ThreadClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_OWNER_MARKER, MatchMode::default())
    }
}

impl ThreadClassifier {
    pub fn new(marker: impl Into<String>, mode: MatchMode) -> Self {
        Self {
            marker: marker.into(),
            mode,
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Classify a thread by name.
    pub fn classify(&self, thread_name: Option<&str>) -> Category {
        let Some(name) = thread_name else {
            return Category::Other;
        };
        let is_owner = match self.mode {
            MatchMode::Exact => name == self.marker,
            MatchMode::Prefix => !self.marker.is_empty() && name.starts_with(&self.marker),
        };
        if is_owner {
            Category::Owner
        } else {
            Category::Other
        }
    }

    /// Classify the calling OS thread.
    pub fn classify_current(&self) -> Category {
        self.classify(std::thread::current().name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_mode() {
        let classifier = ThreadClassifier::new("RSM-Thread-", MatchMode::Prefix);
        assert_eq!(classifier.classify(Some("RSM-Thread-1")), Category::Owner);
        assert_eq!(classifier.classify(Some("RSM-Thread-")), Category::Owner);
        assert_eq!(classifier.classify(Some("Worker-Thread-1")), Category::Other);
        assert_eq!(classifier.classify(Some("xRSM-Thread-1")), Category::Other);
    }

    #[test]
    fn test_exact_mode() {
        let classifier = ThreadClassifier::new("CONTRACT_WORKER", MatchMode::Exact);
        assert_eq!(classifier.classify(Some("CONTRACT_WORKER")), Category::Owner);
        assert_eq!(classifier.classify(Some("CONTRACT_WORKER-2")), Category::Other);
    }

    #[test]
    fn test_unnamed_and_empty_marker() {
        let classifier = ThreadClassifier::default();
        assert_eq!(classifier.classify(None), Category::Other);

        let empty = ThreadClassifier::new("", MatchMode::Prefix);
        assert_eq!(empty.classify(Some("anything")), Category::Other);
    }

    #[test]
    fn test_classify_current_thread() {
        let classifier = ThreadClassifier::new("owner-", MatchMode::Prefix);
        let category = std::thread::Builder::new()
            .name("owner-7".into())
            .spawn(move || classifier.classify_current())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(category, Category::Owner);
    }

    #[test]
    fn test_match_mode_parsing() {
        assert_eq!(MatchMode::from_str_loose("EXACT"), MatchMode::Exact);
        assert_eq!(MatchMode::from_str_loose("prefix"), MatchMode::Prefix);
        assert_eq!(MatchMode::from_str_loose("bogus"), MatchMode::Prefix);
    }
}
