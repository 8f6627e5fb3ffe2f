use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Submission fields compared on every re-import.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Title,
    Description,
    Abstract,
    Track,
    SessionType,
    Language,
    DoNotRecord,
    Room,
    Start,
    End,
}

impl TrackedField {
    pub const ALL: [TrackedField; 10] = [
        Self::Title,
        Self::Description,
        Self::Abstract,
        Self::Track,
        Self::SessionType,
        Self::Language,
        Self::DoNotRecord,
        Self::Room,
        Self::Start,
        Self::End,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Abstract => "abstract",
            Self::Track => "track",
            Self::SessionType => "session_type",
            Self::Language => "language",
            Self::DoNotRecord => "do_not_record",
            Self::Room => "room",
            Self::Start => "start",
            Self::End => "end",
        }
    }
}

impl std::fmt::Display for TrackedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrackedField {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown tracked field: {s}"))
    }
}

/// Old and new value of one field. `None` stands for "unset" (e.g. no track).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Option<String>,
    pub new: Option<String>,
}

/// External code → field → (old, new).
///
/// Every previously imported submission seen in a pass has an entry, empty
/// when nothing changed. Submissions created by the pass have none.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeReport(BTreeMap<String, BTreeMap<TrackedField, FieldChange>>);

impl ChangeReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a previously imported submission, with or without changes.
    pub fn touch(&mut self, code: &str) {
        self.0.entry(code.to_string()).or_default();
    }

    pub fn record(
        &mut self,
        code: &str,
        field: TrackedField,
        old: Option<String>,
        new: Option<String>,
    ) {
        self.0
            .entry(code.to_string())
            .or_default()
            .insert(field, FieldChange { old, new });
    }

    pub fn get(&self, code: &str) -> Option<&BTreeMap<TrackedField, FieldChange>> {
        self.0.get(code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries that carry at least one field change.
    pub fn changed(&self) -> impl Iterator<Item = (&str, &BTreeMap<TrackedField, FieldChange>)> {
        self.0
            .iter()
            .filter(|(_, fields)| !fields.is_empty())
            .map(|(code, fields)| (code.as_str(), fields))
    }

    pub fn total_changes(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeMap<TrackedField, FieldChange>)> {
        self.0.iter().map(|(code, fields)| (code.as_str(), fields))
    }
}
