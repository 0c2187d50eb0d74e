//! Tag algebra (spec §4.2): encodes, decodes and merges per-row version sets.
//!
//! A `Tag` identifies a single write event by a single node at a single
//! moment. Tag *sets* are unordered; equality and arithmetic are by set
//! contents, not encoding order. This module generalizes the teacher
//! crate's HLC string comparison (`merge::parse_hlc`/`should_overwrite`)
//! into the clientId@timestamp tag used by the shadow-tag CRDT.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SatelliteError};

/// A single write-event identifier: `clientId@ISO8601Timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag {
    client_id: String,
    timestamp: DateTime<Utc>,
}

impl Tag {
    pub fn new(client_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            client_id: client_id.into(),
            timestamp,
        }
    }

    /// `generate(clientId, t) = "clientId@t.iso"`.
    pub fn generate(client_id: &str, timestamp: DateTime<Utc>) -> Self {
        Self::new(client_id, timestamp)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.client_id,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

impl TryFrom<String> for Tag {
    type Error = SatelliteError;

    fn try_from(value: String) -> Result<Self> {
        Tag::parse(&value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.to_string()
    }
}

impl Tag {
    pub fn parse(s: &str) -> Result<Self> {
        let (client_id, ts) = s
            .rsplit_once('@')
            .ok_or_else(|| SatelliteError::Internal(format!("malformed tag: {s}")))?;
        let timestamp = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| SatelliteError::Internal(format!("malformed tag timestamp {ts}: {e}")))?
            .with_timezone(&Utc);
        Ok(Tag::new(client_id.to_string(), timestamp))
    }
}

/// An unordered set of tags. Serializes as a JSON array of tag strings
/// (spec §3: "Tag set"); order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(tag: Tag) -> Self {
        let mut s = BTreeSet::new();
        s.insert(tag);
        Self(s)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, tag: &Tag) -> bool {
        self.0.contains(tag)
    }

    pub fn insert(&mut self, tag: Tag) -> bool {
        self.0.insert(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.0.iter()
    }

    pub fn into_iter_vec(self) -> Vec<Tag> {
        self.0.into_iter().collect()
    }

    /// `merge(a, b) = a ∪ b`.
    pub fn merge(&self, other: &TagSet) -> TagSet {
        TagSet(self.0.union(&other.0).cloned().collect())
    }

    /// `difference(a, b) = a \ b`.
    pub fn difference(&self, other: &TagSet) -> TagSet {
        TagSet(self.0.difference(&other.0).cloned().collect())
    }

    /// `encode(set) = JSON.stringify(array of tag strings)`.
    pub fn encode(&self) -> Result<String> {
        let strings: Vec<String> = self.0.iter().map(|t| t.to_string()).collect();
        Ok(serde_json::to_string(&strings)?)
    }

    /// Inverse of `encode`.
    pub fn decode(raw: &str) -> Result<Self> {
        let strings: Vec<String> = serde_json::from_str(raw)?;
        let mut set = BTreeSet::new();
        for s in strings {
            set.insert(Tag::parse(&s)?);
        }
        Ok(TagSet(set))
    }

    /// The most-recent tag by timestamp, ties broken by clientId lex order
    /// (spec §4.4 step 4, §9 open question: the column-wise tie-break rule
    /// is applied wherever a single "latest writer" must be picked from a
    /// tag set).
    pub fn latest(&self) -> Option<&Tag> {
        self.0
            .iter()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.client_id.cmp(&b.client_id)))
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        TagSet(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(client_id: &str, millis: i64) -> Tag {
        Tag::generate(client_id, DateTime::from_timestamp_millis(millis).unwrap())
    }

    #[test]
    fn tag_round_trips_through_display_and_parse() {
        let tag = t("client-a", 1_700_000_000_000);
        let s = tag.to_string();
        let parsed = Tag::parse(&s).unwrap();
        assert_eq!(tag, parsed);
    }

    #[test]
    fn tag_set_encode_decode_round_trip() {
        let mut set = TagSet::new();
        set.insert(t("a", 1));
        set.insert(t("b", 2));
        let encoded = set.encode().unwrap();
        let decoded = TagSet::decode(&encoded).unwrap();
        assert_eq!(set, decoded);
    }

    #[test]
    fn merge_is_union_and_difference_removes_cleared() {
        let a = TagSet::from_iter([t("a", 1), t("b", 2)]);
        let b = TagSet::from_iter([t("b", 2), t("c", 3)]);
        let merged = a.merge(&b);
        assert_eq!(merged.len(), 3);

        let cleared = TagSet::single(t("b", 2));
        let remaining = merged.difference(&cleared);
        assert_eq!(remaining.len(), 2);
        assert!(!remaining.contains(&t("b", 2)));
    }

    #[test]
    fn latest_breaks_ties_by_client_id() {
        let set = TagSet::from_iter([t("zeta", 5), t("alpha", 5)]);
        assert_eq!(set.latest().unwrap().client_id(), "zeta");
    }
}
