//! In-memory representation of all flag definitions used for local evaluation.
//!
//! A [`Snapshot`] is immutable once constructed. It is replaced completely on refresh and never
//! patched field-by-field.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form payload delivered alongside a variant assignment.
pub type Attachment = HashMap<String, serde_json::Value>;

/// A complete, point-in-time copy of all flag definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Flags keyed by flag id.
    pub flags: HashMap<i64, Flag>,
    /// Unix timestamp (milliseconds) when the snapshot was fetched.
    pub fetched_at: i64,
    /// Time-to-live in milliseconds. Zero or negative means the snapshot never expires.
    pub ttl_ms: i64,
    /// Opaque revision tag reported by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl Snapshot {
    /// Create a snapshot stamped with the current time.
    pub fn new(flags: impl IntoIterator<Item = Flag>, ttl_ms: i64) -> Snapshot {
        Snapshot {
            flags: flags.into_iter().map(|flag| (flag.id, flag)).collect(),
            fetched_at: Utc::now().timestamp_millis(),
            ttl_ms,
            revision: None,
        }
    }

    /// Return `true` if the snapshot outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp_millis())
    }

    /// Same as [`Snapshot::is_expired`] but against an explicit `now` (unix milliseconds).
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        if self.ttl_ms <= 0 {
            return false;
        }
        now_ms.saturating_sub(self.fetched_at) > self.ttl_ms
    }

    /// Age of the snapshot in milliseconds.
    pub fn age_ms(&self) -> i64 {
        Utc::now().timestamp_millis().saturating_sub(self.fetched_at)
    }

    /// Fetch time as a timestamp. `None` if `fetched_at` is out of range.
    pub fn fetched_at_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.fetched_at)
    }

    /// Find a flag by its key.
    pub fn flag_by_key(&self, key: &str) -> Option<&Flag> {
        self.flags.values().find(|flag| flag.key == key)
    }

    /// Find a flag by its id.
    pub fn flag_by_id(&self, id: i64) -> Option<&Flag> {
        self.flags.get(&id)
    }

    /// Number of flags in the snapshot.
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// Return `true` if the snapshot holds no flags.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Flag {
    pub id: i64,
    pub key: String,
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub entity_type: String,
    /// Segments in definition order. Evaluation sorts them by rank.
    #[serde(default)]
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

impl Flag {
    /// Find a variant of this flag by id.
    pub fn variant(&self, id: i64) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.id == id)
    }
}

/// An ordered, constraint-gated rollout rule within a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[allow(missing_docs)]
    pub id: i64,
    /// Owning flag.
    #[serde(rename = "flagID")]
    pub flag_id: i64,
    /// Evaluation order, ascending.
    pub rank: i64,
    /// Share of matching entities admitted to this segment, 0..=100.
    pub rollout_percent: i64,
    /// Implicit AND.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub distributions: Vec<Distribution>,
    #[serde(default)]
    #[allow(missing_docs)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Constraint {
    pub id: i64,
    pub property: String,
    pub operator: ConstraintOperator,
    #[serde(default)]
    pub value: String,
}

/// Comparison applied by a [`Constraint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ConstraintOperator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Notin,
    Contains,
    Notcontains,
    Ereg,
    Nereg,
    /// Operator introduced by a newer server, or missing. Never matches.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A variant's share of rollout traffic within a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Distribution {
    pub id: i64,
    #[serde(rename = "variantID")]
    pub variant_id: i64,
    #[serde(default)]
    pub variant_key: String,
    pub percent: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Variant {
    pub id: i64,
    #[serde(rename = "flagID")]
    pub flag_id: i64,
    pub key: String,
    #[serde(default)]
    pub attachment: Attachment,
}

#[cfg(test)]
mod tests {
    use super::{ConstraintOperator, Flag, Snapshot};

    fn flag(id: i64, key: &str) -> Flag {
        Flag {
            id,
            key: key.to_owned(),
            enabled: true,
            description: String::new(),
            entity_type: String::new(),
            segments: vec![],
            variants: vec![],
        }
    }

    #[test]
    fn never_expires_without_ttl() {
        let mut snapshot = Snapshot::new([], 0);
        snapshot.fetched_at = 0;
        assert!(!snapshot.is_expired_at(i64::MAX));

        snapshot.ttl_ms = -5;
        assert!(!snapshot.is_expired_at(i64::MAX));
    }

    #[test]
    fn expires_strictly_after_ttl() {
        let mut snapshot = Snapshot::new([], 1_000);
        snapshot.fetched_at = 10_000;

        assert!(!snapshot.is_expired_at(10_500));
        assert!(!snapshot.is_expired_at(11_000));
        assert!(snapshot.is_expired_at(11_001));
    }

    #[test]
    fn extreme_fetch_time_does_not_overflow() {
        let mut snapshot = Snapshot::new([], 1_000);

        snapshot.fetched_at = i64::MIN;
        assert!(snapshot.is_expired_at(i64::MAX));
        assert_eq!(snapshot.age_ms(), i64::MAX);

        snapshot.fetched_at = i64::MAX;
        assert!(!snapshot.is_expired_at(i64::MIN));
        assert!(snapshot.age_ms() < 0);
    }

    #[test]
    fn fresh_snapshot_is_not_expired() {
        assert!(!Snapshot::new([], 60_000).is_expired());
    }

    #[test]
    fn looks_up_flags_by_key_and_id() {
        let snapshot = Snapshot::new([flag(1, "alpha"), flag(2, "beta")], 0);

        assert_eq!(snapshot.flag_by_key("beta").map(|f| f.id), Some(2));
        assert_eq!(snapshot.flag_by_id(1).map(|f| f.key.as_str()), Some("alpha"));
        assert!(snapshot.flag_by_key("gamma").is_none());
        assert!(snapshot.flag_by_id(3).is_none());
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn unknown_operator_parses() {
        let op: ConstraintOperator = serde_json::from_str("\"SEMVER_GT\"").unwrap();
        assert_eq!(op, ConstraintOperator::Unknown);
        let op: ConstraintOperator = serde_json::from_str("\"NOTCONTAINS\"").unwrap();
        assert_eq!(op, ConstraintOperator::Notcontains);
    }

    #[test]
    fn json_uses_flag_ids_as_keys() {
        let mut snapshot = Snapshot::new([flag(7, "seven")], 300_000);
        snapshot.revision = Some("r1".to_owned());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["flags"]["7"]["key"], "seven");
        assert_eq!(json["ttlMs"], 300_000);
        assert_eq!(json["revision"], "r1");

        let parsed: Snapshot = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
