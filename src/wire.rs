//! Server-side representation of the flag export, as returned by the snapshot endpoint.
//!
//! The export is parsed leniently: identifiers are optional, missing or `null` collections and
//! strings fall back to empty values, and a flag that fails to parse does not fail the whole
//! export. The fetcher decides what to keep.
use serde::{Deserialize, Deserializer, Serialize};

use crate::snapshot::{Attachment, ConstraintOperator};

/// Full flag export.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSnapshot {
    #[allow(missing_docs)]
    #[serde(default, deserialize_with = "nullable")]
    pub flags: Vec<TryParse<WireFlag>>,
    /// Unix timestamp (milliseconds) of the export on the server.
    #[serde(default)]
    pub export_at: i64,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

impl<T> From<T> for TryParse<T> {
    fn from(value: T) -> Self {
        TryParse::Parsed(value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct WireFlag {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub key: String,
    #[serde(default, deserialize_with = "nullable")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub segments: Vec<WireSegment>,
    #[serde(default, deserialize_with = "nullable")]
    pub variants: Vec<WireVariant>,
    #[serde(default)]
    pub entity_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct WireSegment {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "flagID", default)]
    pub flag_id: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub rank: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub rollout_percent: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub constraints: Vec<WireConstraint>,
    #[serde(default, deserialize_with = "nullable")]
    pub distributions: Vec<WireDistribution>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct WireConstraint {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub property: String,
    #[serde(default, deserialize_with = "nullable")]
    pub operator: ConstraintOperator,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct WireDistribution {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "variantID", default, deserialize_with = "nullable")]
    pub variant_id: i64,
    #[serde(default, deserialize_with = "nullable")]
    pub variant_key: String,
    #[serde(default, deserialize_with = "nullable")]
    pub percent: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct WireVariant {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(rename = "flagID", default)]
    pub flag_id: Option<i64>,
    #[serde(default, deserialize_with = "nullable")]
    pub key: String,
    #[serde(default, deserialize_with = "nullable")]
    pub attachment: Attachment,
}

/// Treat an explicit `null` the same as a missing field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::BufReader};

    use crate::snapshot::ConstraintOperator;

    use super::{TryParse, WireSnapshot};

    #[test]
    fn parse_snapshot_v1() {
        let f = File::open("tests/data/snapshot-v1.json")
            .expect("Failed to open tests/data/snapshot-v1.json");
        let snapshot: WireSnapshot = serde_json::from_reader(BufReader::new(f)).unwrap();

        assert_eq!(snapshot.revision.as_deref(), Some("rev-42"));
        assert!(!snapshot.flags.is_empty());
    }

    #[test]
    fn nulls_are_defaults() {
        let snapshot: WireSnapshot = serde_json::from_str(
            r#"
              {
                "flags": [
                  {
                    "id": 1,
                    "key": "nulls",
                    "enabled": true,
                    "description": null,
                    "segments": [
                      {
                        "id": 2,
                        "rank": 0,
                        "rolloutPercent": 100,
                        "constraints": null,
                        "distributions": null
                      }
                    ],
                    "variants": null
                  }
                ],
                "exportAt": 1700000000000
              }
            "#,
        )
        .unwrap();

        let TryParse::Parsed(flag) = &snapshot.flags[0] else {
            panic!("flag should parse");
        };
        assert_eq!(flag.segments.len(), 1);
        assert!(flag.segments[0].constraints.is_empty());
        assert!(flag.variants.is_empty());
        assert_eq!(flag.description, None);
        assert_eq!(snapshot.revision, None);
    }

    #[test]
    fn parse_partially_if_unexpected() {
        let snapshot: WireSnapshot = serde_json::from_str(
            r#"
              {
                "flags": [
                  {
                    "id": 1,
                    "key": "success",
                    "enabled": true,
                    "segments": [
                      {
                        "id": 1,
                        "rank": 0,
                        "rolloutPercent": 100,
                        "constraints": [
                          { "id": 1, "property": "version", "operator": "SEMVER_GT", "value": "1.0.0" }
                        ]
                      }
                    ]
                  },
                  {
                    "id": 2,
                    "key": "fail_parsing",
                    "enabled": "yes please"
                  }
                ]
              }
            "#,
        )
        .unwrap();

        assert!(matches!(
            &snapshot.flags[0],
            TryParse::Parsed(flag)
                if flag.segments[0].constraints[0].operator == ConstraintOperator::Unknown
        ));
        assert!(matches!(snapshot.flags[1], TryParse::ParseFailed(_)));
    }

    #[test]
    fn missing_or_null_operator_is_unknown() {
        let snapshot: WireSnapshot = serde_json::from_str(
            r#"
              {
                "flags": [
                  {
                    "id": 1,
                    "key": "no_operator",
                    "enabled": true,
                    "segments": [
                      {
                        "id": 1,
                        "constraints": [
                          { "id": 1, "property": "tier", "value": "x" },
                          { "id": 2, "property": "tier", "operator": null, "value": "x" }
                        ]
                      }
                    ]
                  }
                ]
              }
            "#,
        )
        .unwrap();

        let TryParse::Parsed(flag) = &snapshot.flags[0] else {
            panic!("flag failed to parse");
        };
        let operators = flag.segments[0]
            .constraints
            .iter()
            .map(|constraint| constraint.operator)
            .collect::<Vec<_>>();
        assert_eq!(
            operators,
            vec![ConstraintOperator::Unknown, ConstraintOperator::Unknown]
        );
    }
}
