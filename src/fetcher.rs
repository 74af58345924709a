use std::{sync::Arc, time::Duration};

use chrono::Utc;

use crate::{
    snapshot::{Constraint, Distribution, Flag, Segment, Snapshot, Variant},
    source::SnapshotSource,
    wire::{WireFlag, WireSegment, WireSnapshot},
    Result,
};

/// Fetches the export from a [`SnapshotSource`] and projects it into a [`Snapshot`].
#[derive(Clone)]
pub(crate) struct SnapshotFetcher {
    source: Arc<dyn SnapshotSource>,
}

impl SnapshotFetcher {
    pub(crate) fn new(source: Arc<dyn SnapshotSource>) -> SnapshotFetcher {
        SnapshotFetcher { source }
    }

    /// Fetch a fresh snapshot stamped with the current time and `ttl`.
    pub(crate) async fn fetch(&self, ttl: Duration) -> Result<Snapshot> {
        let wire = self.source.fetch_snapshot().await?;
        Ok(wire.into_snapshot(ttl.as_millis() as i64, Utc::now().timestamp_millis()))
    }
}

impl WireSnapshot {
    /// Project the export into a [`Snapshot`] fetched at `fetched_at` (Unix milliseconds).
    ///
    /// Records without an id cannot be addressed by evaluation and are dropped. Flags that failed
    /// to parse are dropped too.
    pub fn into_snapshot(self, ttl_ms: i64, fetched_at: i64) -> Snapshot {
        let flags = self
            .flags
            .into_iter()
            .filter_map(|flag| {
                let flag: Option<WireFlag> = flag.into();
                if flag.is_none() {
                    log::warn!(target: "flagent", "dropping flag that failed to parse");
                }
                flag
            })
            .filter_map(WireFlag::into_flag)
            .map(|flag| (flag.id, flag))
            .collect();

        Snapshot {
            flags,
            fetched_at,
            ttl_ms,
            revision: self.revision,
        }
    }
}

impl WireFlag {
    fn into_flag(self) -> Option<Flag> {
        let Some(id) = self.id else {
            log::warn!(target: "flagent", flag_key:display = self.key; "dropping flag without id");
            return None;
        };

        let segments = self
            .segments
            .into_iter()
            .filter_map(|segment| segment.into_segment(id))
            .collect();

        let variants = self
            .variants
            .into_iter()
            .filter_map(|variant| {
                Some(Variant {
                    id: variant.id?,
                    flag_id: id,
                    key: variant.key,
                    attachment: variant.attachment,
                })
            })
            .collect();

        Some(Flag {
            id,
            key: self.key,
            enabled: self.enabled,
            description: self.description.unwrap_or_default(),
            entity_type: self.entity_type.unwrap_or_default(),
            segments,
            variants,
        })
    }
}

impl WireSegment {
    fn into_segment(self, flag_id: i64) -> Option<Segment> {
        Some(Segment {
            id: self.id?,
            flag_id,
            rank: self.rank,
            rollout_percent: self.rollout_percent,
            constraints: self
                .constraints
                .into_iter()
                .filter_map(|constraint| {
                    Some(Constraint {
                        id: constraint.id?,
                        property: constraint.property,
                        operator: constraint.operator,
                        value: constraint.value.unwrap_or_default(),
                    })
                })
                .collect(),
            distributions: self
                .distributions
                .into_iter()
                .filter_map(|distribution| {
                    Some(Distribution {
                        id: distribution.id?,
                        variant_id: distribution.variant_id,
                        variant_key: distribution.variant_key,
                        percent: distribution.percent,
                    })
                })
                .collect(),
            description: self.description.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::File,
        io::BufReader,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::{
        eval::{evaluate, EvaluationReason, EvaluationRequest},
        snapshot::ConstraintOperator,
        source::SnapshotSource,
        wire::{WireConstraint, WireFlag, WireSegment, WireSnapshot},
        Error, Result,
    };

    use super::SnapshotFetcher;

    fn load_fixture() -> WireSnapshot {
        let f = File::open("tests/data/snapshot-v1.json")
            .expect("Failed to open tests/data/snapshot-v1.json");
        serde_json::from_reader(BufReader::new(f)).unwrap()
    }

    struct FixtureSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotSource for FixtureSource {
        async fn fetch_snapshot(&self) -> Result<WireSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(load_fixture())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl SnapshotSource for FailingSource {
        async fn fetch_snapshot(&self) -> Result<WireSnapshot> {
            Err(Error::UnexpectedStatus(502))
        }
    }

    #[test]
    fn projects_fixture() {
        let snapshot = load_fixture().into_snapshot(60_000, 1_000);

        assert_eq!(snapshot.fetched_at, 1_000);
        assert_eq!(snapshot.ttl_ms, 60_000);
        assert_eq!(snapshot.revision.as_deref(), Some("rev-42"));

        let checkout = snapshot.flag_by_key("new-checkout").unwrap();
        assert_eq!(checkout.id, 1);
        assert_eq!(checkout.entity_type, "user");
        assert_eq!(checkout.segments.len(), 2);
        assert!(checkout.segments.iter().all(|s| s.flag_id == 1));
        assert_eq!(checkout.variants.len(), 2);
        assert_eq!(
            checkout.segments[0].constraints[0].operator,
            ConstraintOperator::Eq
        );
    }

    #[test]
    fn drops_records_without_ids() {
        let snapshot = load_fixture().into_snapshot(0, 0);

        // The fixture carries a flag without id, a variant without id and a constraint and
        // distribution without id on "banner-color".
        assert!(snapshot.flag_by_key("orphan").is_none());
        let banner = snapshot.flag_by_key("banner-color").unwrap();
        assert_eq!(banner.variants.len(), 2);
        assert_eq!(banner.segments[0].constraints.len(), 1);
        assert_eq!(banner.segments[0].distributions.len(), 2);
    }

    #[test]
    fn drops_flags_that_failed_to_parse() {
        let snapshot = load_fixture().into_snapshot(0, 0);
        assert!(snapshot.flag_by_key("broken").is_none());
        assert!(snapshot.flag_by_id(99).is_none());
    }

    #[test]
    fn missing_operator_degrades_to_non_matching_constraint() {
        let snapshot = load_fixture().into_snapshot(0, 0);

        let flag = snapshot.flag_by_key("legacy-rules").unwrap();
        let constraints = &flag.segments[0].constraints;
        assert_eq!(constraints.len(), 2);
        assert!(constraints
            .iter()
            .all(|constraint| constraint.operator == ConstraintOperator::Unknown));

        let request = EvaluationRequest::new("legacy-rules", "u1")
            .with_attribute("tier", "premium")
            .with_attribute("country", "US");
        let result = evaluate(&request, &snapshot);
        assert_eq!(result.reason, EvaluationReason::Match);
        assert_eq!(result.segment_id, Some(51));
        assert_eq!(result.variant_key.as_deref(), Some("default"));
    }

    #[test]
    fn drops_segment_without_id() {
        let wire = WireSnapshot {
            flags: vec![WireFlag {
                id: Some(5),
                key: "five".to_owned(),
                enabled: true,
                segments: vec![
                    WireSegment {
                        id: None,
                        rollout_percent: 100,
                        ..Default::default()
                    },
                    WireSegment {
                        id: Some(6),
                        rollout_percent: 100,
                        constraints: vec![WireConstraint {
                            id: Some(7),
                            property: "tier".to_owned(),
                            operator: ConstraintOperator::Eq,
                            value: None,
                        }],
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }
            .into()],
            export_at: 0,
            revision: None,
        };

        let snapshot = wire.into_snapshot(0, 0);
        let flag = snapshot.flag_by_id(5).unwrap();

        assert_eq!(flag.segments.len(), 1);
        assert_eq!(flag.segments[0].id, 6);
        assert_eq!(flag.segments[0].constraints[0].value, "");
    }

    #[tokio::test]
    async fn fetch_stamps_time_and_ttl() {
        let source = Arc::new(FixtureSource {
            calls: AtomicUsize::new(0),
        });
        let fetcher = SnapshotFetcher::new(source.clone());

        let before = Utc::now().timestamp_millis();
        let snapshot = fetcher.fetch(Duration::from_secs(300)).await.unwrap();

        assert!(snapshot.fetched_at >= before);
        assert_eq!(snapshot.ttl_ms, 300_000);
        assert!(!snapshot.is_expired());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_propagates_source_errors() {
        let fetcher = SnapshotFetcher::new(Arc::new(FailingSource));

        let err = fetcher.fetch(Duration::from_secs(1)).await.unwrap_err();

        assert!(err.is_fetch_failure());
    }
}
