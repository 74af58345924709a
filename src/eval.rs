//! Local flag evaluation against a [`Snapshot`].
//!
//! Evaluation is a pure function of the request and the snapshot. Every outcome, including a
//! missing or disabled flag, is a successful [`EvaluationResult`] with an explanatory
//! [`EvaluationReason`].
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{
    rules::constraints_match,
    sharder::{bucket, Crc32Sharder, Sharder, PERCENT_MULTIPLIER},
    snapshot::{Attachment, Distribution, Flag, Segment, Snapshot},
    AttributeValue, EntityContext,
};

/// Identifies the flag to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlagSelector {
    /// Look the flag up by its unique key.
    Key(String),
    /// Look the flag up by its numeric id.
    Id(i64),
}

impl From<&str> for FlagSelector {
    fn from(value: &str) -> Self {
        FlagSelector::Key(value.to_owned())
    }
}

impl From<String> for FlagSelector {
    fn from(value: String) -> Self {
        FlagSelector::Key(value)
    }
}

impl From<i64> for FlagSelector {
    fn from(value: i64) -> Self {
        FlagSelector::Id(value)
    }
}

impl Display for FlagSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlagSelector::Key(key) => f.write_str(key),
            FlagSelector::Id(id) => write!(f, "#{id}"),
        }
    }
}

/// A request to evaluate one flag for one entity.
///
/// # Examples
/// ```
/// # use flagent::EvaluationRequest;
/// let request = EvaluationRequest::new("new-checkout", "user-42")
///     .with_attribute("tier", "premium")
///     .with_attribute("age", 30.0)
///     .with_debug(true);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationRequest {
    /// Flag to evaluate.
    pub flag: FlagSelector,
    /// The bucketing subject.
    pub entity_id: String,
    /// Attributes consulted by segment constraints.
    pub entity_context: EntityContext,
    /// Collect human-readable trace lines in [`EvaluationResult::debug_logs`].
    pub enable_debug: bool,
}

impl EvaluationRequest {
    /// Create a request with an empty context.
    pub fn new(flag: impl Into<FlagSelector>, entity_id: impl Into<String>) -> EvaluationRequest {
        EvaluationRequest {
            flag: flag.into(),
            entity_id: entity_id.into(),
            entity_context: EntityContext::new(),
            enable_debug: false,
        }
    }

    /// Replace the entity context.
    pub fn with_context(mut self, entity_context: EntityContext) -> Self {
        self.entity_context = entity_context;
        self
    }

    /// Add a single attribute to the entity context.
    pub fn with_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.entity_context.insert(name.into(), value.into());
        self
    }

    /// Enable or disable debug tracing.
    pub fn with_debug(mut self, enable_debug: bool) -> Self {
        self.enable_debug = enable_debug;
        self
    }
}

/// Why an evaluation produced its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
    /// A segment matched.
    Match,
    /// No segment matched the entity.
    NoMatch,
    /// The snapshot does not contain the requested flag.
    FlagNotFound,
    /// The flag exists but is disabled.
    FlagDisabled,
    /// The flag has no segments.
    NoSegments,
}

/// Outcome of a local evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    /// Resolved flag id. For an unknown flag, the requested id (if the request used one).
    #[serde(rename = "flagID", default, skip_serializing_if = "Option::is_none")]
    pub flag_id: Option<i64>,
    /// Resolved flag key. For an unknown flag, the requested key (if the request used one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_key: Option<String>,
    /// Matched segment.
    #[serde(rename = "segmentID", default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<i64>,
    /// Assigned variant. `None` when a segment without distributions matched.
    #[serde(rename = "variantID", default, skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<i64>,
    /// Key of the assigned variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_key: Option<String>,
    /// Attachment of the assigned variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_attachment: Option<Attachment>,
    #[allow(missing_docs)]
    pub reason: EvaluationReason,
    /// Trace lines. Empty unless the request enabled debugging.
    #[serde(default)]
    pub debug_logs: Vec<String>,
    /// The entity the result was computed for.
    #[serde(rename = "entityID")]
    pub entity_id: String,
}

impl EvaluationResult {
    /// A flag counts as enabled for the entity when a non-empty variant key was assigned.
    pub fn is_enabled(&self) -> bool {
        self.variant_key.as_deref().is_some_and(|key| !key.is_empty())
    }

    /// Look up `key` in the assigned variant's attachment.
    pub fn attachment_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.variant_attachment.as_ref()?.get(key)
    }

    fn new(
        request: &EvaluationRequest,
        flag: Option<&Flag>,
        reason: EvaluationReason,
        debug_logs: Vec<String>,
    ) -> EvaluationResult {
        let (flag_id, flag_key) = match (flag, &request.flag) {
            (Some(flag), _) => (Some(flag.id), Some(flag.key.clone())),
            (None, FlagSelector::Id(id)) => (Some(*id), None),
            (None, FlagSelector::Key(key)) => (None, Some(key.clone())),
        };
        EvaluationResult {
            flag_id,
            flag_key,
            segment_id: None,
            variant_id: None,
            variant_key: None,
            variant_attachment: None,
            reason,
            debug_logs,
            entity_id: request.entity_id.clone(),
        }
    }
}

/// Collects debug lines only when enabled, so formatting costs nothing otherwise.
struct DebugTrace {
    lines: Option<Vec<String>>,
}

impl DebugTrace {
    fn new(enabled: bool) -> DebugTrace {
        DebugTrace {
            lines: enabled.then(Vec::new),
        }
    }

    fn push(&mut self, line: impl FnOnce() -> String) {
        if let Some(lines) = &mut self.lines {
            lines.push(line());
        }
    }

    fn finish(self) -> Vec<String> {
        self.lines.unwrap_or_default()
    }
}

/// Evaluate a single request against `snapshot`.
pub fn evaluate(request: &EvaluationRequest, snapshot: &Snapshot) -> EvaluationResult {
    let flag = match &request.flag {
        FlagSelector::Key(key) => snapshot.flag_by_key(key),
        FlagSelector::Id(id) => snapshot.flag_by_id(*id),
    };

    let result = match flag {
        Some(flag) => flag.eval(request, &Crc32Sharder),
        None => {
            let mut trace = DebugTrace::new(request.enable_debug);
            trace.push(|| "Flag not found in snapshot".to_owned());
            EvaluationResult::new(
                request,
                None,
                EvaluationReason::FlagNotFound,
                trace.finish(),
            )
        }
    };

    log::trace!(target: "flagent",
                flag:display = request.flag,
                entity_id:display = request.entity_id,
                reason:? = result.reason,
                variant_key:? = result.variant_key;
                "evaluated flag");

    result
}

/// Evaluate every request independently against the same `snapshot`.
pub fn evaluate_batch(requests: &[EvaluationRequest], snapshot: &Snapshot) -> Vec<EvaluationResult> {
    requests
        .iter()
        .map(|request| evaluate(request, snapshot))
        .collect()
}

impl Flag {
    fn eval(&self, request: &EvaluationRequest, sharder: &impl Sharder) -> EvaluationResult {
        let mut trace = DebugTrace::new(request.enable_debug);

        if !self.enabled {
            trace.push(|| "Flag is disabled".to_owned());
            return EvaluationResult::new(
                request,
                Some(self),
                EvaluationReason::FlagDisabled,
                trace.finish(),
            );
        }

        if self.segments.is_empty() {
            trace.push(|| "Flag has no segments".to_owned());
            return EvaluationResult::new(
                request,
                Some(self),
                EvaluationReason::NoSegments,
                trace.finish(),
            );
        }

        let mut segments = self.segments.iter().collect::<Vec<_>>();
        segments.sort_by_key(|segment| segment.rank);

        let entity_bucket = bucket(sharder, self.id, &request.entity_id);

        for segment in segments {
            trace.push(|| {
                format!(
                    "Evaluating segment {} (rank {})",
                    segment.id, segment.rank
                )
            });

            if !constraints_match(&segment.constraints, &request.entity_context) {
                trace.push(|| format!("Segment {}: constraints did not match", segment.id));
                continue;
            }
            trace.push(|| format!("Segment {}: constraints matched", segment.id));

            let Some(distribution) = segment.select(entity_bucket) else {
                trace.push(|| format!("Segment {}: not in rollout percentage", segment.id));
                continue;
            };

            let mut result =
                EvaluationResult::new(request, Some(self), EvaluationReason::Match, Vec::new());
            result.segment_id = Some(segment.id);

            match distribution {
                Some(distribution) => {
                    result.variant_id = Some(distribution.variant_id);
                    match self.variant(distribution.variant_id) {
                        Some(variant) => {
                            result.variant_key = Some(variant.key.clone());
                            result.variant_attachment = Some(variant.attachment.clone());
                        }
                        None if !distribution.variant_key.is_empty() => {
                            result.variant_key = Some(distribution.variant_key.clone());
                        }
                        None => {}
                    }
                    trace.push(|| {
                        format!(
                            "Segment {}: matched, assigned variant {}",
                            segment.id, distribution.variant_id
                        )
                    });
                }
                None => {
                    trace.push(|| format!("Segment {}: matched, no distributions", segment.id));
                }
            }

            result.debug_logs = trace.finish();
            return result;
        }

        trace.push(|| "No segment matched".to_owned());
        EvaluationResult::new(
            request,
            Some(self),
            EvaluationReason::NoMatch,
            trace.finish(),
        )
    }
}

impl Segment {
    /// Apply the rollout gate and pick a distribution for `bucket`.
    ///
    /// Returns `None` if the entity is outside of the rollout, `Some(None)` if the entity is
    /// admitted but the segment has no distributions.
    fn select(&self, bucket: u64) -> Option<Option<&Distribution>> {
        let bucket = bucket as i64;
        if bucket >= self.rollout_percent.saturating_mul(PERCENT_MULTIPLIER) {
            return None;
        }

        let mut distributions = self.distributions.iter().collect::<Vec<_>>();
        distributions.sort_by_key(|distribution| distribution.percent);

        // Distribution ranges are 1-based.
        let bucket = bucket + 1;
        let mut cumulative: i64 = 0;
        let selected = distributions.iter().copied().find(|distribution| {
            cumulative =
                cumulative.saturating_add(distribution.percent.saturating_mul(PERCENT_MULTIPLIER));
            bucket <= cumulative
        });

        // Undersubscribed distributions: the highest-percent one takes the remaining buckets.
        Some(selected.or_else(|| distributions.last().copied()))
    }
}
