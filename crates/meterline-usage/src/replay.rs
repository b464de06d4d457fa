use crate::domain::controller::{EntityController, Transition};
use crate::domain::events::LifecycleEvent;
use crate::error::UsageError;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Outcome of replaying a batch of lifecycle events.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub applied: usize,
    pub unchanged: usize,
    pub rejected: Vec<RejectedEvent>,
}

#[derive(Debug)]
pub struct RejectedEvent {
    pub line: usize,
    pub error: UsageError,
}

impl ReplaySummary {
    /// Rejections grouped by error code.
    pub fn rejections_by_code(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for rejected in &self.rejected {
            *counts.entry(rejected.error.error_code()).or_insert(0) += 1;
        }
        counts
    }
}

/// Apply JSON-lines events in file order. Blank lines and `#` comments are
/// skipped; a rejected event is recorded and replay carries on.
pub async fn replay_lines(controller: &EntityController, input: &str) -> ReplaySummary {
    let mut summary = ReplaySummary::default();

    for (index, raw) in input.lines().enumerate() {
        let line = index + 1;
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with('#') {
            continue;
        }

        let outcome = match LifecycleEvent::from_json_str(raw) {
            Ok(event) => controller.apply(event).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Transition::Unchanged(_)) => summary.unchanged += 1,
            Ok(transition) => {
                debug!("line {}: {}", line, transition.name());
                summary.applied += 1;
            }
            Err(error) => {
                warn!("line {} rejected: {}", line, error);
                summary.rejected.push(RejectedEvent { line, error });
            }
        }
    }

    summary
}
