//! Post-stage quality gate.
//!
//! Folds a stage's subtask results into one score through a pluggable
//! `ScoringPolicy` and classifies it as accept, revise, or escalate.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::task::SubtaskResult;
use crate::core::verdict::{Decision, QualityVerdict};
use crate::error::{Error, Result};

pub const DEFAULT_ACCEPT_THRESHOLD: f64 = 4.0;
pub const DEFAULT_REVISE_FLOOR: f64 = 3.0;
pub const DEFAULT_MIDPOINT_SCORE: f64 = 3.0;
pub const DEFAULT_MAX_REVISIONS: u32 = 2;
pub const MAX_SCORE: f64 = 5.0;

/// `[quality]` section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub accept_threshold: f64,
    pub revise_floor: f64,
    /// Score used when no subtask reported one.
    pub midpoint_score: f64,
    pub max_revisions: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            revise_floor: DEFAULT_REVISE_FLOOR,
            midpoint_score: DEFAULT_MIDPOINT_SCORE,
            max_revisions: DEFAULT_MAX_REVISIONS,
        }
    }
}

/// Aggregates validated sub-scores into a stage score.
pub trait ScoringPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// `scores` is never empty.
    fn aggregate(&self, scores: &[f64]) -> f64;
}

/// Arithmetic mean of reported sub-scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanScoring;

impl ScoringPolicy for MeanScoring {
    fn name(&self) -> &str {
        "mean"
    }

    fn aggregate(&self, scores: &[f64]) -> f64 {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// The weakest sub-score decides.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinScoring;

impl ScoringPolicy for MinScoring {
    fn name(&self) -> &str {
        "min"
    }

    fn aggregate(&self, scores: &[f64]) -> f64 {
        scores.iter().copied().fold(f64::INFINITY, f64::min)
    }
}

pub struct QualityGate {
    config: QualityConfig,
    policy: Arc<dyn ScoringPolicy>,
}

impl QualityGate {
    pub fn new(config: QualityConfig) -> Self {
        Self::with_policy(config, Arc::new(MeanScoring))
    }

    pub fn with_policy(config: QualityConfig, policy: Arc<dyn ScoringPolicy>) -> Self {
        Self { config, policy }
    }

    pub fn config(&self) -> &QualityConfig {
        &self.config
    }

    /// Score a completed stage.
    ///
    /// `revisions_used` is how many revision passes the stage already had; a
    /// stage with no budget left that still misses the threshold escalates.
    /// Out-of-range sub-scores are an internal fault, never clamped.
    pub fn evaluate(
        &self,
        stage: &str,
        results: &[&SubtaskResult],
        revisions_used: u32,
    ) -> Result<QualityVerdict> {
        let mut scores = Vec::new();
        for result in results {
            if let Some(score) = result.sub_score {
                if !score.is_finite() || !(0.0..=MAX_SCORE).contains(&score) {
                    return Err(Error::InternalGateError(format!(
                        "stage {}: {} reported sub-score {} outside 0..={}",
                        stage, result.delegate, score, MAX_SCORE
                    )));
                }
                scores.push(score);
            }
        }

        let score = if scores.is_empty() {
            self.config.midpoint_score
        } else {
            self.policy.aggregate(&scores)
        };
        if !score.is_finite() {
            return Err(Error::InternalGateError(format!(
                "stage {}: {} policy produced {}",
                stage,
                self.policy.name(),
                score
            )));
        }

        let passed = score >= self.config.accept_threshold;
        let exhausted = revisions_used >= self.config.max_revisions;
        let decision = if passed {
            Decision::Accept
        } else if exhausted {
            Decision::EscalateHuman
        } else if score >= self.config.revise_floor {
            Decision::Revise
        } else {
            Decision::EscalateHuman
        };

        let mut findings = Vec::new();
        if scores.is_empty() {
            findings.push(format!(
                "no sub-scores reported; using midpoint {:.2}",
                score
            ));
        } else {
            findings.push(format!(
                "{} of {} sub-scores: {:.2}",
                self.policy.name(),
                scores.len(),
                score
            ));
        }
        if !passed {
            findings.push(format!(
                "below acceptance threshold {:.2}",
                self.config.accept_threshold
            ));
            if exhausted {
                findings.push(format!(
                    "revision budget exhausted ({}/{})",
                    revisions_used, self.config.max_revisions
                ));
            }
        }
        for result in results {
            if let Some(note) = result.payload.get("findings").and_then(|v| v.as_str()) {
                findings.push(note.to_string());
            }
        }

        Ok(QualityVerdict {
            stage: stage.to_string(),
            score,
            threshold: self.config.accept_threshold,
            passed,
            findings: findings.join("; "),
            decision,
            revision: revisions_used,
            rendered_at: Utc::now(),
        })
    }
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(QualityConfig::default())
    }
}
