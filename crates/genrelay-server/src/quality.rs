// Quality gate
//
// Results carrying a quality score below MIN_QUALITY_SCORE are flagged onto
// `generation.analysis`. The policy decides what the waiter sees:
// - deliver: the result goes through unchanged
// - withhold: the waiter gets `quality_rejected`
//
// Results without a score are never flagged.

use std::str::FromStr;

use genrelay_broker::topics;
use genrelay_core::{GatewayError, GenerationOutput, JobId};
use serde::Serialize;

use crate::outbox::Outbox;

/// What happens to a flagged result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPolicy {
    #[default]
    Deliver,
    Withhold,
}

impl FromStr for QualityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deliver" => Ok(QualityPolicy::Deliver),
            "withhold" => Ok(QualityPolicy::Withhold),
            other => Err(format!(
                "unknown quality gate policy '{other}', expected deliver or withhold"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityGate {
    pub min_score: Option<f64>,
    pub policy: QualityPolicy,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisRecord<'a> {
    job_id: JobId,
    quality_score: f64,
    minimum: f64,
    policy: QualityPolicy,
    payload: &'a serde_json::Value,
}

impl QualityGate {
    pub fn new(min_score: Option<f64>, policy: QualityPolicy) -> Self {
        Self { min_score, policy }
    }

    /// Score and minimum when `output` falls below the gate
    pub fn flags(&self, output: &GenerationOutput) -> Option<(f64, f64)> {
        let minimum = self.min_score?;
        let score = output.quality_score?;
        (score < minimum).then_some((score, minimum))
    }

    pub fn apply(
        &self,
        job_id: JobId,
        outcome: Result<GenerationOutput, GatewayError>,
        outbox: &Outbox,
    ) -> Result<GenerationOutput, GatewayError> {
        let output = outcome?;
        let Some((score, minimum)) = self.flags(&output) else {
            return Ok(output);
        };

        tracing::info!(
            job_id = %job_id,
            score,
            minimum,
            policy = ?self.policy,
            "Result flagged by quality gate"
        );
        outbox.publish(
            topics::ANALYSIS,
            &AnalysisRecord {
                job_id,
                quality_score: score,
                minimum,
                policy: self.policy,
                payload: &output.payload,
            },
        );

        match self.policy {
            QualityPolicy::Deliver => Ok(output),
            QualityPolicy::Withhold => Err(GatewayError::QualityRejected { score, minimum }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(score: Option<f64>) -> GenerationOutput {
        let output = GenerationOutput::new(json!({"text": "x"}));
        match score {
            Some(s) => output.with_quality_score(s),
            None => output,
        }
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("withhold".parse::<QualityPolicy>(), Ok(QualityPolicy::Withhold));
        assert_eq!("DELIVER".parse::<QualityPolicy>(), Ok(QualityPolicy::Deliver));
        assert!("drop".parse::<QualityPolicy>().is_err());
    }

    #[test]
    fn test_disabled_gate_passes_everything() {
        let gate = QualityGate::default();
        assert!(gate.flags(&output(Some(0.0))).is_none());
    }

    #[test]
    fn test_unscored_results_pass() {
        let gate = QualityGate::new(Some(0.5), QualityPolicy::Withhold);
        let result = gate.apply(JobId::new(), Ok(output(None)), &Outbox::disabled());
        assert!(result.is_ok());
    }

    #[test]
    fn test_withhold_rejects_low_scores() {
        let gate = QualityGate::new(Some(0.5), QualityPolicy::Withhold);
        let err = gate
            .apply(JobId::new(), Ok(output(Some(0.2))), &Outbox::disabled())
            .unwrap_err();
        assert_eq!(err.code(), "quality_rejected");

        assert!(gate
            .apply(JobId::new(), Ok(output(Some(0.5))), &Outbox::disabled())
            .is_ok());
    }

    #[test]
    fn test_deliver_keeps_low_scores() {
        let gate = QualityGate::new(Some(0.5), QualityPolicy::Deliver);
        let result = gate.apply(JobId::new(), Ok(output(Some(0.2))), &Outbox::disabled());
        assert_eq!(result.unwrap().quality_score, Some(0.2));
    }

    #[test]
    fn test_errors_pass_through() {
        let gate = QualityGate::new(Some(0.5), QualityPolicy::Withhold);
        let err = gate
            .apply(
                JobId::new(),
                Err(GatewayError::backend("boom")),
                &Outbox::disabled(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "backend_error");
    }
}
