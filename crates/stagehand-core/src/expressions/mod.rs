//! Assertions and event conditions.
//!
//! A [`ConditionalExpr`] carries a state expression (evaluated against the
//! classifier snapshot), a metrics expression (backed by an alert rule whose
//! state arrives by webhook), or both. [`evaluate`] folds either kind into one
//! predicate, used for event-gated scheduling and for workflow assertions.

mod alert;
mod metrics;
mod state;

pub use alert::{
    alert_is_fired, dispatch_alert, rule_name, set_alert, unset_alert, AlertReport, AlertState,
    AlertWebhook, DispatchOutcome, EvalMatch, ALERT_DETAILS, ALERT_NAME, ALERT_STATE,
    ALERT_TIMESTAMP,
};
pub use metrics::{AlertRule, EvaluatorKind, ExprMetrics};
pub use state::ExprState;

use crate::classifier::Classifier;
use crate::error::Result;
use crate::meta::ObjectMeta;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalExpr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ExprState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExprMetrics>,
}

impl ConditionalExpr {
    pub fn state(expr: &str) -> Self {
        Self {
            state: Some(ExprState::new(expr)),
            metrics: None,
        }
    }

    pub fn metrics(expr: &str) -> Self {
        Self {
            state: None,
            metrics: Some(ExprMetrics::new(expr)),
        }
    }

    pub fn has_state_expr(&self) -> bool {
        self.state.as_ref().is_some_and(|e| !e.is_empty())
    }

    pub fn has_metrics_expr(&self) -> bool {
        self.metrics.as_ref().is_some_and(|e| !e.is_empty())
    }

    pub fn is_zero(&self) -> bool {
        !self.has_state_expr() && !self.has_metrics_expr()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(state) = &self.state {
            state.validate()?;
        }
        if let Some(metrics) = self.metrics.as_ref().filter(|m| !m.is_empty()) {
            metrics.parse()?;
        }
        Ok(())
    }
}

/// Outcome of a condition check. `info` explains a negative verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub holds: bool,
    pub info: String,
}

/// Decide whether `expr` currently holds for `target`.
///
/// A metrics expression holds until its alert fires; a state expression holds
/// when it evaluates to true. With both present both must hold. An empty
/// expression holds.
pub fn evaluate(expr: &ConditionalExpr, state: &Classifier, target: &ObjectMeta) -> Result<Verdict> {
    if expr.has_metrics_expr() {
        let report = alert_is_fired(target)?;
        if report.fired {
            return Ok(Verdict {
                holds: false,
                info: report.details,
            });
        }
    }

    if let Some(state_expr) = expr.state.as_ref().filter(|e| !e.is_empty()) {
        if !state_expr.evaluate(state)? {
            return Ok(Verdict {
                holds: false,
                info: format!("state expression '{state_expr}' is false"),
            });
        }
    }

    Ok(Verdict {
        holds: true,
        info: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobKind};
    use crate::types::Phase;

    fn snapshot() -> Classifier {
        let mut c = Classifier::new();
        c.classify(
            "server",
            Job::builder(JobKind::Service, "ns", "server")
                .phase(Phase::Running)
                .build()
                .unwrap(),
        );
        c
    }

    fn fired_meta() -> ObjectMeta {
        let mut meta = ObjectMeta::new("ns", "wf");
        meta.annotations.insert(ALERT_NAME.into(), "ns/Workflow/wf".into());
        meta.annotations.insert(ALERT_STATE.into(), "alerting".into());
        meta.annotations
            .insert(ALERT_TIMESTAMP.into(), "2024-01-01T00:00:00+00:00".into());
        meta.annotations.insert(ALERT_DETAILS.into(), "{\"ruleName\":\"x\"}".into());
        meta
    }

    #[test]
    fn empty_expression_holds() {
        let v = evaluate(&ConditionalExpr::default(), &snapshot(), &ObjectMeta::default()).unwrap();
        assert!(v.holds);
    }

    #[test]
    fn state_expression_drives_verdict() {
        let meta = ObjectMeta::default();
        let yes = ConditionalExpr::state(r#"{{.IsRunning "server"}}"#);
        assert!(evaluate(&yes, &snapshot(), &meta).unwrap().holds);

        let no = ConditionalExpr::state(r#"{{.IsFailed "server"}}"#);
        let v = evaluate(&no, &snapshot(), &meta).unwrap();
        assert!(!v.holds);
        assert!(v.info.contains("is false"));
    }

    #[test]
    fn fired_alert_breaks_metrics_condition() {
        let expr = ConditionalExpr::metrics("avg() of query(abc/1/cpu, 5m, now) is above(90)");
        assert!(evaluate(&expr, &snapshot(), &ObjectMeta::new("ns", "wf")).unwrap().holds);

        let v = evaluate(&expr, &snapshot(), &fired_meta()).unwrap();
        assert!(!v.holds);
        assert!(v.info.contains("ruleName"));
    }

    #[test]
    fn unknown_field_propagates() {
        let expr = ConditionalExpr::state("{{.Nope}} == 1");
        let err = evaluate(&expr, &snapshot(), &ObjectMeta::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn validate_checks_both_halves() {
        assert!(ConditionalExpr::state("{{.Count}} > 1").validate().is_ok());
        assert!(ConditionalExpr::metrics("garbage").validate().is_err());
        assert!(ConditionalExpr::state("{{.Count}} >").validate().is_err());
    }
}
