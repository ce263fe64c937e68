use crate::error::{Result, StagehandError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Legacy dashboard-alert expression, e.g.
/// `avg() of query(wpFnYRwGk/2/bitrate, 15m, now) is below(14) for (1m) every(30s)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprMetrics(pub String);

impl ExprMetrics {
    pub fn new(expr: impl Into<String>) -> Self {
        Self(expr.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn parse(&self) -> Result<AlertRule> {
        AlertRule::parse(&self.0)
    }
}

impl fmt::Display for ExprMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// AlertRule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    Gt,
    Lt,
    WithinRange,
    OutsideRange,
    NoValue,
}

impl EvaluatorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluatorKind::Gt => "gt",
            EvaluatorKind::Lt => "lt",
            EvaluatorKind::WithinRange => "within_range",
            EvaluatorKind::OutsideRange => "outside_range",
            EvaluatorKind::NoValue => "no_value",
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "gt" | "above" => Some(EvaluatorKind::Gt),
            "lt" | "below" => Some(EvaluatorKind::Lt),
            "within_range" | "withinrange" => Some(EvaluatorKind::WithinRange),
            "outside_range" | "outsiderange" => Some(EvaluatorKind::OutsideRange),
            "no_value" | "novalue" => Some(EvaluatorKind::NoValue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub reducer: String,
    pub dashboard_uid: String,
    pub panel_id: u64,
    pub metric: String,
    pub from: String,
    pub to: String,
    pub evaluator: EvaluatorKind,
    pub params: Vec<f64>,
    /// Evaluation period.
    pub frequency: String,
    /// How long the condition must hold before alerting.
    pub pending_for: String,
}

fn grammar() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?m)^(?P<reducer>\w+)\(\)\s+of\s+query\((?P<uid>\w+)/(?P<panel>\d+)/(?P<metric>.+),\s+(?P<from>\w+),\s+(?P<to>\w+)\)\s+is\s+(?P<evaluator>\w+)\((?P<params>[^)]*)\)\s*(for\s+\((?P<for>\w+)\))?\s*(every\((?P<every>\w+)\))?\s*$",
        )
        .expect("metrics grammar is a valid regex")
    })
}

impl AlertRule {
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = |reason: &str| StagehandError::InvalidMetricsExpr(format!("'{expr}': {reason}"));

        let caps = grammar()
            .captures(expr.trim())
            .ok_or_else(|| invalid("does not match 'reducer() of query(uid/panel/metric, from, to) is evaluator(params)'"))?;

        let group = |name: &str| caps.name(name).map(|m| m.as_str().to_string());

        let evaluator_word = group("evaluator").unwrap_or_default();
        let evaluator = EvaluatorKind::from_word(&evaluator_word)
            .ok_or_else(|| invalid(&format!("unknown evaluator '{evaluator_word}'")))?;

        let panel_id = group("panel")
            .unwrap_or_default()
            .parse::<u64>()
            .map_err(|e| invalid(&format!("panel id: {e}")))?;

        let params = group("params")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<f64>().map_err(|e| invalid(&format!("param '{p}': {e}"))))
            .collect::<Result<Vec<_>>>()?;

        let wanted = match evaluator {
            EvaluatorKind::Gt | EvaluatorKind::Lt => 1,
            EvaluatorKind::WithinRange | EvaluatorKind::OutsideRange => 2,
            EvaluatorKind::NoValue => 0,
        };
        if params.len() != wanted {
            return Err(invalid(&format!(
                "evaluator '{}' takes {} parameter(s), got {}",
                evaluator.as_str(),
                wanted,
                params.len()
            )));
        }

        Ok(AlertRule {
            reducer: group("reducer").unwrap_or_default(),
            dashboard_uid: group("uid").unwrap_or_default(),
            panel_id,
            metric: group("metric").unwrap_or_default(),
            from: group("from").unwrap_or_default(),
            to: group("to").unwrap_or_default(),
            evaluator,
            params,
            frequency: group("every").unwrap_or_else(|| "1m".to_string()),
            pending_for: group("for").unwrap_or_else(|| "0s".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_expression() {
        let rule = AlertRule::parse("avg() of query(wpFnYRwGk/2/bitrate, 15m, now) is below(14)").unwrap();
        assert_eq!(rule.reducer, "avg");
        assert_eq!(rule.dashboard_uid, "wpFnYRwGk");
        assert_eq!(rule.panel_id, 2);
        assert_eq!(rule.metric, "bitrate");
        assert_eq!(rule.from, "15m");
        assert_eq!(rule.to, "now");
        assert_eq!(rule.evaluator, EvaluatorKind::Lt);
        assert_eq!(rule.params, vec![14.0]);
        assert_eq!(rule.frequency, "1m");
        assert_eq!(rule.pending_for, "0s");
    }

    #[test]
    fn parses_for_and_every() {
        let rule = AlertRule::parse(
            "max() of query(summary/76/average, 1m, now) is outside_range(5, 10.5) for (2m) every(30s)",
        )
        .unwrap();
        assert_eq!(rule.evaluator, EvaluatorKind::OutsideRange);
        assert_eq!(rule.params, vec![5.0, 10.5]);
        assert_eq!(rule.pending_for, "2m");
        assert_eq!(rule.frequency, "30s");
    }

    #[test]
    fn novalue_takes_no_params() {
        let rule = AlertRule::parse("avg() of query(abc/1/cpu, 5m, now) is novalue()").unwrap();
        assert_eq!(rule.evaluator, EvaluatorKind::NoValue);
        assert!(rule.params.is_empty());
    }

    #[test]
    fn range_bounds_may_be_negative_or_fractional() {
        let rule = AlertRule::parse("avg() of query(abc/1/temp, 5m, now) is within_range(-2.5, 10.25)").unwrap();
        assert_eq!(rule.params, vec![-2.5, 10.25]);
    }

    #[test]
    fn non_numeric_param_is_rejected() {
        let err = AlertRule::parse("avg() of query(abc/1/cpu, 5m, now) is above(lots)").unwrap_err();
        assert!(err.to_string().contains("param 'lots'"), "{err}");
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "avg of query(abc/1/cpu, 5m, now) is below(1)",
            "avg() of query(abc/x/cpu, 5m, now) is below(1)",
            "avg() of query(abc/1/cpu, 5m, now) is sideways(1)",
            "avg() of query(abc/1/cpu, 5m, now) is below(1, 2)",
        ] {
            assert!(
                matches!(AlertRule::parse(bad), Err(StagehandError::InvalidMetricsExpr(_))),
                "{bad}"
            );
        }
    }
}
