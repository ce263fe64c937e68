use thiserror::Error;

#[derive(Debug, Error)]
pub enum StagehandError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("invalid schedule '{spec}': {reason}")]
    InvalidSchedule { spec: String, reason: String },

    #[error(
        "too many missed start times (> {limit}). Set or decrease starting_deadline_seconds or check clock skew"
    )]
    TooManyMissedStarts { limit: usize },

    #[error("scheduling violation: {0}")]
    SchedulingViolation(String),

    #[error("invalid expression '{expr}': {reason}")]
    InvalidExpression { expr: String, reason: String },

    #[error("expression references unknown field '{0}'")]
    UnknownField(String),

    #[error("invalid metrics expression: {0}")]
    InvalidMetricsExpr(String),

    #[error("inconsistent alert annotations: {0}")]
    AlertInconsistent(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("remote execution failed: {0}")]
    Exec(String),

    #[error("virtual execution error: {0}")]
    VirtualExec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl StagehandError {
    /// Contract violations. Callers must not retry these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::UnknownField(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Errors that end the current pass with a workflow-level failure.
    pub fn is_scheduling_violation(&self) -> bool {
        matches!(
            self,
            Self::TooManyMissedStarts { .. } | Self::SchedulingViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StagehandError>;
