use thiserror::Error;

/// Błędne albo sprzeczne progi. Fatalne przy starcie.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    #[error("{field} must be within (0, 1], got {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("{lower} ({lower_value}) must not exceed {upper} ({upper_value})")]
    Ordering {
        lower: &'static str,
        lower_value: u64,
        upper: &'static str,
        upper_value: u64,
    },

    #[error("command cooldown for `{command}` must be greater than zero")]
    ZeroCooldown { command: String },
}

/// Nieudana akcja na platformie. Logujemy i połykamy, bez ponawiania.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnforcementError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("target not found: {0}")]
    NotFound(String),

    #[error("platform request failed: {0}")]
    Transport(String),
}

/// Problemy w trakcie ewaluacji. Orkiestrator zamienia je na decyzję fail-open.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("event of kind {kind} is missing required field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("expected a {expected} event, got {actual}")]
    WrongKind {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("detector panicked: {0}")]
    Panicked(String),
}
