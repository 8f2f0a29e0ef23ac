/// A misuse or unmet precondition attributable to the user, as opposed to a
/// failure of an external subsystem. The CLI prints the hint below the
/// message and exits with a distinct code.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct UserError {
    pub message: String,
    pub hint: Option<String>,
}

impl UserError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }
}

/// Shorthand for bailing with a plain user error.
pub fn user_error(message: impl Into<String>) -> anyhow::Error {
    UserError::new(message).into()
}

/// Shorthand for bailing with a user error carrying a remediation hint.
pub fn user_error_hint(message: impl Into<String>, hint: impl Into<String>) -> anyhow::Error {
    UserError::with_hint(message, hint).into()
}
