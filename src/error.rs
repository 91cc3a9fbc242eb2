use std::fmt;

/// Errors reported by the scheduler's client-facing operations.
///
/// Internal worker faults never surface here; they are logged and routed
/// through the error callback installed at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A caller-supplied argument was invalid: a bad initial state, an empty
    /// description, `Active` passed to a state change, or zero workers.
    BadParameter {
        function: &'static str,
        message: String,
    },

    /// An operation that should always succeed did not, e.g. an id collision
    /// on table insert. Indicates a bug in the caller or the scheduler.
    NoSuccess {
        function: &'static str,
        message: String,
    },
}

impl Error {
    pub(crate) fn bad_parameter(function: &'static str, message: impl Into<String>) -> Self {
        Self::BadParameter {
            function,
            message: message.into(),
        }
    }

    pub(crate) fn no_success(function: &'static str, message: impl Into<String>) -> Self {
        Self::NoSuccess {
            function,
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadParameter { function, message } => {
                write!(f, "{function}: bad parameter: {message}")
            }
            Self::NoSuccess { function, message } => {
                write!(f, "{function}: no success: {message}")
            }
        }
    }
}

impl std::error::Error for Error {}
