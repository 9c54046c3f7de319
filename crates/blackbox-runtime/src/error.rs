#![forbid(unsafe_code)]

//! Error types.
//!
//! | Error | Raised by | Severity |
//! |-------|-----------|----------|
//! | [`ConnectError`] | consumer mount / use | Fatal for that consumer |
//! | [`SelectorError`] | user selectors | Aborts the current pass |
//! | [`PassError`] | `Registry::recompute_all` | Caller decides retry policy |
//!
//! Shape violations are not errors; they go through
//! [`DiagnosticLog`](crate::diagnostics::DiagnosticLog).

use std::fmt;

use crate::diagnostics::DerivationKind;
use crate::id::ConsumerId;

/// Failure reported by a fallible selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorError {
    message: String,
}

impl SelectorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SelectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for SelectorError {}

/// Fatal configuration errors for a consumer node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Neither the capability bundle nor the caller supplied a state source.
    MissingStateSource { name: String },
    /// The wrapped instance was requested but `with_ref` is off.
    WrappedInstanceDisabled { name: String },
    /// The node has already been unmounted.
    Unmounted { name: String },
    /// A derivation failed while the node computed its props outside a pass.
    Derivation {
        name: String,
        derivation: DerivationKind,
        source: SelectorError,
    },
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingStateSource { name } => write!(
                f,
                "could not find a state source for {name}: mount it under a Provider \
                 or pass a state source explicitly"
            ),
            Self::WrappedInstanceDisabled { name } => write!(
                f,
                "to access the wrapped instance of {name}, enable `with_ref` in its ConnectOptions"
            ),
            Self::Unmounted { name } => write!(f, "{name} is not mounted"),
            Self::Derivation {
                name,
                derivation,
                source,
            } => write!(f, "{derivation} of {name} failed: {source}"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Derivation { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A registry pass that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassError {
    /// A selector failed. Slots after `consumer` were not visited and the
    /// previously published snapshot is still current.
    Selector {
        consumer: ConsumerId,
        derivation: DerivationKind,
        source: SelectorError,
    },
    /// A pass was requested while the registry was already borrowed,
    /// typically from inside a selector.
    Reentrant,
}

impl fmt::Display for PassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selector {
                consumer,
                derivation,
                source,
            } => write!(f, "{derivation} for consumer {consumer} failed: {source}"),
            Self::Reentrant => f.write_str("registry pass requested while a pass is in flight"),
        }
    }
}

impl std::error::Error for PassError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Selector { source, .. } => Some(source),
            Self::Reentrant => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn connect_error_messages_name_the_consumer() {
        let err = ConnectError::MissingStateSource {
            name: "Connect(Counter)".into(),
        };
        assert!(err.to_string().contains("Connect(Counter)"));

        let err = ConnectError::WrappedInstanceDisabled {
            name: "Connect(Counter)".into(),
        };
        assert!(err.to_string().contains("with_ref"));
    }

    #[test]
    fn pass_error_exposes_source() {
        let err = PassError::Selector {
            consumer: ConsumerId::new(3),
            derivation: DerivationKind::State,
            source: SelectorError::new("boom"),
        };
        assert_eq!(err.to_string(), "state derivation for consumer #3 failed: boom");
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("boom"));
        assert!(PassError::Reentrant.source().is_none());
    }
}
