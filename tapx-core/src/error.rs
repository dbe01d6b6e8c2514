use crate::models::MockKind;
use thiserror::Error;

/// Connection-level error taxonomy shared by the dispatcher and the codecs.
///
/// Codecs return these wrapped in `anyhow::Error`; the dispatcher downcasts to
/// decide whether a connection failure is worth an error-level log entry.
/// `Cancelled` is treated as success at every component boundary.
#[derive(Debug, Error)]
pub enum TapError {
    #[error("malformed {protocol} frame: {detail}")]
    Malformed {
        protocol: &'static str,
        detail: String,
    },

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("no {kind} mock matched the live request")]
    NoMatch { kind: MockKind },

    #[error("transient i/o failure")]
    Transient(#[source] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl TapError {
    pub fn malformed(protocol: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            protocol,
            detail: detail.into(),
        }
    }

    /// Stable label used as a metric tag and in per-connection logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed",
            Self::UpstreamUnreachable(_) => "upstream_unreachable",
            Self::NoMatch { .. } => "no_match",
            Self::Transient(_) => "transient",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Classify an `anyhow` error chain for dispatcher accounting.
///
/// Raw `std::io::Error`s that were not wrapped by a codec count as transient.
pub fn label_of(err: &anyhow::Error) -> &'static str {
    if let Some(tap) = err.downcast_ref::<TapError>() {
        return tap.label();
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return "transient";
    }
    "internal"
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TapError>()
        .map(TapError::is_cancelled)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_not_reported_as_failure() {
        let err = anyhow::Error::new(TapError::Cancelled);
        assert!(is_cancelled(&err));
        assert_eq!(label_of(&err), "cancelled");
    }

    #[test]
    fn bare_io_errors_count_as_transient() {
        let err = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(label_of(&err), "transient");
    }

    #[test]
    fn unknown_errors_count_as_internal() {
        let err = anyhow::anyhow!("something unexpected");
        assert_eq!(label_of(&err), "internal");
    }
}
