pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds used for retry and reporting decisions.
///
/// The taxonomy is two-level: every error is either permanent (surfaced to
/// the caller as-is) or temporary (a retry candidate). Two temporary kinds
/// are special-cased: [`Error::ConsumerLost`] escapes the retry driver so the
/// run loop can re-create the server-side consumer, and
/// [`Error::TemporaryAuthentication`] marks a token endpoint that is
/// unreachable rather than one that rejected the credentials.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    Permanent(String),
    #[error("{0}")]
    Temporary(String),
    #[error("operation aborted: stop requested")]
    Stopped,
    #[error("consumer not found: {0}")]
    ConsumerLost(String),
    #[error("authentication rejected: {0}")]
    PermanentAuthentication(String),
    #[error("authentication unavailable: {0}")]
    TemporaryAuthentication(String),
}

impl Error {
    pub(crate) fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent(reason.into())
    }

    pub(crate) fn temporary(reason: impl Into<String>) -> Self {
        Self::Temporary(reason.into())
    }

    /// Whether the retry driver may re-attempt the failed operation.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::Temporary(_) | Self::ConsumerLost(_) | Self::TemporaryAuthentication(_)
        )
    }

    /// Negation of [`Error::is_temporary`].
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_temporary()
    }

    /// Whether the server no longer recognises the consumer instance.
    #[must_use]
    pub fn is_consumer_loss(&self) -> bool {
        matches!(self, Self::ConsumerLost(_))
    }

    /// Whether the operation was aborted by a stop request.
    #[must_use]
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_loss_is_temporary_but_flagged() {
        let err = Error::ConsumerLost("c-1".into());
        assert!(err.is_temporary());
        assert!(err.is_consumer_loss());
        assert!(!err.is_stop());
    }

    #[test]
    fn stop_is_permanent() {
        assert!(Error::Stopped.is_permanent());
        assert!(Error::Stopped.is_stop());
    }

    #[test]
    fn authentication_kinds_split_by_retryability() {
        assert!(Error::TemporaryAuthentication("down".into()).is_temporary());
        assert!(Error::PermanentAuthentication("denied".into()).is_permanent());
    }
}
