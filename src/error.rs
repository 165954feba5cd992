use std::sync::Arc;

use thiserror::Error;

use crate::instant::Instant;

/// Classification of a query/mutation failure.
///
/// This is a classification, not a literal wrapper of whatever the
/// transport raised — the transport's own error propagates verbatim via
/// [`QueryError::cause`]; this enum only carries what the retry loop and
/// observers need to reason about the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueryErrorKind {
    #[error("network error")]
    Network,
    #[error("request timed out")]
    Timeout,
    #[error("offline")]
    Offline,
    #[error("bad request")]
    BadRequest,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("server error")]
    ServerError,
    #[error("schema validation failed")]
    Validation,
    #[error("failed to parse response")]
    ParseError,
    #[error("select projection failed")]
    SelectorError,
    #[error("cancelled")]
    Cancelled,
    #[error("unknown error")]
    Unknown,
}

impl QueryErrorKind {
    /// Whether the retry loop should consult remaining attempts for this
    /// class of error, per spec.md §7.
    ///
    /// `Cancelled` is deliberately excluded here too: cancellation never
    /// triggers a retry, but it is handled as a distinct short-circuit
    /// upstream of this check (see `executor::RemoteExecutor`), not as a
    /// "non-retryable error class".
    pub fn retryable(self) -> bool {
        !matches!(
            self,
            QueryErrorKind::BadRequest
                | QueryErrorKind::Unauthorized
                | QueryErrorKind::Forbidden
                | QueryErrorKind::NotFound
                | QueryErrorKind::Conflict
                | QueryErrorKind::Validation
                | QueryErrorKind::Cancelled
        )
    }
}

/// A classified failure from a query or mutation execution.
#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub retryable: bool,
    pub status_code: Option<u16>,
    pub url: Option<String>,
    pub query_key: Option<String>,
    pub retry_count: u32,
    pub timestamp: Instant,
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl QueryError {
    pub fn new(kind: QueryErrorKind) -> Self {
        Self {
            retryable: kind.retryable(),
            kind,
            status_code: None,
            url: None,
            query_key: None,
            retry_count: 0,
            timestamp: Instant::now(),
            cause: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(QueryErrorKind::Cancelled)
    }

    pub fn validation(cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(QueryErrorKind::Validation).with_cause(cause)
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_query_key(mut self, key: impl Into<String>) -> Self {
        self.query_key = Some(key.into());
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, QueryErrorKind::Cancelled)
    }
}
