//! Lifecycle observers fanned out to on every client event.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::QueryError;

/// A lifecycle observer registered with [`crate::client::QueryClient::use_plugin`].
///
/// Mirrors the teacher's `async_trait`-based `QueryPersister` in shape (every
/// hook defaults to a no-op, so implementors override only what they need).
/// Plugins run in registration order; each hook returns `()` rather than a
/// `Result`, so there is nothing for a plugin to propagate back into the
/// fetch pipeline in the first place.
#[async_trait(?Send)]
pub trait Plugin {
    async fn on_fetch_start(&self, _key: &Value) {}
    async fn on_fetch_success(&self, _key: &Value, _data: &Value) {}
    async fn on_fetch_error(&self, _key: &Value, _error: &QueryError) {}
    async fn on_invalidate(&self, _key: &Value) {}
    async fn on_query_updated(&self, _key: &Value, _data: &Value) {}
}
