use async_trait::async_trait;

use fg_types::{LlmRequest, LlmResponse, UpstreamError};

/// The upstream language-model client. Opaque to the governance layer
/// apart from its error classification.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name used to key breakers, rate windows and credentials.
    fn name(&self) -> &str;

    async fn invoke(&self, request: &LlmRequest, api_key: &str) -> Result<LlmResponse, UpstreamError>;
}
