pub mod credential;
pub mod enums;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod queue;

// Re-exports for convenience
pub use credential::{redact, ApiKey, KeyId, SelectedKey, TenantKey};
pub use enums::{CircuitState, KeyTier, MessageRole, Priority};
pub use error::{
    parse_retry_after, ErrorClass, FlowgateError, Result, UpstreamError, UpstreamErrorKind,
};
pub use llm::{ChatMessage, LlmRequest, LlmResponse};
pub use metrics::{minute_floor, RateWindow};
pub use queue::{EnqueueReceipt, PageContext, QueueStats, QueuedItem};
