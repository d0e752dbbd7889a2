//! Model provider contract.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderResult;
use crate::types::{ChatRequest, ChatResponse, StreamChunk};

/// Type alias for boxed chunk streams.
pub type ChunkStream = Pin<Box<dyn Stream<Item = ProviderResult<StreamChunk>> + Send>>;

/// A model provider.
///
/// Implementations own their wire format; the router only sees this
/// contract. Providers that do not support thinking must accept requests
/// with [`crate::ThinkingLevel::None`].
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider id, matched against [`crate::ModelRef::provider`].
    fn id(&self) -> &str;

    /// Complete without streaming.
    ///
    /// The cancellation token aborts the in-flight call.
    async fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> ProviderResult<ChatResponse>;

    /// Stream a completion as a sequence of chunks.
    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> ProviderResult<ChunkStream>;
}

/// Blanket implementation so `Box<dyn ModelProvider>` can stand in wherever
/// a `P: ModelProvider` is required.
#[async_trait]
impl ModelProvider for Box<dyn ModelProvider> {
    fn id(&self) -> &str {
        (**self).id()
    }

    async fn complete(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> ProviderResult<ChatResponse> {
        (**self).complete(request, cancel).await
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> ProviderResult<ChunkStream> {
        (**self).stream(request, cancel).await
    }
}
