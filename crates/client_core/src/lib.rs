//! Client side of the orchestrator protocol: HTTP and SSE transport, the
//! streaming pipeline built on push subscriptions, and the chunk dispatcher.

pub mod config;
pub mod dispatch;
pub mod pipeline;
pub mod push;
pub mod sse;
pub mod transport;

pub use config::{load_config, ClientConfig, StreamConfig};
pub use dispatch::{
    dispatch_target, render, ChunkHandler, ChunkKey, ChunkRenderer, Interaction, Interactions,
    RenderContext, RenderedChunk,
};
pub use pipeline::{
    ConnectionState, EventBuffer, PipelineOptions, PipelineUpdate, StreamPipeline, StreamSessions,
};
pub use push::{PushConnector, PushItem, StreamRequest, StreamSubscription};
pub use transport::{ClientBuildError, OrchestratorClient};
