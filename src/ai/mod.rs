//! Everything that talks to the completion endpoint.

pub mod client;
pub mod parser;
pub mod sse;
pub mod stream;
pub mod transport;

// Re-export main types for convenience
pub use client::{AiClient, AssistantApi, ChunkFn, ProgressFn};
pub use transport::{CompletionRequest, CompletionTransport, HttpTransport};
