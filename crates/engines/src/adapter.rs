//! The capability-typed engine interface.

use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;

use serde_json::Value;

use lmn_domain::model::{ModelEntry, Recipe};
use lmn_domain::options::RecipeOptions;
use lmn_domain::{Error, Result};

/// Byte stream forwarded verbatim from an engine to the HTTP sink.
pub type ByteStream = Pin<Box<dyn futures_core::Stream<Item = Result<Vec<u8>>> + Send>>;

/// Every operation the gateway can route to an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ChatCompletion,
    Completion,
    Responses,
    Embeddings,
    Reranking,
    AudioTranscriptions,
    AudioSpeech,
    ImageGenerations,
}

impl Operation {
    /// The OpenAI-style path on the engine's local HTTP surface.
    pub fn endpoint(self) -> &'static str {
        match self {
            Operation::ChatCompletion => "/v1/chat/completions",
            Operation::Completion => "/v1/completions",
            Operation::Responses => "/v1/responses",
            Operation::Embeddings => "/v1/embeddings",
            Operation::Reranking => "/v1/reranking",
            Operation::AudioTranscriptions => "/v1/audio/transcriptions",
            Operation::AudioSpeech => "/v1/audio/speech",
            Operation::ImageGenerations => "/v1/images/generations",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::ChatCompletion => "chat_completion",
            Operation::Completion => "completion",
            Operation::Responses => "responses",
            Operation::Embeddings => "embeddings",
            Operation::Reranking => "reranking",
            Operation::AudioTranscriptions => "audio_transcriptions",
            Operation::AudioSpeech => "audio_speech",
            Operation::ImageGenerations => "image_generations",
        }
    }
}

/// Everything an adapter needs to bring a model up. Timeouts come from
/// the adapter's own [`lmn_domain::config::EngineConfig`].
#[derive(Debug, Clone)]
pub struct LoadContext {
    pub model_name: String,
    pub entry: ModelEntry,
    pub options: RecipeOptions,
    pub do_not_upgrade: bool,
}

/// One engine adapter bound to (at most) one subprocess.
///
/// Adapters are created per load admission and dropped on eviction; the
/// subprocess handle lives behind interior mutability so the scheduler can
/// share the adapter across concurrent inference calls.
#[async_trait::async_trait]
pub trait Engine: Send + Sync {
    fn recipe(&self) -> Recipe;

    /// Operations this adapter can forward. The scheduler checks before
    /// dispatching; nothing else enforces it.
    fn capabilities(&self) -> &'static [Operation];

    /// Install the engine binary if needed, spawn the subprocess, and wait
    /// until its health endpoint answers.
    async fn load(&self, ctx: &LoadContext) -> Result<()>;

    /// Terminate the subprocess and release the port. Idempotent.
    async fn unload(&self) -> Result<()>;

    /// Proxy a non-streaming JSON request.
    async fn forward_json(&self, op: Operation, body: Value) -> Result<Value>;

    /// Proxy a streaming request, byte for byte.
    async fn forward_stream(&self, op: Operation, body: Vec<u8>) -> Result<ByteStream>;

    /// Re-post a staged audio upload to the engine. Only the ASR adapter
    /// implements this.
    async fn transcribe(
        &self,
        _audio: &Path,
        _fields: &HashMap<String, String>,
    ) -> Result<Value> {
        Err(Error::UnsupportedOperation {
            op: Operation::AudioTranscriptions.name().to_string(),
            device: self.recipe().device_class().to_string(),
        })
    }
}

/// Capability check used by the scheduler before dispatch.
pub fn supports(engine: &dyn Engine, op: Operation) -> bool {
    engine.capabilities().contains(&op)
}
