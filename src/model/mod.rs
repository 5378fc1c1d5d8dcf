mod ollama;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::memory::Message;

pub use ollama::OllamaModel;

/// Incremental answer fragments, in backend order. Never yields empty strings.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("backend request failed: {0}")]
    Backend(String),
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),
}

/// A text-generation backend. Implementations hold no per-call state.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;

    /// Opens a fresh streaming generation for `messages`. Dropping the returned
    /// stream closes the backend connection.
    async fn stream(&self, messages: Vec<Message>) -> Result<ChunkStream, ModelError>;
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use futures::{stream, StreamExt};
    use std::sync::Mutex;

    /// Backend double that replays a fixed script and records every prompt.
    pub struct ScriptedModel {
        chunks: Vec<Result<String, ModelError>>,
        hang_after_script: bool,
        open_error: Option<ModelError>,
        complete_delay: Duration,
        prompts: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedModel {
        pub fn new(chunks: Vec<Result<&str, ModelError>>) -> Self {
            Self {
                chunks: chunks.into_iter().map(|c| c.map(str::to_string)).collect(),
                hang_after_script: false,
                open_error: None,
                complete_delay: Duration::ZERO,
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn chunks(chunks: &[&str]) -> Self {
            Self::new(chunks.iter().map(|c| Ok(*c)).collect())
        }

        /// Keep the stream open after the script instead of ending it.
        pub fn hanging(mut self) -> Self {
            self.hang_after_script = true;
            self
        }

        pub fn failing_to_open(mut self, err: ModelError) -> Self {
            self.open_error = Some(err);
            self
        }

        pub fn with_complete_delay(mut self, delay: Duration) -> Self {
            self.complete_delay = delay;
            self
        }

        pub fn recorded_prompts(&self) -> Vec<Vec<Message>> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
            if let Some(err) = &self.open_error {
                return Err(err.clone());
            }
            tokio::time::sleep(self.complete_delay).await;
            Ok(format!("answer to {prompt}"))
        }

        async fn stream(&self, messages: Vec<Message>) -> Result<ChunkStream, ModelError> {
            self.prompts.lock().unwrap().push(messages);
            if let Some(err) = &self.open_error {
                return Err(err.clone());
            }
            let script = stream::iter(self.chunks.clone());
            if self.hang_after_script {
                Ok(Box::pin(script.chain(stream::pending())))
            } else {
                Ok(Box::pin(script))
            }
        }
    }
}
