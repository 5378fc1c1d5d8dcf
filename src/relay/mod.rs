use std::sync::Arc;

use futures::StreamExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::memory::{ConversationStore, Message};
use crate::model::{ChatModel, ChunkStream, ModelError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("generation worker unavailable: {0}")]
    WorkerUnavailable(String),
    #[error("invalid conversation id: {0}")]
    InvalidConversationId(String),
}

/// Longest caller-chosen conversation id accepted.
pub const MAX_CONVERSATION_ID_LEN: usize = 128;

/// How a streamed answer ended.
#[derive(Debug)]
enum Outcome {
    Completed(String),
    Failed,
    Cancelled,
}

/// Connects HTTP requests to the model and keeps streamed exchanges in the
/// conversation store.
pub struct RelayService {
    store: Arc<ConversationStore>,
    model: Arc<dyn ChatModel>,
    workers: Arc<Semaphore>,
    stream_buffer: usize,
    default_conversation: String,
}

impl RelayService {
    pub fn new(
        store: Arc<ConversationStore>,
        model: Arc<dyn ChatModel>,
        max_concurrent: usize,
        stream_buffer: usize,
    ) -> Self {
        Self {
            store,
            model,
            workers: Arc::new(Semaphore::new(max_concurrent)),
            stream_buffer,
            default_conversation: Uuid::new_v4().to_string(),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Conversation shared by every caller that does not name one.
    pub fn default_conversation(&self) -> &str {
        &self.default_conversation
    }

    /// Resolves the caller's conversation. Named ids must be visible ASCII of
    /// at most [`MAX_CONVERSATION_ID_LEN`] bytes so they can be echoed in a header.
    pub fn conversation_id(&self, requested: Option<&str>) -> Result<String, RelayError> {
        let id = match requested.map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => return Ok(self.default_conversation.clone()),
        };
        if id.len() > MAX_CONVERSATION_ID_LEN {
            return Err(RelayError::InvalidConversationId(format!(
                "longer than {MAX_CONVERSATION_ID_LEN} bytes"
            )));
        }
        if !id.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(RelayError::InvalidConversationId(
                "only visible ASCII characters are allowed".into(),
            ));
        }
        Ok(id.to_string())
    }

    /// One-shot answer. Runs on a pooled worker task and does not touch history.
    pub async fn ask(&self, question: &str) -> Result<String, RelayError> {
        let model = Arc::clone(&self.model);
        let workers = Arc::clone(&self.workers);
        let question = question.to_string();

        let worker = tokio::spawn(async move {
            let _permit = acquire(workers).await?;
            model.complete(&question).await.map_err(RelayError::from)
        });
        worker
            .await
            .map_err(|e| RelayError::WorkerUnavailable(e.to_string()))?
    }

    /// Streams an answer to `question` within `conversation_id`.
    ///
    /// The question is stored before the prompt is built from the conversation.
    /// The returned stream forwards fragments as the backend produces them; the
    /// joined answer is stored only if the backend finishes cleanly and the
    /// caller is still listening. Errors opening the backend stream are
    /// returned directly; later errors end the stream.
    pub async fn ask_stream(&self, conversation_id: &str, question: &str) -> Result<ChunkStream, RelayError> {
        let permit = acquire(Arc::clone(&self.workers)).await?;

        self.store.append(conversation_id, Message::user(question));
        let prompt = self.store.get(conversation_id);
        debug!("Prompt for conversation {} has {} messages", conversation_id, prompt.len());

        let upstream = self.model.stream(prompt).await?;

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let store = Arc::clone(&self.store);
        let conversation_id = conversation_id.to_string();
        tokio::spawn(async move {
            let _permit: OwnedSemaphorePermit = permit;
            match forward(upstream, &tx).await {
                Outcome::Completed(answer) => {
                    store.append(&conversation_id, Message::assistant(answer));
                    info!(
                        "Stored answer in conversation {} ({} messages)",
                        conversation_id,
                        store.len(&conversation_id)
                    );
                }
                Outcome::Failed => warn!("Stream for conversation {} failed, answer not stored", conversation_id),
                Outcome::Cancelled => info!("Client left conversation {} mid-stream", conversation_id),
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn acquire(workers: Arc<Semaphore>) -> Result<OwnedSemaphorePermit, RelayError> {
    workers
        .acquire_owned()
        .await
        .map_err(|e| RelayError::WorkerUnavailable(e.to_string()))
}

/// Sends every non-empty fragment to the caller while collecting the answer.
/// Gives up on the upstream as soon as the caller stops listening.
async fn forward(mut upstream: ChunkStream, tx: &mpsc::Sender<Result<String, ModelError>>) -> Outcome {
    let mut answer = String::new();
    loop {
        let next = tokio::select! {
            _ = tx.closed() => return Outcome::Cancelled,
            next = upstream.next() => next,
        };
        match next {
            Some(Ok(fragment)) => {
                if fragment.is_empty() {
                    continue;
                }
                answer.push_str(&fragment);
                if tx.send(Ok(fragment)).await.is_err() {
                    return Outcome::Cancelled;
                }
            }
            Some(Err(err)) => {
                let _ = tx.send(Err(err)).await;
                return Outcome::Failed;
            }
            None => return Outcome::Completed(answer),
        }
    }
}
