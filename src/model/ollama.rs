use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ChatModel, ChunkStream, ModelError};
use crate::config::Config;
use crate::memory::Message;

const DEFAULT_STREAM_BUFFER: usize = 32;

/// Client for an Ollama server's `/api/chat` endpoint.
pub struct OllamaModel {
    base_url: String,
    model: String,
    temperature: Option<f32>,
    timeout: Duration,
    stream_buffer: usize,
    client: Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

/// One response object; the streaming body is a newline-separated run of these.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OllamaModel {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: None,
            timeout,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            client,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        info!("Using Ollama server at: {} (model {})", config.ollama_url, config.ollama_model);
        let mut model = Self::new(&config.ollama_url, &config.ollama_model, config.request_timeout)?;
        model.temperature = config.temperature;
        model.stream_buffer = config.stream_buffer;
        Ok(model)
    }

    fn request<'a>(&'a self, messages: &'a [Message], stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages,
            stream,
            options: self.temperature.map(|temperature| ChatOptions { temperature }),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn transport_error(&self, err: reqwest::Error) -> ModelError {
        if err.is_timeout() {
            ModelError::Timeout(self.timeout)
        } else {
            ModelError::Backend(err.to_string())
        }
    }

    async fn check_status(response: Response) -> Result<Response, ModelError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ModelError::Backend(format!("{status}: {body}")))
    }
}

#[async_trait]
impl ChatModel for OllamaModel {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let messages = [Message::user(prompt)];
        let payload = self.request(&messages, false);
        debug!("Completion prompt: {}", prompt);

        let response = self
            .client
            .post(self.chat_url())
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = Self::check_status(response).await?;

        let body: ChatResponse = response.json().await.map_err(|e| self.transport_error(e))?;
        if let Some(err) = body.error {
            return Err(ModelError::Backend(err));
        }
        let content = body
            .message
            .and_then(|m| m.content)
            .ok_or_else(|| ModelError::Backend("response carried no message content".into()))?;

        info!("Completion length: {} characters", content.len());
        Ok(content)
    }

    async fn stream(&self, messages: Vec<Message>) -> Result<ChunkStream, ModelError> {
        let payload = self.request(&messages, true);
        debug!(
            "Opening stream with {} prompt messages, latest: {:?}",
            messages.len(),
            messages.last().map(Message::content)
        );

        let send = self.client.post(self.chat_url()).json(&payload).send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| ModelError::Timeout(self.timeout))?
            .map_err(|e| self.transport_error(e))?;
        let response = Self::check_status(response).await?;

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        tokio::spawn(read_stream(response, tx, self.timeout));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Owns the response body for the life of the stream. Returning from here
/// drops the body, which closes the connection.
async fn read_stream(response: Response, tx: mpsc::Sender<Result<String, ModelError>>, idle: Duration) {
    let mut body = Box::pin(response.bytes_stream());
    let mut lines = LineBuffer::default();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                debug!("Stream consumer went away, closing backend connection");
                return;
            }
            next = tokio::time::timeout(idle, body.next()) => next,
        };

        let at_end = matches!(next, Ok(None));
        let pending = match next {
            Err(_) => {
                warn!("Backend stream idle for {:?}", idle);
                let _ = tx.send(Err(ModelError::Timeout(idle))).await;
                return;
            }
            Ok(Some(Err(e))) => {
                let _ = tx.send(Err(ModelError::Backend(e.to_string()))).await;
                return;
            }
            Ok(Some(Ok(frame))) => lines.push(&frame),
            Ok(None) => lines.finish(),
        };

        for line in pending {
            match line.and_then(|l| parse_fragment(&l)) {
                Ok(fragment) => {
                    if let Some(text) = fragment.text {
                        if tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    if fragment.done {
                        return;
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }
        }

        if at_end {
            return;
        }
    }
}

#[derive(Debug, PartialEq)]
struct Fragment {
    text: Option<String>,
    done: bool,
}

fn parse_fragment(line: &str) -> Result<Fragment, ModelError> {
    let response: ChatResponse = serde_json::from_str(line)
        .map_err(|e| ModelError::Backend(format!("malformed stream line: {e}")))?;
    if let Some(err) = response.error {
        return Err(ModelError::Backend(err));
    }
    let text = response
        .message
        .and_then(|m| m.content)
        .filter(|content| !content.is_empty());
    Ok(Fragment { text, done: response.done })
}

/// Reassembles newline-delimited lines from arbitrarily split frames. Bytes are
/// buffered raw so multi-byte characters may straddle frames.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, frame: &[u8]) -> Vec<Result<String, ModelError>> {
        self.pending.extend_from_slice(frame);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(line) = decode_line(&line[..pos]) {
                lines.push(line);
            }
        }
        lines
    }

    fn finish(&mut self) -> Vec<Result<String, ModelError>> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest).into_iter().collect()
    }
}

fn decode_line(raw: &[u8]) -> Option<Result<String, ModelError>> {
    match std::str::from_utf8(raw) {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(Ok(line.trim().to_string())),
        Err(e) => Some(Err(ModelError::Backend(format!("stream line is not UTF-8: {e}")))),
    }
}
