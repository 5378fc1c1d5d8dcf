use std::env;
use std::fmt::Display;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, ensure, Result};

/// Runtime settings, read from the environment (and `.env`) once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub ollama_url: String,
    pub ollama_model: String,
    pub temperature: Option<f32>,
    pub request_timeout: Duration,
    /// Messages kept per conversation.
    pub history_capacity: NonZeroUsize,
    /// Backend calls allowed in flight at once.
    pub max_concurrent_generations: usize,
    /// Fragments buffered per stream before the producer waits.
    pub stream_buffer: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let temperature = match lookup("TEMPERATURE") {
            Some(raw) => Some(parse("TEMPERATURE", &raw)?),
            None => None,
        };
        let timeout_secs: u64 = parse("REQUEST_TIMEOUT_SECS", &var("REQUEST_TIMEOUT_SECS", "120"))?;

        let config = Self {
            bind_addr: var("BIND_ADDR", "127.0.0.1"),
            port: parse("PORT", &var("PORT", "8080"))?,
            ollama_url: var("OLLAMA_URL", "http://localhost:11434"),
            ollama_model: var("OLLAMA_MODEL", "llama3.2"),
            temperature,
            request_timeout: Duration::from_secs(timeout_secs),
            history_capacity: parse("HISTORY_CAPACITY", &var("HISTORY_CAPACITY", "100"))?,
            max_concurrent_generations: parse(
                "MAX_CONCURRENT_GENERATIONS",
                &var("MAX_CONCURRENT_GENERATIONS", "16"),
            )?,
            stream_buffer: parse("STREAM_BUFFER", &var("STREAM_BUFFER", "32"))?,
        };

        ensure!(timeout_secs > 0, "REQUEST_TIMEOUT_SECS must be greater than zero");
        ensure!(
            config.max_concurrent_generations > 0,
            "MAX_CONCURRENT_GENERATIONS must be greater than zero"
        );
        ensure!(config.stream_buffer > 0, "STREAM_BUFFER must be greater than zero");
        Ok(config)
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow!("invalid value for {key} ({raw:?}): {e}"))
}
