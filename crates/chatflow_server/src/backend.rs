use anyhow::Context as _;
use chatflow_api::{DispatchRequest, DispatchStreamEvent, ModelInfo, PresetCatalog};
use chatflow_domain::DispatchFailure;
use futures::StreamExt as _;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamError {
    Transport(String),
    Malformed(String),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Transport(message) => write!(f, "transport error: {message}"),
            StreamError::Malformed(message) => write!(f, "malformed frame: {message}"),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<StreamError> for DispatchFailure {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Transport(message) => DispatchFailure::Transport(message),
            StreamError::Malformed(message) => DispatchFailure::Malformed(message),
        }
    }
}

pub type DispatchStream = BoxStream<'static, Result<DispatchStreamEvent, StreamError>>;

/// The chat backend as seen by the engine.
pub trait ChatBackend: Send + Sync {
    fn list_models(&self) -> BoxFuture<'_, anyhow::Result<Vec<ModelInfo>>>;

    fn list_presets(&self) -> BoxFuture<'_, anyhow::Result<PresetCatalog>>;

    /// Opens one streaming exchange. Errors before the first frame are
    /// returned directly; later ones arrive through the stream.
    fn dispatch(&self, request: DispatchRequest) -> BoxFuture<'_, anyhow::Result<DispatchStream>>;
}

pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatBackend {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to fetch {url}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("{url} returned {status}: {text}");
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to decode {url}"))
    }
}

impl ChatBackend for HttpChatBackend {
    fn list_models(&self) -> BoxFuture<'_, anyhow::Result<Vec<ModelInfo>>> {
        Box::pin(self.get_json("/api/models"))
    }

    fn list_presets(&self) -> BoxFuture<'_, anyhow::Result<PresetCatalog>> {
        Box::pin(self.get_json("/api/presets"))
    }

    fn dispatch(&self, request: DispatchRequest) -> BoxFuture<'_, anyhow::Result<DispatchStream>> {
        Box::pin(async move {
            let url = self.url("/api/chat/stream");
            let response = self
                .client
                .post(&url)
                .header("Accept", "text/event-stream")
                .json(&request)
                .send()
                .await
                .with_context(|| format!("failed to reach {url}"))?;
            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                anyhow::bail!("{url} returned {status}: {text}");
            }

            let mut decoder = SseDecoder::default();
            let stream = response.bytes_stream().flat_map(move |chunk| {
                let frames = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(err) => vec![Err(StreamError::Transport(err.to_string()))],
                };
                futures::stream::iter(frames)
            });
            Ok(stream.boxed())
        })
    }
}

/// Splits a `text/event-stream` body into decoded `data:` frames.
#[derive(Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Result<DispatchStreamEvent, StreamError>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.drain(..=line_end).collect::<Vec<u8>>();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data.is_empty() {
                continue;
            }
            frames.push(
                serde_json::from_str::<DispatchStreamEvent>(data)
                    .map_err(|err| StreamError::Malformed(format!("{err}: {data}"))),
            );
        }
        frames
    }
}
