//! llama-server model runtime.
//!
//! Every loaded model runs in its own llama-server process bound to a
//! loopback port. Generation goes through the server's native `/completion`
//! endpoint; streamed responses arrive as `data: {...}` lines.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{FragmentStream, LoadParams, ModelHandle, ModelRuntime, SamplingParams};
use crate::catalog::ModelDescriptor;
use crate::config::LlamaServerConfig;
use crate::error::{Error, Result};

const HEALTH_CHECK_INTERVAL_MS: u64 = 200;

/// `-ngl` value meaning "offload every layer".
const ALL_GPU_LAYERS: u32 = 999;

type PortSet = Arc<Mutex<HashSet<u16>>>;

/// Spawns one llama-server process per loaded model.
pub struct LlamaServerRuntime {
    config: LlamaServerConfig,
    http_client: Client,
    /// Ports handed out to live servers (only tracked with `base_port`).
    ports: PortSet,
}

impl LlamaServerRuntime {
    pub fn new(config: LlamaServerConfig) -> Self {
        Self {
            config,
            http_client: Client::new(),
            ports: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Allocate a port for a new server.
    async fn allocate_port(&self) -> Result<u16> {
        if let Some(base) = self.config.base_port {
            let mut used = self.ports.lock().await;
            for offset in 0..100u16 {
                let port = base.saturating_add(offset);
                if used.insert(port) {
                    return Ok(port);
                }
            }
            Err(Error::EngineInit(format!(
                "No available ports in range {}-{}",
                base,
                base.saturating_add(100)
            )))
        } else {
            // Use OS-assigned port
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .map_err(|e| Error::EngineInit(format!("Failed to bind for port allocation: {}", e)))?;
            let port = listener
                .local_addr()
                .map_err(|e| Error::EngineInit(format!("Failed to get local addr: {}", e)))?
                .port();
            drop(listener);
            Ok(port)
        }
    }

    fn build_command(&self, model_path: &Path, port: u16, params: &LoadParams) -> Command {
        let mut cmd = Command::new(&self.config.binary);

        // Wrapper arguments (e.g., toolbox run -c llamacpp llama-server)
        // must come before the llama-server flags.
        for arg in &self.config.server_args {
            cmd.arg(arg);
        }
        cmd.arg("-m")
            .arg(model_path)
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("-c")
            .arg(params.context_size.to_string())
            .arg("-ngl")
            .arg(gpu_layers_arg(params.gpu_layers).to_string());

        if let Some(threads) = self.config.threads {
            cmd.arg("-t").arg(threads.to_string());
        }

        for arg in &self.config.extra_args {
            cmd.arg(arg);
        }

        cmd.stdin(Stdio::null()).kill_on_drop(true);

        if self.config.log_server_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        cmd
    }

    /// Poll `/health` until the server answers, the process dies or the
    /// startup timeout elapses.
    async fn wait_for_ready(&self, handle: &LlamaServerHandle) -> Result<()> {
        let timeout = Duration::from_secs(self.config.startup_timeout_secs);
        let start = Instant::now();
        let health_url = format!("{}/health", handle.base_url);

        loop {
            if start.elapsed() > timeout {
                return Err(Error::EngineInit(format!(
                    "llama-server startup timeout for {} after {:?}",
                    handle.model_name,
                    start.elapsed()
                )));
            }

            if !handle.is_process_alive().await {
                return Err(Error::EngineInit(format!(
                    "llama-server process died during startup for {}",
                    handle.model_name
                )));
            }

            if let Ok(resp) = self.http_client.get(&health_url).send().await {
                if resp.status().is_success() {
                    tracing::info!(
                        "llama-server ready for {} on port {} ({:?})",
                        handle.model_name,
                        handle.port,
                        start.elapsed()
                    );
                    return Ok(());
                }
            }

            tokio::time::sleep(Duration::from_millis(HEALTH_CHECK_INTERVAL_MS)).await;
        }
    }

    async fn free_port(&self, port: u16) {
        self.ports.lock().await.remove(&port);
    }
}

#[async_trait]
impl ModelRuntime for LlamaServerRuntime {
    fn runtime_type(&self) -> &'static str {
        "llama_server"
    }

    async fn instantiate(
        &self,
        descriptor: &ModelDescriptor,
        params: &LoadParams,
    ) -> Result<Box<dyn ModelHandle>> {
        if !descriptor.path.is_file() {
            return Err(Error::EngineInit(format!(
                "Model file not found: {}",
                descriptor.path.display()
            )));
        }

        let port = self.allocate_port().await?;
        let mut cmd = self.build_command(&descriptor.path, port, params);

        let process = match cmd.spawn() {
            Ok(process) => process,
            Err(e) => {
                self.free_port(port).await;
                return Err(Error::EngineInit(format!(
                    "Failed to spawn llama-server for {}: {}. Binary: {}",
                    descriptor.name, e, self.config.binary
                )));
            }
        };

        tracing::info!(
            "Spawned llama-server for {} on port {} (pid: {:?}, ctx: {}, gpu layers: {})",
            descriptor.name,
            port,
            process.id(),
            params.context_size,
            params.gpu_layers
        );

        let ports = self.config.base_port.map(|_| self.ports.clone());
        let handle = LlamaServerHandle::new(
            descriptor.name.clone(),
            port,
            format!("http://127.0.0.1:{}", port),
            self.http_client.clone(),
            Some(process),
            ports,
            self.config.shutdown_timeout_secs,
        );

        if let Err(e) = self.wait_for_ready(&handle).await {
            handle.release().await;
            return Err(e);
        }

        Ok(Box::new(handle))
    }
}

fn gpu_layers_arg(gpu_layers: i32) -> u32 {
    u32::try_from(gpu_layers).unwrap_or(ALL_GPU_LAYERS)
}

/// A running llama-server instance serving one model.
pub struct LlamaServerHandle {
    model_name: String,
    port: u16,
    base_url: String,
    http_client: Client,
    process: Mutex<Option<Child>>,
    ports: Option<PortSet>,
    shutdown_timeout_secs: u64,
}

impl LlamaServerHandle {
    fn new(
        model_name: String,
        port: u16,
        base_url: String,
        http_client: Client,
        process: Option<Child>,
        ports: Option<PortSet>,
        shutdown_timeout_secs: u64,
    ) -> Self {
        Self {
            model_name,
            port,
            base_url,
            http_client,
            process: Mutex::new(process),
            ports,
            shutdown_timeout_secs,
        }
    }

    /// Check if the server process is still alive.
    async fn is_process_alive(&self) -> bool {
        let mut process = self.process.lock().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn post_completion(
        &self,
        prompt: &str,
        sampling: &SamplingParams,
    ) -> Result<reqwest::Response> {
        let request = CompletionRequest {
            prompt,
            n_predict: sampling.max_tokens,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            stream: true,
        };
        let url = format!("{}/completion", self.base_url);

        tracing::debug!("Sending completion request to llama-server: {}", url);

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Communication(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Stream(format!("{}: {}", status, body)));
        }

        Ok(response)
    }
}

#[async_trait]
impl ModelHandle for LlamaServerHandle {
    async fn stream(&self, prompt: &str, sampling: &SamplingParams) -> Result<FragmentStream> {
        let response = self.post_completion(prompt, sampling).await?;
        Ok(decode_event_stream(response.bytes_stream()))
    }

    /// Terminate the server process gracefully, killing it after the timeout.
    async fn release(&self) {
        let mut process_guard = self.process.lock().await;
        if let Some(mut child) = process_guard.take() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }

            let wait_result = tokio::time::timeout(
                Duration::from_secs(self.shutdown_timeout_secs),
                child.wait(),
            )
            .await;

            match wait_result {
                Ok(Ok(status)) => {
                    tracing::debug!("llama-server for {} exited with {}", self.model_name, status);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Error waiting for llama-server {}: {}", self.model_name, e);
                }
                Err(_timeout) => {
                    tracing::warn!(
                        "llama-server {} didn't stop gracefully, killing",
                        self.model_name
                    );
                    let _ = child.kill().await;
                }
            }
        }

        if let Some(ports) = &self.ports {
            ports.lock().await.remove(&self.port);
        }
    }
}

// ============================================================================
// llama-server /completion API types
// ============================================================================

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    stream: bool,
}

/// One `data:` payload of a streamed completion.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    stop: bool,
    #[serde(default)]
    error: Option<StreamChunkError>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamChunkError {
    Detailed { message: String },
    Plain(String),
}

impl StreamChunkError {
    fn into_message(self) -> String {
        match self {
            StreamChunkError::Detailed { message } => message,
            StreamChunkError::Plain(message) => message,
        }
    }
}

#[derive(Debug, PartialEq)]
enum StreamLine {
    /// Text, flagged when it arrives on the final chunk.
    Fragment { text: String, last: bool },
    Stop,
    Error(String),
    Ignored,
}

fn parse_stream_line(line: &str) -> StreamLine {
    let Some(payload) = line.strip_prefix("data:") else {
        return StreamLine::Ignored;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return StreamLine::Ignored;
    }
    if payload == "[DONE]" {
        return StreamLine::Stop;
    }

    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(StreamChunk {
            error: Some(error), ..
        }) => StreamLine::Error(error.into_message()),
        Ok(chunk) => match chunk.content {
            Some(text) if !text.is_empty() => StreamLine::Fragment {
                text,
                last: chunk.stop,
            },
            _ if chunk.stop => StreamLine::Stop,
            _ => StreamLine::Ignored,
        },
        Err(e) => StreamLine::Error(format!("Malformed stream payload: {}", e)),
    }
}

struct DecoderState<S> {
    body: std::pin::Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String>>,
    done: bool,
}

impl<S> DecoderState<S> {
    fn handle_line(&mut self, line: &str) {
        match parse_stream_line(line) {
            StreamLine::Fragment { text, last } => {
                self.pending.push_back(Ok(text));
                self.done = last;
            }
            StreamLine::Stop => self.done = true,
            StreamLine::Error(message) => {
                self.pending.push_back(Err(Error::Stream(message)));
                self.done = true;
            }
            StreamLine::Ignored => {}
        }
    }

    fn drain_lines(&mut self) {
        while !self.done {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.handle_line(line.trim_end());
        }
    }

    fn flush(&mut self) {
        if !self.done && !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw);
            self.handle_line(line.trim_end());
        }
        self.done = true;
    }
}

/// Turn a streamed llama-server response body into fragments.
///
/// Nothing is read from `body` until the returned stream is polled.
fn decode_event_stream<S, B, E>(body: S) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = DecoderState {
        body: Box::pin(body),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(bytes.as_ref());
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state
                        .pending
                        .push_back(Err(Error::Stream(format!("Connection to engine lost: {}", e))));
                    state.done = true;
                }
                None => state.flush(),
            }
        }
    }))
}
