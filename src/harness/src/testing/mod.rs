//! In-memory stand-ins for launched services and connection bootstrappers.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, ReadBuf};
use tokio::task::JoinHandle;

use crate::bootstrap::{BootstrapError, Bootstrapper, ServiceTarget};
use crate::error::HarnessError;
use crate::retry::ProbeResult;
use crate::service::{LogStream, ServiceDefinition, ServiceLauncher, ServiceProcess};

/// Scripted output of one in-memory service.
#[derive(Debug, Clone)]
pub struct ServiceScript {
    lines: Vec<String>,
    line_delay: Duration,
    internal_address: Option<String>,
    fail_start: bool,
    close_after_output: bool,
}

impl ServiceScript {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            line_delay: Duration::from_millis(1),
            internal_address: None,
            fail_start: false,
            close_after_output: false,
        }
    }

    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }

    pub fn with_internal_address(mut self, address: impl Into<String>) -> Self {
        self.internal_address = Some(address.into());
        self
    }

    /// Launching this service fails.
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// The output stream closes after the last line, as if the process exited.
    pub fn closing_after_output(mut self) -> Self {
        self.close_after_output = true;
        self
    }
}

#[derive(Debug, Default)]
struct LauncherState {
    scripts: HashMap<String, ServiceScript>,
    launched: Vec<ServiceDefinition>,
    running: Vec<String>,
    stopped: Vec<String>,
}

/// Launches services whose output is replayed from a [`ServiceScript`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl InMemoryLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the script used when a service with `name` is launched.
    pub fn script(&self, name: impl Into<String>, script: ServiceScript) {
        self.lock().scripts.insert(name.into(), script);
    }

    /// Definitions of every successfully launched service, in launch order.
    pub fn launched(&self) -> Vec<ServiceDefinition> {
        self.lock().launched.clone()
    }

    pub fn running(&self) -> Vec<String> {
        self.lock().running.clone()
    }

    pub fn is_stopped(&self, name: &str) -> bool {
        self.lock().stopped.iter().any(|stopped| stopped == name)
    }

    pub fn stop_order(&self) -> Vec<String> {
        self.lock().stopped.clone()
    }

    fn lock(&self) -> MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ServiceLauncher for InMemoryLauncher {
    async fn launch(&self, definition: &ServiceDefinition) -> Result<Box<dyn ServiceProcess>, HarnessError> {
        let (script, ordinal) = {
            let state = self.lock();
            let script = state.scripts.get(&definition.name).cloned().ok_or_else(|| HarnessError::Start {
                service: definition.name.clone(),
                reason: "no script registered".to_string(),
            })?;
            (script, state.launched.len() + 1)
        };

        if script.fail_start {
            return Err(HarnessError::Start {
                service: definition.name.clone(),
                reason: format!("image {} could not be started", definition.image_ref()),
            });
        }

        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let lines = script.lines.clone();
        let line_delay = script.line_delay;
        let close_after_output = script.close_after_output;
        let output = tokio::spawn(async move {
            for line in lines {
                tokio::time::sleep(line_delay).await;
                if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                    return;
                }
            }
            if !close_after_output {
                // Keep the stream open like a long-running process would.
                std::future::pending::<()>().await;
            }
        });

        let ports = definition
            .ports
            .iter()
            .enumerate()
            .map(|(i, port)| (*port, 40_000 + (ordinal as u16) * 100 + i as u16))
            .collect();
        let target = ServiceTarget {
            service: definition.name.clone(),
            host: "127.0.0.1".to_string(),
            ports,
            internal_address: Some(
                script
                    .internal_address
                    .clone()
                    .unwrap_or_else(|| format!("10.0.0.{ordinal}")),
            ),
        };

        {
            let mut state = self.lock();
            state.launched.push(definition.clone());
            state.running.push(definition.name.clone());
        }

        let stream: LogStream = Box::pin(BufReader::new(reader));
        Ok(Box::new(InMemoryProcess {
            id: format!("{}-{ordinal}", definition.name),
            name: definition.name.clone(),
            stream: Mutex::new(Some(stream)),
            output,
            target,
            state: self.state.clone(),
        }))
    }
}

struct InMemoryProcess {
    id: String,
    name: String,
    stream: Mutex<Option<LogStream>>,
    output: JoinHandle<()>,
    target: ServiceTarget,
    state: Arc<Mutex<LauncherState>>,
}

#[async_trait]
impl ServiceProcess for InMemoryProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn log_streams(&self) -> Vec<LogStream> {
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .into_iter()
            .collect()
    }

    async fn target(&self) -> Result<ServiceTarget, HarnessError> {
        Ok(self.target.clone())
    }

    async fn stop(self: Box<Self>) -> Result<(), HarnessError> {
        self.output.abort();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.running.retain(|name| name != &self.name);
        state.stopped.push(self.name.clone());
        Ok(())
    }
}

/// Bootstrapper backed by a closure, counting its invocations.
pub struct FnBootstrapper<F> {
    connect: F,
    calls: AtomicUsize,
}

impl<F> FnBootstrapper<F> {
    pub fn new<C>(connect: F) -> Self
    where
        F: Fn(&ServiceTarget) -> ProbeResult<C, BootstrapError>,
    {
        Self {
            connect,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F, C> Bootstrapper for FnBootstrapper<F>
where
    F: Fn(&ServiceTarget) -> ProbeResult<C, BootstrapError> + Send + Sync,
    C: Send,
{
    type Connection = C;

    async fn connect(&self, target: &ServiceTarget) -> ProbeResult<C, BootstrapError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.connect)(target)
    }
}

/// Reader that returns exactly one of the given chunks per read, then EOF.
#[derive(Debug, Default)]
pub struct ChunkedReader {
    chunks: VecDeque<Vec<u8>>,
}

impl ChunkedReader {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        Self {
            chunks: chunks.into_iter().map(|c| c.as_ref().to_vec()).collect(),
        }
    }
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut chunk) = self.chunks.pop_front() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            if n < chunk.len() {
                self.chunks.push_front(chunk.split_off(n));
            }
        }
        Poll::Ready(Ok(()))
    }
}
