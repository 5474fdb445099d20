// system-tests/tests/helpers/in_process_worker.rs
// ============================================================================
// Module: In-Process Worker Launcher
// Description: Sandbox launcher hosting the worker stand-in on a tokio task.
// Purpose: Run end-to-end scenarios without spawning a worker runtime.
// Dependencies: o11y-sandbox, system-tests, tokio, url
// ============================================================================

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use o11y_sandbox::SandboxBindings;
use o11y_sandbox::SandboxError;
use o11y_sandbox::SandboxInstance;
use o11y_sandbox::SandboxLauncher;
use system_tests::worker_stub::WorkerStub;
use system_tests::worker_stub::WorkerStubBindings;
use system_tests::worker_stub::serve;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

/// Time allowed for in-flight requests to finish on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What the hosted worker does when triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Query the platform and post the export.
    Exporting,
    /// Query the platform and never call the collector.
    Silent,
}

/// Launches [`WorkerStub`] on a loopback listener inside the test process.
#[derive(Debug, Clone)]
pub struct InProcessLauncher {
    mode: WorkerMode,
    launches: Arc<Mutex<Vec<WorkerStubBindings>>>,
}

impl InProcessLauncher {
    /// Creates a launcher for `mode`.
    pub fn new(mode: WorkerMode) -> Self {
        Self {
            mode,
            launches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared record of the bindings each launch received.
    pub fn launch_log(&self) -> Arc<Mutex<Vec<WorkerStubBindings>>> {
        Arc::clone(&self.launches)
    }
}

#[async_trait]
impl SandboxLauncher for InProcessLauncher {
    async fn launch(
        &self,
        bindings: &SandboxBindings,
    ) -> Result<Box<dyn SandboxInstance>, SandboxError> {
        let stub_bindings = WorkerStubBindings::from(bindings);
        let mut worker = WorkerStub::new(stub_bindings.clone())
            .map_err(|err| SandboxError::Launch(err.to_string()))?;
        if self.mode == WorkerMode::Silent {
            worker = worker.without_export();
        }
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|err| SandboxError::Launch(format!("failed to bind worker: {err}")))?;
        let addr = listener
            .local_addr()
            .map_err(|err| SandboxError::Launch(format!("failed to read worker address: {err}")))?;
        let base_url = Url::parse(&format!("http://{addr}/"))
            .map_err(|err| SandboxError::Launch(err.to_string()))?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, Arc::new(worker), async move {
            let _ = shutdown_rx.await;
        }));
        if let Ok(mut launches) = self.launches.lock() {
            launches.push(stub_bindings);
        }
        Ok(Box::new(InProcessInstance {
            base_url,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }))
    }
}

/// A worker stand-in served on a tokio task.
struct InProcessInstance {
    base_url: Url,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

#[async_trait]
impl SandboxInstance for InProcessInstance {
    fn base_url(&self) -> &Url {
        &self.base_url
    }

    async fn shutdown(mut self: Box<Self>) -> Result<(), SandboxError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(SandboxError::Shutdown(err.to_string())),
            Ok(Err(err)) => Err(SandboxError::Shutdown(err.to_string())),
            Err(_) => {
                task.abort();
                Err(SandboxError::Shutdown("worker did not stop within grace period".to_string()))
            }
        }
    }
}

impl Drop for InProcessInstance {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
