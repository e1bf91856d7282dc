use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::{GenerationRequest, GenerationResult, Loader, Orchestrator, OrchestratorError};

type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

enum Job {
    Generate {
        request: GenerationRequest,
        response_tx: Reply<GenerationResult>,
    },
    Preload {
        response_tx: Reply<()>,
    },
}

/// Cloneable front door to the single generation worker. Jobs run strictly in
/// submission order, one at a time.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Job>,
}

/// A queued request. Dropping it before the worker reaches it cancels the
/// request; once generation has started it runs to completion regardless.
pub struct PendingGeneration {
    rx: oneshot::Receiver<Result<GenerationResult, OrchestratorError>>,
}

impl PendingGeneration {
    pub async fn wait(self) -> Result<GenerationResult, OrchestratorError> {
        self.rx
            .await
            .map_err(|_| OrchestratorError::WorkerUnavailable)?
    }

    /// Blocks the current thread. Must not be called from async context.
    pub fn wait_blocking(self) -> Result<GenerationResult, OrchestratorError> {
        self.rx
            .blocking_recv()
            .map_err(|_| OrchestratorError::WorkerUnavailable)?
    }
}

/// Moves `orchestrator` onto a dedicated thread that drains the request
/// queue. The thread exits once every handle has been dropped.
pub fn spawn_worker<L>(
    orchestrator: Orchestrator<L>,
) -> std::io::Result<(OrchestratorHandle, JoinHandle<()>)>
where
    L: Loader + 'static,
{
    let (tx, rx) = mpsc::channel::<Job>();
    let worker = thread::Builder::new()
        .name("generation-worker".to_string())
        .spawn(move || {
            for job in rx {
                match job {
                    Job::Generate {
                        request,
                        response_tx,
                    } => {
                        if response_tx.is_closed() {
                            debug!("Skipping request cancelled while queued");
                            continue;
                        }
                        let result = orchestrator.run(&request);
                        if response_tx.send(result).is_err() {
                            debug!("Caller went away before the result was delivered");
                        }
                    }
                    Job::Preload { response_tx } => {
                        let result = orchestrator.preload().map_err(Into::into);
                        if response_tx.send(result).is_err() {
                            debug!("Caller went away before the preload finished");
                        }
                    }
                }
            }
            info!("Generation worker stopped");
        })?;
    Ok((OrchestratorHandle { tx }, worker))
}

impl OrchestratorHandle {
    /// Queues `request` behind everything submitted before it.
    pub fn submit(&self, request: GenerationRequest) -> Result<PendingGeneration, OrchestratorError> {
        let (response_tx, rx) = oneshot::channel();
        self.tx
            .send(Job::Generate {
                request,
                response_tx,
            })
            .map_err(|_| OrchestratorError::WorkerUnavailable)?;
        Ok(PendingGeneration { rx })
    }

    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, OrchestratorError> {
        self.submit(request)?.wait().await
    }

    /// Queues a model load so the first real request doesn't pay for it.
    pub async fn preload(&self) -> Result<(), OrchestratorError> {
        let (response_tx, rx) = oneshot::channel();
        self.tx
            .send(Job::Preload { response_tx })
            .map_err(|_| OrchestratorError::WorkerUnavailable)?;
        rx.await.map_err(|_| OrchestratorError::WorkerUnavailable)?
    }
}
