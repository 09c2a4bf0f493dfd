use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::FileError;
use crate::metrics_consts::{UPLOADS_IN_FLIGHT, UPLOADS_QUEUED, UPLOADS_REJECTED};
use crate::pipeline::{Pipeline, ProcessReport};
use crate::upload;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("upload queue is full")]
    Full,
    #[error("upload queue is shut down")]
    Closed,
    #[error(transparent)]
    Rejected(#[from] FileError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTicket {
    pub id: Uuid,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Processed(ProcessReport),
    Failed(String),
}

/// Returned by [`UploadQueue::submit`]. Callers that don't care about the result can
/// drop it; the upload still runs.
pub struct UploadHandle {
    pub ticket: UploadTicket,
    outcome: oneshot::Receiver<UploadOutcome>,
}

impl UploadHandle {
    /// Resolves once the file is processed. `None` if the queue shut down first.
    pub async fn outcome(self) -> Option<UploadOutcome> {
        self.outcome.await.ok()
    }
}

struct Job {
    ticket: UploadTicket,
    respond: oneshot::Sender<UploadOutcome>,
}

/// Accepts files without waiting for them and processes them in the background, at
/// most `workers` at a time.
pub struct UploadQueue {
    pipeline: Pipeline,
    workers: usize,
    in_flight: Arc<AtomicUsize>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Mutex<Option<mpsc::Receiver<Job>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl UploadQueue {
    pub fn new(pipeline: Pipeline, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            pipeline,
            workers: workers.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Spawns the dispatcher. Submissions made before this are kept in the queue.
    pub fn start(&self) {
        let Some(receiver) = self.receiver.lock().ok().and_then(|mut r| r.take()) else {
            warn!("upload queue already started");
            return;
        };
        let handle = tokio::spawn(dispatch(
            self.pipeline.clone(),
            receiver,
            self.workers,
            self.in_flight.clone(),
        ));
        if let Ok(mut dispatcher) = self.dispatcher.lock() {
            *dispatcher = Some(handle);
        }
        info!(workers = self.workers, "upload queue started");
    }

    /// Files being processed right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Checks the file can be accepted, then enqueues it and returns immediately.
    pub async fn submit(&self, path: &Path) -> Result<UploadHandle, QueueError> {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|s| s.clone())
            .ok_or(QueueError::Closed)?;

        if let Err(e) = upload::admit(path, self.pipeline.settings().max_upload_bytes).await {
            metrics::counter!(UPLOADS_REJECTED, "reason" => "admission").increment(1);
            return Err(e.into());
        }

        let ticket = UploadTicket {
            id: Uuid::now_v7(),
            path: path.to_path_buf(),
        };
        let (respond, outcome) = oneshot::channel();
        let job = Job {
            ticket: ticket.clone(),
            respond,
        };

        match sender.try_send(job) {
            Ok(()) => {
                metrics::counter!(UPLOADS_QUEUED).increment(1);
                info!(ticket = %ticket.id, path = %path.display(), "upload queued");
                Ok(UploadHandle { ticket, outcome })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!(UPLOADS_REJECTED, "reason" => "full").increment(1);
                Err(QueueError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    /// Stops accepting uploads and waits for queued and running ones to finish.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let dispatcher = self.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!("upload dispatcher failed: {}", e);
            }
        }
        info!("upload queue drained");
    }
}

/// Counts one running upload for as long as it is alive.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        let running = counter.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!(UPLOADS_IN_FLIGHT).set(running as f64);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let running = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!(UPLOADS_IN_FLIGHT).set(running as f64);
    }
}

async fn dispatch(
    pipeline: Pipeline,
    mut receiver: mpsc::Receiver<Job>,
    workers: usize,
    in_flight: Arc<AtomicUsize>,
) {
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            job = receiver.recv() => {
                let Some(job) = job else {
                    break;
                };
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let pipeline = pipeline.clone();
                let guard = InFlightGuard::enter(&in_flight);
                tasks.spawn(async move {
                    let _running = (permit, guard);
                    run_job(&pipeline, job).await;
                });
            }
            Some(result) = tasks.join_next(), if !tasks.is_empty() => log_join(result),
        }
    }

    while let Some(result) = tasks.join_next().await {
        log_join(result);
    }
}

async fn run_job(pipeline: &Pipeline, job: Job) {
    let Job { ticket, respond } = job;
    let outcome = match pipeline.process_file(&ticket.path).await {
        Ok(report) => UploadOutcome::Processed(report),
        Err(e) => UploadOutcome::Failed(e.to_string()),
    };
    if respond.send(outcome).is_err() {
        debug!(ticket = %ticket.id, "nobody waiting for upload outcome");
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        error!("upload task panicked: {}", e);
    }
}
