use std::sync::Arc;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use crate::error::{PipelineError, PipelineResult};
use crate::job::{Job, JobStatus};
use crate::orchestrator::{JobOrchestrator, PipelineContext};

/// Returned to the submitter as soon as a job is queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAck {
    pub job_id: String,
    pub session_id: String,
    pub message: String,
}

impl JobAck {
    fn for_job(job: &Job) -> Self {
        JobAck {
            job_id: job.id.clone(),
            session_id: job.session_id.clone(),
            message: "Video received, processing started".to_string(),
        }
    }
}

/// Fixed set of workers pulling jobs from a bounded queue
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    capacity: usize,
    workers: Vec<JoinHandle<()>>,
}

/// A reserved place in the queue. Dropping it gives the place back.
pub struct QueueSlot<'a> {
    permit: mpsc::Permit<'a, Job>,
}

impl QueueSlot<'_> {
    pub fn submit(self, job: Job) -> JobAck {
        let ack = JobAck::for_job(&job);
        debug!("Queued job {}", job.id);
        self.permit.send(job);
        ack
    }
}

impl WorkerPool {
    pub fn start(ctx: Arc<PipelineContext>, workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let orchestrator = Arc::new(JobOrchestrator::new(ctx));

        info!("🔄 Starting {} worker(s), queue capacity {}", workers, capacity);
        let workers = (0..workers)
            .map(|n| tokio::spawn(worker_loop(n, rx.clone(), orchestrator.clone())))
            .collect();

        WorkerPool { tx, capacity, workers }
    }

    /// Reserve a queue place without blocking, or fail with `QueueFull`
    pub fn reserve(&self) -> PipelineResult<QueueSlot<'_>> {
        match self.tx.try_reserve() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(mpsc::error::TrySendError::Full(())) => Err(PipelineError::QueueFull { capacity: self.capacity }),
            Err(mpsc::error::TrySendError::Closed(())) => Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker pool is shut down",
            ))),
        }
    }

    /// Queue a job whose upload is already in place
    pub fn submit(&self, job: Job) -> PipelineResult<JobAck> {
        Ok(self.reserve()?.submit(job))
    }

    /// Jobs accepted but not yet picked up by a worker
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Stop accepting jobs and wait for queued and running ones to finish
    pub async fn shutdown(self) {
        let WorkerPool { tx, workers, .. } = self;
        drop(tx);
        for worker in workers {
            if let Err(e) = worker.await {
                error!("Worker panicked: {}", e);
            }
        }
        info!("All workers stopped");
    }
}

async fn worker_loop(n: usize, rx: Arc<Mutex<mpsc::Receiver<Job>>>, orchestrator: Arc<JobOrchestrator>) {
    debug!("Worker {} ready", n);
    loop {
        let next = rx.lock().await.recv().await;
        let Some(job) = next else { break };

        debug!("Worker {} picked up job {}", n, job.id);
        let job = orchestrator.run(job).await;
        if job.status == JobStatus::Succeeded {
            debug!("Worker {} finished job {}", n, job.id);
        }
    }
    debug!("Worker {} exiting", n);
}
