//! Noise classifier boundary.
//!
//! The model itself lives outside the engine; only its verdict contract is
//! consumed. `TimedClassifier` bounds any implementation with a timeout by
//! running it on a dedicated worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::EngineResult;
use crate::gate::EmergencyVerdict;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("unavailable")]
    Unavailable,

    #[error("failed: {0}")]
    Failed(String),
}

pub trait NoiseClassifier: Send + Sync {
    fn classify(
        &self,
        samples: &[f64],
        sample_rate: u32,
    ) -> Result<EmergencyVerdict, ClassifierError>;
}

/// Always returns the same verdict.
pub struct StaticClassifier(pub EmergencyVerdict);

impl NoiseClassifier for StaticClassifier {
    fn classify(
        &self,
        _samples: &[f64],
        _sample_rate: u32,
    ) -> Result<EmergencyVerdict, ClassifierError> {
        Ok(self.0.clone())
    }
}

/// Classifier that is never reachable. Drives the gate's failure policy.
pub struct UnavailableClassifier;

impl NoiseClassifier for UnavailableClassifier {
    fn classify(
        &self,
        _samples: &[f64],
        _sample_rate: u32,
    ) -> Result<EmergencyVerdict, ClassifierError> {
        Err(ClassifierError::Unavailable)
    }
}

struct Job {
    samples: Vec<f64>,
    sample_rate: u32,
    reply: Sender<Result<EmergencyVerdict, ClassifierError>>,
}

/// Runs `inner` on its own thread and waits at most `timeout` per call.
///
/// One job is in flight at a time. While a timed-out job is still running,
/// further calls report `Unavailable` instead of queueing behind it. The
/// worker exits once the `TimedClassifier` is dropped.
pub struct TimedClassifier {
    jobs: Sender<Job>,
    /// Set by the caller before handing over a job, cleared by the worker
    /// once the job finishes.
    busy: Arc<AtomicBool>,
    timeout: Duration,
}

impl TimedClassifier {
    pub fn new(inner: Arc<dyn NoiseClassifier>, timeout: Duration) -> EngineResult<Self> {
        let (jobs, rx) = bounded::<Job>(1);
        let busy = Arc::new(AtomicBool::new(false));
        let worker_busy = busy.clone();
        thread::Builder::new()
            .name("anc-classifier".into())
            .spawn(move || {
                for job in rx.iter() {
                    let verdict = inner.classify(&job.samples, job.sample_rate);
                    worker_busy.store(false, Ordering::Release);
                    // caller may have given up already
                    let _ = job.reply.send(verdict);
                }
                debug!("classifier worker exiting");
            })?;
        Ok(Self {
            jobs,
            busy,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl NoiseClassifier for TimedClassifier {
    fn classify(
        &self,
        samples: &[f64],
        sample_rate: u32,
    ) -> Result<EmergencyVerdict, ClassifierError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("classifier still busy with a previous chunk");
            return Err(ClassifierError::Unavailable);
        }
        let (reply, verdict) = bounded(1);
        let job = Job {
            samples: samples.to_vec(),
            sample_rate,
            reply,
        };
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.busy.store(false, Ordering::Release);
                debug!("classifier job queue full");
                return Err(ClassifierError::Unavailable);
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("classifier worker is gone");
                return Err(ClassifierError::Unavailable);
            }
        }
        match verdict.recv_timeout(self.timeout) {
            Ok(v) => v,
            Err(RecvTimeoutError::Timeout) => Err(ClassifierError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ClassifierError::Failed("classifier worker panicked".into()))
            }
        }
    }
}
