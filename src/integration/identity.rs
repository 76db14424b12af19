//! Identity resolution through an external embedding and profile service.
//!
//! Requests run off the frame loop. Their results are posted to an append-only
//! mailbox keyed by track id, which the tracker drains once at the start of each
//! frame. A result whose track has since been pruned is simply discarded there.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;
use crate::tracker::ImageCrop;

/// Face embedding vector produced by the identity service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

/// Long-term identity record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Profile {
    pub profile_id: String,
    pub display_name: String,
}

/// External embedding and profile store.
///
/// Methods are called from worker threads and may block.
pub trait IdentityService: Send + Sync {
    fn compute_embedding(&self, crop: &ImageCrop) -> Result<Embedding, IdentityError>;

    fn lookup_profile(&self, embedding: &Embedding) -> Result<Option<Profile>, IdentityError>;

    /// Best-effort enrollment of samples from a track that never resolved.
    fn submit_samples(&self, samples: &[Embedding]) -> Result<(), IdentityError>;
}

/// Embedding plus whatever profile it matched.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMatch {
    pub embedding: Embedding,
    pub profile: Option<Profile>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityResult {
    pub track_id: u64,
    pub outcome: Result<IdentityMatch, IdentityError>,
}

/// Where identity requests execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// One short-lived worker thread per request.
    #[default]
    Threaded,
    /// On the calling thread; results still go through the mailbox.
    Inline,
}

pub struct IdentityResolver {
    service: Arc<dyn IdentityService>,
    dispatch: Dispatch,
    mailbox_tx: Sender<IdentityResult>,
    mailbox_rx: Receiver<IdentityResult>,
    in_flight: Arc<AtomicUsize>,
    /// Rung whenever a job finishes; holds at most one pending ring.
    done_tx: Sender<()>,
    done_rx: Receiver<()>,
}

/// Outstanding-work counter shared with the jobs.
#[derive(Clone)]
struct JobGuard {
    in_flight: Arc<AtomicUsize>,
    done: Sender<()>,
}

impl JobGuard {
    fn finish(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        // a full doorbell already wakes the waiter
        let _ = self.done.try_send(());
    }
}

impl IdentityResolver {
    pub fn new(service: Arc<dyn IdentityService>, dispatch: Dispatch) -> Self {
        let (mailbox_tx, mailbox_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);
        Self {
            service,
            dispatch,
            mailbox_tx,
            mailbox_rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            done_tx,
            done_rx,
        }
    }

    fn start_job(&self) -> JobGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        JobGuard {
            in_flight: Arc::clone(&self.in_flight),
            done: self.done_tx.clone(),
        }
    }

    pub fn threaded(service: Arc<dyn IdentityService>) -> Self {
        Self::new(service, Dispatch::Threaded)
    }

    pub fn inline(service: Arc<dyn IdentityService>) -> Self {
        Self::new(service, Dispatch::Inline)
    }

    /// Compute an embedding for `crop` and look up its profile on behalf of `track_id`.
    pub fn request(&self, track_id: u64, crop: ImageCrop) {
        let service = Arc::clone(&self.service);
        let tx = self.mailbox_tx.clone();
        let guard = self.start_job();
        let on_fail = guard.clone();

        let job = move || {
            let outcome = resolve(service.as_ref(), &crop);
            // The receiver lives as long as the resolver; a closed mailbox means shutdown.
            let _ = tx.send(IdentityResult { track_id, outcome });
            guard.finish();
        };

        self.dispatch_job(format!("identity-{track_id}"), job, || {
            let _ = self.mailbox_tx.send(IdentityResult {
                track_id,
                outcome: Err(IdentityError::Embedding("could not start worker".into())),
            });
            on_fail.finish();
        });
    }

    /// Fire-and-forget submission of samples from a track being destroyed.
    pub fn submit_samples(&self, track_id: u64, samples: Vec<Embedding>) {
        if samples.is_empty() {
            return;
        }
        let service = Arc::clone(&self.service);
        let guard = self.start_job();
        let on_fail = guard.clone();

        let job = move || {
            if let Err(err) = service.submit_samples(&samples) {
                debug!("dropping {} samples from track {track_id}: {err}", samples.len());
            }
            guard.finish();
        };

        self.dispatch_job(format!("enroll-{track_id}"), job, move || on_fail.finish());
    }

    fn dispatch_job<F, E>(&self, name: String, job: F, on_spawn_error: E)
    where
        F: FnOnce() + Send + 'static,
        E: FnOnce(),
    {
        match self.dispatch {
            Dispatch::Inline => job(),
            Dispatch::Threaded => {
                if let Err(err) = thread::Builder::new().name(name).spawn(job) {
                    warn!("failed to spawn identity worker: {err}");
                    on_spawn_error();
                }
            }
        }
    }

    /// Take every result posted since the last drain.
    pub fn drain(&self) -> Vec<IdentityResult> {
        self.mailbox_rx.try_iter().collect()
    }

    /// Requests and submissions still running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Block until no work is outstanding or `timeout` passes. Returns whether idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight() == 0 {
                return true;
            }
            if self.done_rx.recv_deadline(deadline).is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

fn resolve(service: &dyn IdentityService, crop: &ImageCrop) -> Result<IdentityMatch, IdentityError> {
    let embedding = service.compute_embedding(crop)?;
    let profile = service.lookup_profile(&embedding)?;
    Ok(IdentityMatch { embedding, profile })
}
