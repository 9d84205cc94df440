//! Per-job rendezvous between a build thread and its single live viewer.
//!
//! The build registers a slot before it starts and then waits, bounded, for a
//! viewer to hand over a writer. The first viewer to [`LiveStreams::attach`]
//! claims the slot; later viewers are refused.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::io::process::Viewer;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("no live stream for job {0}")]
    UnknownJob(String),
    #[error("job {0} already has a live viewer")]
    AlreadyAttached(String),
    #[error("job {0} stopped waiting for a viewer")]
    Expired(String),
}

/// Build-thread end of a slot.
pub struct LiveSlot {
    job_id: String,
    rx: Receiver<Viewer>,
    streams: LiveStreams,
}

impl LiveSlot {
    /// Wait up to `timeout` for a viewer. The slot is closed either way.
    pub fn wait(self, timeout: Duration) -> Option<Viewer> {
        let viewer = match self.rx.recv_timeout(timeout) {
            Ok(viewer) => {
                info!(job_id = %self.job_id, "live viewer attached");
                Some(viewer)
            }
            Err(RecvTimeoutError::Timeout) => {
                info!(job_id = %self.job_id, "no live viewer, building unwatched");
                None
            }
            Err(RecvTimeoutError::Disconnected) => None,
        };
        self.streams.close(&self.job_id);
        // A viewer may have slipped in between the timeout and the close.
        viewer.or_else(|| self.rx.try_recv().ok())
    }
}

enum SlotState {
    Waiting(SyncSender<Viewer>),
    Claimed,
}

/// Registry of open slots, shared between the server and build threads.
#[derive(Clone, Default)]
pub struct LiveStreams {
    slots: Arc<Mutex<HashMap<String, SlotState>>>,
}

impl LiveStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `job_id`; the returned handle belongs to the build thread.
    pub fn register(&self, job_id: &str) -> LiveSlot {
        let (tx, rx) = mpsc::sync_channel(1);
        self.lock()
            .insert(job_id.to_string(), SlotState::Waiting(tx));
        debug!(job_id, "live slot registered");
        LiveSlot {
            job_id: job_id.to_string(),
            rx,
            streams: self.clone(),
        }
    }

    /// Hand `viewer` to the build waiting on `job_id`.
    pub fn attach(&self, job_id: &str, viewer: Viewer) -> Result<(), AttachError> {
        let tx = match self.lock().get_mut(job_id) {
            None => return Err(AttachError::UnknownJob(job_id.to_string())),
            Some(state) => match std::mem::replace(state, SlotState::Claimed) {
                SlotState::Waiting(tx) => tx,
                SlotState::Claimed => {
                    return Err(AttachError::AlreadyAttached(job_id.to_string()));
                }
            },
        };
        tx.try_send(viewer)
            .map_err(|_| AttachError::Expired(job_id.to_string()))
    }

    /// True while `job_id` still has an open or claimed slot.
    pub fn is_open(&self, job_id: &str) -> bool {
        self.lock().contains_key(job_id)
    }

    fn close(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SlotState>> {
        // A panic while holding this lock cannot leave the map inconsistent.
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::thread;

    struct Sink;

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn first_viewer_wins_second_is_rejected() {
        let streams = LiveStreams::new();
        let slot = streams.register("job");

        streams.attach("job", Box::new(Sink)).expect("first attach");
        assert_eq!(
            streams.attach("job", Box::new(Sink)).expect_err("second attach"),
            AttachError::AlreadyAttached("job".to_string())
        );

        assert!(slot.wait(Duration::from_millis(10)).is_some());
        assert!(!streams.is_open("job"));
    }

    #[test]
    fn unknown_job_is_rejected() {
        let streams = LiveStreams::new();
        assert_eq!(
            streams.attach("nope", Box::new(Sink)).expect_err("unknown"),
            AttachError::UnknownJob("nope".to_string())
        );
    }

    #[test]
    fn wait_times_out_and_closes_slot() {
        let streams = LiveStreams::new();
        let slot = streams.register("job");
        assert!(slot.wait(Duration::from_millis(10)).is_none());
        assert!(matches!(
            streams.attach("job", Box::new(Sink)),
            Err(AttachError::UnknownJob(_))
        ));
    }

    #[test]
    fn viewer_attached_from_another_thread_is_received() {
        let streams = LiveStreams::new();
        let slot = streams.register("job");
        let remote = streams.clone();
        let handle = thread::spawn(move || remote.attach("job", Box::new(Sink)));
        let viewer = slot.wait(Duration::from_secs(5));
        handle.join().expect("join").expect("attach");
        assert!(viewer.is_some());
    }
}
