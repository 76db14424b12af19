//! TrackerPipeline for running the tracker off the capture thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{debug, warn};

use crate::error::Error;
use crate::tracker::{FaceTracker, Frame, FrameConverter, FrameOutput};

/// A single worker thread that owns a [`FaceTracker`] and consumes frames in order.
///
/// Frames and outputs are both queued on bounded channels. When the worker falls
/// behind, [`TrackerPipeline::try_submit`] drops the new frame. When the consumer
/// falls behind, the oldest unread output is dropped.
pub struct TrackerPipeline {
    frames: Option<Sender<Frame>>,
    outputs: Receiver<FrameOutput>,
    worker: Option<JoinHandle<FaceTracker>>,
}

impl TrackerPipeline {
    /// Move `tracker` onto a new worker thread with room for `capacity` queued
    /// frames and as many unread outputs.
    pub fn spawn(
        tracker: FaceTracker,
        converter: Arc<dyn FrameConverter + Send + Sync>,
        capacity: usize,
    ) -> Result<Self, Error> {
        let capacity = capacity.max(1);
        let (frame_tx, frame_rx) = bounded::<Frame>(capacity);
        let (output_tx, output_rx) = bounded::<FrameOutput>(capacity);

        let stale = output_rx.clone();
        let worker = thread::Builder::new()
            .name("face-tracker".to_string())
            .spawn(move || run(tracker, converter.as_ref(), frame_rx, output_tx, stale))?;

        Ok(Self {
            frames: Some(frame_tx),
            outputs: output_rx,
            worker: Some(worker),
        })
    }

    /// Queue a frame without blocking. Returns false if it was dropped.
    pub fn try_submit(&self, frame: Frame) -> bool {
        let Some(frames) = self.frames.as_ref() else {
            return false;
        };
        match frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                warn!("tracker queue full, dropping frame at t={:.3}", frame.timestamp);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("tracker worker has stopped");
                false
            }
        }
    }

    /// Queue a frame, waiting for room. Returns false if the worker has stopped.
    pub fn submit(&self, frame: Frame) -> bool {
        self.frames.as_ref().is_some_and(|frames| frames.send(frame).is_ok())
    }

    /// Per-frame results, in submission order. Holds at most `capacity` unread outputs.
    pub fn outputs(&self) -> &Receiver<FrameOutput> {
        &self.outputs
    }

    /// Close the queue, let the worker finish what is queued, and take the tracker back.
    ///
    /// Returns `None` if the worker panicked.
    pub fn shutdown(mut self) -> Option<FaceTracker> {
        self.frames.take();
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(tracker) => Some(tracker),
            Err(_) => {
                warn!("tracker worker panicked");
                None
            }
        }
    }
}

impl Drop for TrackerPipeline {
    fn drop(&mut self) {
        self.frames.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run(
    mut tracker: FaceTracker,
    converter: &dyn FrameConverter,
    frames: Receiver<Frame>,
    outputs: Sender<FrameOutput>,
    stale: Receiver<FrameOutput>,
) -> FaceTracker {
    for frame in frames.iter() {
        let mut output = tracker.update(&frame, converter);
        loop {
            match outputs.try_send(output) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    if let Ok(oldest) = stale.try_recv() {
                        warn!("output queue full, dropping output for t={:.3}", oldest.timestamp);
                    }
                    output = rejected;
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("output receiver dropped, discarding frame output");
                    break;
                }
            }
        }
    }
    debug!("tracker worker exiting after {} frames", tracker.frame_count());
    tracker
}
