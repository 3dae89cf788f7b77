//! Publish gating for the frame channel
//!
//! Capture threads never publish directly. They go through the gate, which
//! knows which camera is active, how many warm-up frames the newly activated
//! camera still has to drop, and whether the pipeline is shutting down. The
//! check and the publish happen under one lock, so once [`PublishGate::close`]
//! or [`PublishGate::switch_to`] returns no stale publish can follow.

use std::sync::{Mutex, PoisonError};

use crate::capture::{CameraMode, Frame};
use crate::error::ChannelError;
use crate::pipeline::channel::{Channel, FrameChannel, Record};

/// What happened to a frame offered to the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Published under the given channel sequence
    Published(u64),
    /// Dropped as a warm-up frame; `remaining` more will be dropped
    WarmingUp { remaining: u32 },
    /// The offering camera is not the active one
    Inactive,
    /// The pipeline is stopping
    Closed,
}

#[derive(Debug)]
struct GateState {
    active: CameraMode,
    open: bool,
    warmup_remaining: u32,
}

#[derive(Debug)]
pub struct PublishGate {
    state: Mutex<GateState>,
}

impl PublishGate {
    /// Gate with `active` publishing immediately, no warm-up.
    pub fn new(active: CameraMode) -> Self {
        Self {
            state: Mutex::new(GateState {
                active,
                open: true,
                warmup_remaining: 0,
            }),
        }
    }

    /// Offer a frame from `camera`. Only the active camera past its warm-up
    /// reaches the channel.
    pub fn publish(
        &self,
        camera: CameraMode,
        frame: Frame,
        channel: &FrameChannel,
    ) -> Result<GateOutcome, ChannelError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.open {
            return Ok(GateOutcome::Closed);
        }
        if camera != state.active {
            return Ok(GateOutcome::Inactive);
        }
        if state.warmup_remaining > 0 {
            state.warmup_remaining -= 1;
            return Ok(GateOutcome::WarmingUp {
                remaining: state.warmup_remaining,
            });
        }
        channel.publish(frame).map(GateOutcome::Published)
    }

    /// Publish `value` unless the gate is closed. Used by producers that are
    /// not tied to a camera, such as the detector.
    pub fn publish_if_open<T: Record>(
        &self,
        value: T,
        channel: &Channel<T>,
    ) -> Result<Option<u64>, ChannelError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.open {
            return Ok(None);
        }
        channel.publish(value).map(Some)
    }

    /// Hand publishing rights to `camera`, dropping its next `warmup` frames.
    pub fn switch_to(&self, camera: CameraMode, warmup: u32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.active = camera;
        state.warmup_remaining = warmup;
    }

    /// Refuse every later publish.
    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open = false;
    }

    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .open
    }

    pub fn active(&self) -> CameraMode {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::capture::{PixelFormat, RawFrame};

    fn frame(camera: CameraMode, sequence: u64) -> Frame {
        let raw = RawFrame {
            data: Bytes::from_static(&[1, 2, 3, 4]),
            width: 2,
            height: 2,
            format: PixelFormat::Gray8,
            device_timestamp: None,
        };
        Frame::from_raw(raw, camera, sequence)
    }

    #[test]
    fn warmup_frames_never_reach_the_channel() {
        let channel = FrameChannel::in_process(None);
        let gate = PublishGate::new(CameraMode::Day);
        gate.publish(CameraMode::Day, frame(CameraMode::Day, 1), &channel)
            .unwrap();

        gate.switch_to(CameraMode::Night, 3);
        for n in 1..=3 {
            let outcome = gate
                .publish(CameraMode::Night, frame(CameraMode::Night, n), &channel)
                .unwrap();
            assert_eq!(outcome, GateOutcome::WarmingUp { remaining: 3 - n as u32 });
            let latest = channel.latest().unwrap();
            assert_eq!(latest.value.meta.camera, CameraMode::Day);
        }

        let outcome = gate
            .publish(CameraMode::Night, frame(CameraMode::Night, 4), &channel)
            .unwrap();
        assert_eq!(outcome, GateOutcome::Published(2));
        let latest = channel.latest().unwrap();
        assert_eq!(latest.value.meta.camera, CameraMode::Night);
        assert_eq!(latest.value.meta.sequence, 4);
    }

    #[test]
    fn previous_camera_is_shut_out_after_switch() {
        let channel = FrameChannel::in_process(None);
        let gate = PublishGate::new(CameraMode::Day);
        gate.switch_to(CameraMode::Night, 0);
        assert_eq!(
            gate.publish(CameraMode::Day, frame(CameraMode::Day, 5), &channel)
                .unwrap(),
            GateOutcome::Inactive
        );
        assert!(channel.latest().is_none());
    }

    #[test]
    fn closed_gate_publishes_nothing() {
        let channel = FrameChannel::in_process(None);
        let gate = PublishGate::new(CameraMode::Day);
        let detections = crate::pipeline::channel::DetectionChannel::in_process(None);
        gate.close();
        assert!(!gate.is_open());
        assert_eq!(
            gate.publish(CameraMode::Day, frame(CameraMode::Day, 1), &channel)
                .unwrap(),
            GateOutcome::Closed
        );
        let detection = crate::detection::Detection::new(Vec::new(), 1);
        assert_eq!(gate.publish_if_open(detection, &detections).unwrap(), None);
        assert_eq!(channel.stats().published, 0);
        assert!(detections.latest().is_none());
    }
}
