//! Deterministic stand-ins for the vision capabilities and the event sink.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use image::{GrayImage, RgbImage};

use crate::capability::{CapabilityError, Detector, TrackUpdate, Tracker, TrackerFactory};
use crate::emitter::{EventSink, OverspeedEvent, SinkError};
use crate::geometry::BoundingBox;

/// Returns queued detection batches one call at a time, then nothing.
#[derive(Default)]
pub struct ScriptedDetector {
    batches: VecDeque<Result<Vec<BoundingBox>, String>>,
    pub calls: usize,
}

impl ScriptedDetector {
    pub fn new(batches: Vec<Vec<BoundingBox>>) -> Self {
        Self {
            batches: batches.into_iter().map(Ok).collect(),
            calls: 0,
        }
    }

    pub fn push_failure(&mut self, message: &str) {
        self.batches.push_back(Err(message.to_string()));
    }
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, _gray: &GrayImage) -> Result<Vec<BoundingBox>, CapabilityError> {
        self.calls += 1;
        match self.batches.pop_front() {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(msg)) => Err(CapabilityError::Detect(msg)),
            None => Ok(Vec::new()),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// One tracker step.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// Stay put with the given quality.
    Hold(f64),
    /// Shift the box by `dy` pixels (down is positive).
    Down(u32, f64),
    Fail,
}

/// Replays its steps; the last step repeats forever.
pub struct ScriptedTracker {
    bbox: BoundingBox,
    steps: VecDeque<Step>,
    last: Step,
}

impl Tracker for ScriptedTracker {
    fn update(&mut self, _frame: &RgbImage) -> Result<TrackUpdate, CapabilityError> {
        let step = self.steps.pop_front().unwrap_or(self.last);
        self.last = step;
        match step {
            Step::Hold(quality) => Ok(TrackUpdate {
                bbox: self.bbox,
                quality,
            }),
            Step::Down(dy, quality) => {
                self.bbox.y += dy;
                Ok(TrackUpdate {
                    bbox: self.bbox,
                    quality,
                })
            }
            Step::Fail => Err(CapabilityError::Update("scripted failure".into())),
        }
    }
}

/// Hands each seeded tracker the next script; steady trackers once the
/// scripts run out.
pub struct ScriptedFactory {
    scripts: VecDeque<Vec<Step>>,
    fail_seed: bool,
}

impl ScriptedFactory {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: scripts.into(),
            fail_seed: false,
        }
    }

    pub fn steady() -> Self {
        Self::new(Vec::new())
    }

    pub fn failing() -> Self {
        Self {
            scripts: VecDeque::new(),
            fail_seed: true,
        }
    }
}

impl TrackerFactory for ScriptedFactory {
    fn seed(
        &mut self,
        _frame: &RgbImage,
        bbox: BoundingBox,
    ) -> Result<Box<dyn Tracker>, CapabilityError> {
        if self.fail_seed {
            return Err(CapabilityError::Seed("scripted failure".into()));
        }
        let steps: VecDeque<Step> = self
            .scripts
            .pop_front()
            .unwrap_or_else(|| vec![Step::Hold(10.0)])
            .into();
        let last = steps.back().copied().unwrap_or(Step::Hold(10.0));
        Ok(Box::new(ScriptedTracker { bbox, steps, last }))
    }
}

/// Keeps every submitted event, or rejects them all.
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<OverspeedEvent>>>,
    reject: Option<SinkError>,
}

impl CollectingSink {
    pub fn rejecting(error: SinkError) -> Self {
        Self {
            events: Arc::default(),
            reject: Some(error),
        }
    }

    pub fn events(&self) -> Vec<OverspeedEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CollectingSink {
    fn submit(&self, event: OverspeedEvent) -> Result<(), SinkError> {
        if let Some(e) = &self.reject {
            return Err(e.clone());
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
