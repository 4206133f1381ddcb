use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use speed_trap_common::config::TrackingConfig;
use speed_trap_common::frame::Frame;
use tracing::{debug, info, warn};

use crate::capability::{Detector, TrackerFactory};
use crate::crossing::{CrossingStep, SpeedEstimator};
use crate::emitter::{EmitOutcome, OverspeedEmitter};
use crate::registry::{DetectionOutcome, TrackId, TrackRegistry, UpdateOutcome};
use crate::slot::FrameSlot;

/// Counters published by the processing loop for the health endpoint.
#[derive(Debug, Default)]
pub struct LoopStats {
    frames: AtomicU64,
    live_tracks: AtomicU64,
    tracks_created: AtomicU64,
    measurements: AtomicU64,
    events_submitted: AtomicU64,
    detector_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames: u64,
    pub live_tracks: u64,
    pub tracks_created: u64,
    pub measurements: u64,
    pub events_submitted: u64,
    pub detector_failures: u64,
}

impl LoopStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            live_tracks: self.live_tracks.load(Ordering::Relaxed),
            tracks_created: self.tracks_created.load(Ordering::Relaxed),
            measurements: self.measurements.load(Ordering::Relaxed),
            events_submitted: self.events_submitted.load(Ordering::Relaxed),
            detector_failures: self.detector_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub track_id: TrackId,
    pub speed_kmh: f64,
    pub elapsed: Duration,
    pub outcome: EmitOutcome,
}

/// Everything that happened in one processing cycle.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Number of candidates, when the detector ran and succeeded.
    pub detections: Option<usize>,
    pub detection: DetectionOutcome,
    pub update: UpdateOutcome,
    /// Tracks that opened a crossing record this cycle.
    pub entered: Vec<TrackId>,
    pub measurements: Vec<Measurement>,
    /// Time between the frame's arrival and the start of this cycle. Only
    /// set for frames taken from the slot.
    pub frame_age_ms: Option<i64>,
}

/// The single processing loop. Owns the track registry, and with it every
/// crossing record; nothing here is shared with other threads except through
/// the frame slot, the speed limit register and the published stats.
pub struct Processor {
    registry: TrackRegistry,
    detector: Box<dyn Detector>,
    trackers: Box<dyn TrackerFactory>,
    estimator: SpeedEstimator,
    emitter: OverspeedEmitter,
    detect_every: u64,
    min_quality: f64,
    idle_sleep: Duration,
    max_idle_sleep: Duration,
    cycle: u64,
    stats: Arc<LoopStats>,
}

impl Processor {
    pub fn new(
        config: &TrackingConfig,
        detector: Box<dyn Detector>,
        trackers: Box<dyn TrackerFactory>,
        emitter: OverspeedEmitter,
    ) -> Self {
        Self {
            registry: TrackRegistry::new(config.tie_break),
            detector,
            trackers,
            estimator: SpeedEstimator::from_config(config),
            emitter,
            detect_every: config.detect_every.max(1),
            min_quality: config.min_quality,
            idle_sleep: Duration::from_millis(config.idle_sleep_ms.max(1)),
            max_idle_sleep: Duration::from_millis(config.max_idle_sleep_ms.max(config.idle_sleep_ms)),
            cycle: 0,
            stats: Arc::new(LoopStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        Arc::clone(&self.stats)
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    /// Run one cycle on `frame`. `now` stamps crossing records.
    pub fn process(&mut self, frame: &Frame, now: Instant) -> CycleReport {
        self.cycle += 1;
        let mut report = CycleReport {
            cycle: self.cycle,
            ..CycleReport::default()
        };

        if self.cycle % self.detect_every == 0 {
            let gray = frame.gray();
            match self.detector.detect(&gray) {
                Ok(candidates) => {
                    debug!(
                        cycle = self.cycle,
                        detector = self.detector.name(),
                        candidates = candidates.len(),
                        "detection pass"
                    );
                    report.detections = Some(candidates.len());
                    report.detection = self.registry.absorb_detections(
                        &frame.image,
                        &candidates,
                        self.trackers.as_mut(),
                    );
                }
                Err(e) => {
                    warn!(cycle = self.cycle, error = %e, "detector failed, skipping detection this cycle");
                    self.stats.detector_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        report.update = self.registry.update_all(&frame.image, self.min_quality);

        for &track_id in &report.update.updated {
            let Some(track) = self.registry.get_mut(track_id) else {
                continue;
            };
            let bbox = track.bbox();
            match self.estimator.observe(track_id, &mut track.crossing, &bbox, now) {
                CrossingStep::None => {}
                CrossingStep::Entered => report.entered.push(track_id),
                CrossingStep::Measured { speed_kmh, elapsed } => {
                    info!(
                        track_id,
                        speed_kmh,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "speed measured"
                    );
                    let outcome =
                        self.emitter
                            .consider(track_id, speed_kmh, &bbox, &frame.image, Local::now());
                    if matches!(outcome, EmitOutcome::Submitted { .. }) {
                        self.stats.events_submitted.fetch_add(1, Ordering::Relaxed);
                    }
                    report.measurements.push(Measurement {
                        track_id,
                        speed_kmh,
                        elapsed,
                        outcome,
                    });
                }
            }
        }

        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        self.stats
            .live_tracks
            .store(self.registry.len() as u64, Ordering::Relaxed);
        self.stats
            .tracks_created
            .fetch_add(report.detection.created.len() as u64, Ordering::Relaxed);
        self.stats
            .measurements
            .fetch_add(report.measurements.len() as u64, Ordering::Relaxed);

        report
    }

    /// Process the slot's frame if it is newer than `last_seq`.
    pub fn poll_once(&mut self, slot: &FrameSlot, last_seq: &mut Option<u64>) -> Option<CycleReport> {
        let frame = slot.take_copy_after(*last_seq)?;
        *last_seq = Some(frame.seq);
        let age_ms = (Utc::now().timestamp_millis() - frame.received_at_ms).max(0);
        let mut report = self.process(&frame, Instant::now());
        report.frame_age_ms = Some(age_ms);
        Some(report)
    }

    /// Run until the process exits. When no new frame is available the loop
    /// sleeps, doubling the pause up to the configured maximum.
    pub fn run(mut self, slot: Arc<FrameSlot>) -> ! {
        info!(
            detect_every = self.detect_every,
            min_quality = self.min_quality,
            line_y = self.estimator.line_y(),
            detector = self.detector.name(),
            "processing loop started"
        );
        let mut last_seq = None;
        let mut backoff = self.idle_sleep;

        loop {
            match self.poll_once(&slot, &mut last_seq) {
                Some(report) => {
                    backoff = self.idle_sleep;
                    if report.cycle % 100 == 0 {
                        debug!(
                            cycle = report.cycle,
                            tracks = self.registry.len(),
                            dropped_frames = slot.overwritten(),
                            frame_age_ms = report.frame_age_ms,
                            "frames processed"
                        );
                    }
                }
                None => {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(self.max_idle_sleep);
                }
            }
        }
    }
}
