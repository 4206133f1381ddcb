use image::RgbImage;
use speed_trap_common::config::TieBreak;
use tracing::{debug, info, warn};

use crate::capability::{Tracker, TrackerFactory};
use crate::crossing::CrossingRecord;
use crate::geometry::BoundingBox;

pub type TrackId = u64;

/// One vehicle followed across frames.
pub struct Track {
    id: TrackId,
    tracker: Box<dyn Tracker>,
    bbox: BoundingBox,
    /// Open crossing, if the box is currently transiting the line.
    pub crossing: Option<CrossingRecord>,
}

impl Track {
    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }
}

impl std::fmt::Debug for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Track")
            .field("id", &self.id)
            .field("bbox", &self.bbox)
            .field("crossing", &self.crossing)
            .finish_non_exhaustive()
    }
}

/// What a detection pass did to the registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DetectionOutcome {
    /// (candidate index, reused track id)
    pub matched: Vec<(usize, TrackId)>,
    pub created: Vec<TrackId>,
    pub seed_failures: usize,
}

/// What an update pass did to the registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Tracks with a fresh box this cycle.
    pub updated: Vec<TrackId>,
    /// Tracks dropped for low quality.
    pub removed: Vec<TrackId>,
    /// Tracks whose tracker errored; kept, but not updated this cycle.
    pub failed: Vec<TrackId>,
}

/// Live tracks in creation order, plus the identity counter.
///
/// Owned by the processing loop alone; nothing here is synchronized.
pub struct TrackRegistry {
    tracks: Vec<Track>,
    next_id: TrackId,
    tie_break: TieBreak,
}

impl TrackRegistry {
    pub fn new(tie_break: TieBreak) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 0,
            tie_break,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn ids(&self) -> Vec<TrackId> {
        self.tracks.iter().map(|t| t.id).collect()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    /// The identity the next new track will get.
    pub fn next_id(&self) -> TrackId {
        self.next_id
    }

    /// Existing track that `candidate` belongs to, by mutual centroid
    /// containment. Several matches are resolved by the tie-break policy.
    pub fn find_match(&self, candidate: &BoundingBox) -> Option<TrackId> {
        let mut matches = self
            .tracks
            .iter()
            .filter(|t| t.bbox.mutually_contains(candidate));

        match self.tie_break {
            TieBreak::LastInserted => matches.last().map(|t| t.id),
            TieBreak::NearestCentroid => matches
                .min_by(|a, b| {
                    a.bbox
                        .center_distance_sq(candidate)
                        .total_cmp(&b.bbox.center_distance_sq(candidate))
                        // Equal distance: prefer the newer track, as LastInserted does.
                        .then(b.id.cmp(&a.id))
                })
                .map(|t| t.id),
        }
    }

    /// Match each candidate against the live tracks; unmatched candidates get
    /// a new track seeded on `frame`. Tracks created here take part in
    /// matching the remaining candidates.
    pub fn absorb_detections(
        &mut self,
        frame: &RgbImage,
        candidates: &[BoundingBox],
        factory: &mut dyn TrackerFactory,
    ) -> DetectionOutcome {
        let mut outcome = DetectionOutcome::default();

        for (idx, candidate) in candidates.iter().enumerate() {
            if let Some(id) = self.find_match(candidate) {
                debug!(track_id = id, ?candidate, "detection matched existing track");
                outcome.matched.push((idx, id));
                continue;
            }

            match factory.seed(frame, *candidate) {
                Ok(tracker) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.tracks.push(Track {
                        id,
                        tracker,
                        bbox: *candidate,
                        crossing: None,
                    });
                    info!(track_id = id, ?candidate, "new track");
                    outcome.created.push(id);
                }
                Err(e) => {
                    warn!(error = %e, ?candidate, "failed to seed tracker, skipping detection");
                    outcome.seed_failures += 1;
                }
            }
        }

        outcome
    }

    /// Step every tracker against `frame`. Tracks scoring below
    /// `min_quality` are removed once the whole pass is done.
    pub fn update_all(&mut self, frame: &RgbImage, min_quality: f64) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();

        for track in &mut self.tracks {
            match track.tracker.update(frame) {
                Ok(update) if update.quality < min_quality => {
                    debug!(
                        track_id = track.id,
                        quality = update.quality,
                        min_quality,
                        "tracking quality too low, dropping track"
                    );
                    outcome.removed.push(track.id);
                }
                Ok(update) => {
                    track.bbox = update.bbox;
                    outcome.updated.push(track.id);
                }
                Err(e) => {
                    warn!(track_id = track.id, error = %e, "tracker update failed, keeping last box");
                    outcome.failed.push(track.id);
                }
            }
        }

        if !outcome.removed.is_empty() {
            let removed = &outcome.removed;
            self.tracks.retain(|t| !removed.contains(&t.id));
            for id in removed {
                info!(track_id = id, "track lost");
            }
        }

        outcome
    }

    /// Live tracks in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedFactory, Step};

    fn frame() -> RgbImage {
        RgbImage::new(640, 480)
    }

    #[test]
    fn unmatched_detection_creates_track_with_next_id() {
        let mut reg = TrackRegistry::new(TieBreak::NearestCentroid);
        let mut factory = ScriptedFactory::steady();
        let out = reg.absorb_detections(
            &frame(),
            &[BoundingBox::new(10, 10, 40, 40), BoundingBox::new(300, 10, 40, 40)],
            &mut factory,
        );
        assert_eq!(out.created, vec![0, 1]);
        assert_eq!(reg.ids(), vec![0, 1]);
        assert_eq!(reg.next_id(), 2);
    }

    #[test]
    fn mutually_containing_detection_reuses_identity() {
        let mut reg = TrackRegistry::new(TieBreak::NearestCentroid);
        let mut factory = ScriptedFactory::steady();
        reg.absorb_detections(&frame(), &[BoundingBox::new(100, 100, 50, 50)], &mut factory);

        let drifted = BoundingBox::new(92, 108, 64, 40);
        let out = reg.absorb_detections(&frame(), &[drifted], &mut factory);
        assert_eq!(out.matched, vec![(0, 0)]);
        assert!(out.created.is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_candidates_in_one_pass_share_a_track() {
        let mut reg = TrackRegistry::new(TieBreak::NearestCentroid);
        let mut factory = ScriptedFactory::steady();
        let b = BoundingBox::new(100, 100, 50, 50);
        let out = reg.absorb_detections(&frame(), &[b, b], &mut factory);
        assert_eq!(out.created, vec![0]);
        assert_eq!(out.matched, vec![(1, 0)]);
    }

    fn overlapping_pair(tie_break: TieBreak) -> TrackRegistry {
        // Two tracks that both mutually contain the probe box below; track 0
        // is closer to it.
        let mut reg = TrackRegistry::new(tie_break);
        let mut factory = ScriptedFactory::steady();
        reg.absorb_detections(&frame(), &[BoundingBox::new(100, 100, 60, 60)], &mut factory);
        // Seeded directly so the second box is not absorbed by the first.
        reg.tracks.push(Track {
            id: 1,
            tracker: factory.seed(&frame(), BoundingBox::new(115, 100, 60, 60)).unwrap(),
            bbox: BoundingBox::new(115, 100, 60, 60),
            crossing: None,
        });
        reg.next_id = 2;
        reg
    }

    #[test]
    fn nearest_centroid_tie_break() {
        let reg = overlapping_pair(TieBreak::NearestCentroid);
        let probe = BoundingBox::new(102, 100, 60, 60);
        assert_eq!(reg.find_match(&probe), Some(0));
    }

    #[test]
    fn last_inserted_tie_break() {
        let reg = overlapping_pair(TieBreak::LastInserted);
        let probe = BoundingBox::new(102, 100, 60, 60);
        assert_eq!(reg.find_match(&probe), Some(1));
    }

    #[test]
    fn low_quality_track_removed_after_pass() {
        let mut reg = TrackRegistry::new(TieBreak::NearestCentroid);
        let mut factory = ScriptedFactory::new(vec![
            vec![Step::Hold(10.0), Step::Hold(3.0)],
            vec![Step::Hold(10.0), Step::Hold(10.0)],
        ]);
        reg.absorb_detections(
            &frame(),
            &[BoundingBox::new(10, 10, 40, 40), BoundingBox::new(300, 10, 40, 40)],
            &mut factory,
        );

        let first = reg.update_all(&frame(), 7.0);
        assert_eq!(first.updated, vec![0, 1]);
        assert!(first.removed.is_empty());

        let second = reg.update_all(&frame(), 7.0);
        assert_eq!(second.removed, vec![0]);
        assert_eq!(second.updated, vec![1]);
        assert!(reg.get(0).is_none());
        assert_eq!(reg.ids(), vec![1]);
    }

    #[test]
    fn quality_exactly_at_threshold_survives() {
        let mut reg = TrackRegistry::new(TieBreak::NearestCentroid);
        let mut factory = ScriptedFactory::new(vec![vec![Step::Hold(7.0)]]);
        reg.absorb_detections(&frame(), &[BoundingBox::new(10, 10, 40, 40)], &mut factory);
        let out = reg.update_all(&frame(), 7.0);
        assert_eq!(out.updated, vec![0]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn identities_never_reused() {
        let mut reg = TrackRegistry::new(TieBreak::NearestCentroid);
        let mut factory = ScriptedFactory::new(vec![vec![Step::Hold(1.0)], vec![Step::Hold(10.0)]]);
        reg.absorb_detections(&frame(), &[BoundingBox::new(10, 10, 40, 40)], &mut factory);
        reg.update_all(&frame(), 7.0);
        assert!(reg.is_empty());

        let out = reg.absorb_detections(&frame(), &[BoundingBox::new(10, 10, 40, 40)], &mut factory);
        assert_eq!(out.created, vec![1]);
    }

    #[test]
    fn tracker_error_keeps_track_without_update() {
        let mut reg = TrackRegistry::new(TieBreak::NearestCentroid);
        let mut factory = ScriptedFactory::new(vec![vec![Step::Fail, Step::Hold(9.0)]]);
        reg.absorb_detections(&frame(), &[BoundingBox::new(10, 10, 40, 40)], &mut factory);

        let out = reg.update_all(&frame(), 7.0);
        assert_eq!(out.failed, vec![0]);
        assert_eq!(reg.len(), 1);

        let out = reg.update_all(&frame(), 7.0);
        assert_eq!(out.updated, vec![0]);
    }

    #[test]
    fn seed_failure_skips_candidate() {
        let mut reg = TrackRegistry::new(TieBreak::NearestCentroid);
        let mut factory = ScriptedFactory::failing();
        let out = reg.absorb_detections(&frame(), &[BoundingBox::new(10, 10, 40, 40)], &mut factory);
        assert_eq!(out.seed_failures, 1);
        assert!(reg.is_empty());
        assert_eq!(reg.next_id(), 0);
    }

    #[test]
    fn removing_a_track_discards_its_crossing() {
        let mut reg = TrackRegistry::new(TieBreak::NearestCentroid);
        let mut factory = ScriptedFactory::new(vec![vec![Step::Hold(0.0)]]);
        reg.absorb_detections(&frame(), &[BoundingBox::new(10, 240, 40, 40)], &mut factory);
        reg.get_mut(0).unwrap().crossing = Some(CrossingRecord {
            track_id: 0,
            started_at: std::time::Instant::now(),
        });
        reg.update_all(&frame(), 7.0);
        assert!(reg.get(0).is_none());
    }
}
