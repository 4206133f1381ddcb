use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use speed_trap_common::frame::Frame;

/// Holds the most recently ingested frame.
///
/// Writers overwrite whatever is there, read or not: only the newest view of
/// the road matters. Readers get a private copy made under the lock, so a
/// concurrent `put` can never tear a frame that is being processed.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Held>>,
    next_seq: AtomicU64,
    overwritten: AtomicU64,
}

/// Result of [`FrameSlot::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stored {
    pub seq: u64,
    /// A frame nobody had copied yet was replaced.
    pub dropped: bool,
}

#[derive(Debug)]
struct Held {
    frame: Frame,
    read: bool,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held frame, stamping it with the next sequence number.
    ///
    /// The number is drawn under the slot lock, so the held frame always
    /// carries the highest seq handed out so far.
    pub fn put(&self, mut frame: Frame) -> Stored {
        let mut latest = self.lock();
        frame.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let seq = frame.seq;
        let previous = latest.replace(Held { frame, read: false });
        drop(latest);

        let dropped = previous.is_some_and(|held| !held.read);
        if dropped {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        Stored { seq, dropped }
    }

    /// Copy of the held frame, or `None` if nothing was ever put.
    pub fn take_copy(&self) -> Option<Frame> {
        let mut latest = self.lock();
        latest.as_mut().map(|held| {
            held.read = true;
            held.frame.clone()
        })
    }

    /// Like [`FrameSlot::take_copy`], but skips the copy when the held frame
    /// is the one already seen (`seq == last_seq`).
    pub fn take_copy_after(&self, last_seq: Option<u64>) -> Option<Frame> {
        let mut latest = self.lock();
        match latest.as_mut() {
            Some(held) if Some(held.frame.seq) != last_seq => {
                held.read = true;
                Some(held.frame.clone())
            }
            _ => None,
        }
    }

    /// Frames replaced before the processing loop got to them.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Held>> {
        // The only mutation is a whole-value replace, so a poisoned lock
        // still holds a complete frame.
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::Arc;

    fn frame() -> Frame {
        Frame::new(RgbImage::new(4, 4), 0)
    }

    #[test]
    fn empty_slot_signals_empty() {
        let slot = FrameSlot::new();
        assert!(slot.take_copy().is_none());
        assert!(slot.take_copy_after(None).is_none());
    }

    #[test]
    fn put_overwrites_latest() {
        let slot = FrameSlot::new();
        assert!(!slot.put(frame()).dropped);
        let second = slot.put(frame());
        assert!(second.dropped);
        assert_eq!(slot.take_copy().unwrap().seq, second.seq);
        assert_eq!(slot.overwritten(), 1);
    }

    #[test]
    fn overwrite_after_read_is_not_a_drop() {
        let slot = FrameSlot::new();
        slot.put(frame());
        slot.take_copy();
        assert!(!slot.put(frame()).dropped);
        assert_eq!(slot.overwritten(), 0);
    }

    #[test]
    fn take_copy_after_skips_seen_frame() {
        let slot = FrameSlot::new();
        let first = slot.put(frame()).seq;
        assert_eq!(slot.take_copy_after(None).unwrap().seq, first);
        assert!(slot.take_copy_after(Some(first)).is_none());
        let second = slot.put(frame()).seq;
        assert_eq!(slot.take_copy_after(Some(first)).unwrap().seq, second);
    }

    #[test]
    fn copy_is_independent_of_later_puts() {
        let slot = FrameSlot::new();
        slot.put(frame());
        let copy = slot.take_copy().unwrap();
        slot.put(Frame::new(RgbImage::new(8, 8), 0));
        assert_eq!(copy.image.dimensions(), (4, 4));
    }

    #[test]
    fn put_assigns_increasing_seq() {
        let slot = FrameSlot::new();
        let a = slot.put(Frame::new(RgbImage::new(4, 4), 99)).seq;
        let b = slot.put(frame()).seq;
        assert!(b > a);
        assert_eq!(slot.take_copy().unwrap().seq, b);
    }

    #[test]
    fn concurrent_writers_and_reader() {
        let slot = Arc::new(FrameSlot::new());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        slot.put(Frame::new(RgbImage::new(4, 4), w));
                    }
                })
            })
            .collect();
        for _ in 0..100 {
            if let Some(copy) = slot.take_copy() {
                assert_eq!(copy.image.dimensions(), (4, 4));
            }
        }
        for w in writers {
            w.join().unwrap();
        }
        // 200 puts drew seqs 0..200; the survivor must hold the last one.
        assert_eq!(slot.take_copy().unwrap().seq, 199);
    }
}
