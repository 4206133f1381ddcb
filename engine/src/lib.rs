//! Track-and-speed-estimation engine.
//!
//! The processing loop ([`processor::Processor`]) owns the track registry and
//! every crossing record. The only state shared with other threads is the
//! [`slot::FrameSlot`] (written by ingestion) and the
//! [`limit::SpeedLimitRegister`] (written by configuration).

pub mod capability;
pub mod crossing;
pub mod emitter;
pub mod geometry;
pub mod limit;
pub mod processor;
pub mod registry;
pub mod slot;
pub mod vision;

#[cfg(test)]
pub(crate) mod testing;
