use std::sync::{PoisonError, RwLock};

use speed_trap_common::config::{MAX_SPEED_LIMIT, MIN_SPEED_LIMIT};
use tracing::info;

/// The current speed limit in km/h.
///
/// Written by the configuration endpoint and by the background poller, read
/// by the processing loop at every comparison. All writers go through the
/// same range check and the same lock, so an invalid candidate can never
/// land in the register.
#[derive(Debug)]
pub struct SpeedLimitRegister {
    value: RwLock<u32>,
}

impl SpeedLimitRegister {
    pub fn new(initial: u32) -> Result<Self, LimitError> {
        let initial = validate(i64::from(initial))?;
        Ok(Self {
            value: RwLock::new(initial),
        })
    }

    pub fn get(&self) -> u32 {
        *self.value.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` if it lies within the accepted range.
    pub fn set(&self, value: i64) -> Result<LimitChange, LimitError> {
        let value = validate(value)?;
        let mut guard = self.value.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *guard, value);
        drop(guard);
        if previous != value {
            info!(previous, limit = value, "speed limit updated");
        }
        Ok(LimitChange {
            previous,
            current: value,
        })
    }
}

/// What a successful [`SpeedLimitRegister::set`] stored. `current` is this
/// call's value even if another writer has replaced it since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitChange {
    pub previous: u32,
    pub current: u32,
}

/// Range check shared by every writer.
pub fn validate(value: i64) -> Result<u32, LimitError> {
    if value < i64::from(MIN_SPEED_LIMIT) || value > i64::from(MAX_SPEED_LIMIT) {
        return Err(LimitError::OutOfRange { value });
    }
    // Bounded by MAX_SPEED_LIMIT above.
    Ok(value as u32)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    #[error("speed limit {value} km/h is outside {}..={}", MIN_SPEED_LIMIT, MAX_SPEED_LIMIT)]
    OutOfRange { value: i64 },
}
