//! Maintenance ticks and submission serials.
//!
//! # Ticks
//!
//! A **tick** counts calls to the maintenance entry point (`Context::gc`, or `BufferPool::gc` when
//! the pool is driven directly). Ticks are monotonic and start at 0. Released pool allocations are
//! stamped with the tick at which they were released, and evicted once they have been idle for a
//! number of ticks (the eviction window).
//!
//! Tick arithmetic never wraps: the distance between two ticks saturates at zero.
//!
//! # Submission serials
//!
//! The **submission serial** of a command buffer identifies one submission among all the
//! submissions of a `CommandBufferManager`. Serial 0 is invalid, so the first submission is
//! serial 1. Serials are useful in logs, and to tell two consecutive uses of the same ring slot
//! apart.
use std::fmt;

/// A maintenance tick.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the tick following this one.
    pub const fn next(self) -> Tick {
        Tick(self.0 + 1)
    }

    /// Number of ticks elapsed since `earlier`. Zero if `earlier` is not before `self`.
    pub const fn elapsed_since(self, earlier: Tick) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Serial number of a command buffer submission.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct SubmissionSerial(u64);

impl SubmissionSerial {
    /// The invalid serial, used for slots that were never submitted.
    pub const INVALID: SubmissionSerial = SubmissionSerial(0);

    pub const fn new(serial: u64) -> SubmissionSerial {
        SubmissionSerial(serial)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Whether this serial refers to an actual submission.
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }

    pub const fn next(self) -> SubmissionSerial {
        SubmissionSerial(self.0 + 1)
    }
}

impl fmt::Debug for SubmissionSerial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SN{}", self.0)
    }
}
