//! Timer queries.
use crate::{
    command::CommandBuffer,
    device::Device,
    fence::CommandBufferFence,
    Error,
};
use ash::vk;
use fixedbitset::FixedBitSet;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{trace, warn};

/// Timestamps written by a timer query, in device ticks.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct QueryResult {
    pub begin: u64,
    pub end: u64,
}

impl QueryResult {
    /// Elapsed time in nanoseconds, given the timestamp period of the device.
    pub fn elapsed_ns(&self, timestamp_period: f32) -> f64 {
        self.end.saturating_sub(self.begin) as f64 * timestamp_period as f64
    }
}

struct TimerQueryInner {
    index: u32,
    slots: Arc<Mutex<FixedBitSet>>,
    cleared: AtomicBool,
    fence: Mutex<Option<Arc<CommandBufferFence>>>,
}

/// A pair of timestamp queries (start and stop) allocated from a [`QueryManager`].
///
/// Clones refer to the same pair.
#[derive(Clone)]
pub struct TimerQuery {
    inner: Arc<TimerQueryInner>,
}

impl TimerQuery {
    pub fn start_query(&self) -> u32 {
        self.inner.index * 2
    }

    pub fn stop_query(&self) -> u32 {
        self.inner.index * 2 + 1
    }

    /// Fence of the command buffer that recorded the end of the query.
    pub fn fence(&self) -> Option<Arc<CommandBufferFence>> {
        self.inner.fence.lock().clone()
    }

    fn set_fence(&self, fence: Arc<CommandBufferFence>) {
        *self.inner.fence.lock() = Some(fence);
    }

    /// Whether the slot pair has been given back.
    pub fn is_cleared(&self) -> bool {
        self.inner.cleared.load(Ordering::Acquire)
    }

    /// Gives the slot pair back to the allocator. Only the first call has an effect.
    pub(crate) fn clear(&self) -> bool {
        if self.inner.cleared.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.slots.lock().set(self.inner.index as usize, false);
        trace!(index = self.inner.index, "timer query cleared");
        true
    }
}

impl fmt::Debug for TimerQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TimerQuery")
            .field("start", &self.start_query())
            .field("stop", &self.stop_query())
            .field("cleared", &self.is_cleared())
            .finish()
    }
}

/// Allocates timer queries from a fixed-size timestamp query pool.
pub struct QueryManager {
    device: Arc<dyn Device>,
    pool: vk::QueryPool,
    slots: Arc<Mutex<FixedBitSet>>,
}

impl QueryManager {
    /// Creates a manager for `count` timer queries (`2 * count` timestamp queries).
    pub fn new(device: Arc<dyn Device>, count: u32) -> Result<QueryManager, Error> {
        if count == 0 {
            return Err(Error::Config("timer query count must be non-zero".to_string()));
        }
        let pool = device.create_timestamp_query_pool(count * 2)?;
        Ok(QueryManager {
            device,
            pool,
            slots: Arc::new(Mutex::new(FixedBitSet::with_capacity(count as usize))),
        })
    }

    /// Number of timer queries.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of timer queries currently allocated.
    pub fn allocated(&self) -> usize {
        self.slots.lock().count_ones(..)
    }

    pub fn query_pool(&self) -> vk::QueryPool {
        self.pool
    }

    /// Allocates a timer query. Returns `None` if all queries are in use.
    pub fn get_next_query(&self) -> Option<TimerQuery> {
        let mut slots = self.slots.lock();
        let index = match (0..slots.len()).find(|&i| !slots.contains(i)) {
            Some(index) => index,
            None => {
                warn!(capacity = slots.len(), "out of timer queries");
                return None;
            }
        };
        slots.insert(index);
        Some(TimerQuery {
            inner: Arc::new(TimerQueryInner {
                index: index as u32,
                slots: self.slots.clone(),
                cleared: AtomicBool::new(false),
                fence: Mutex::new(None),
            }),
        })
    }

    /// Gives the query back. Returns `false` if it had already been cleared.
    pub fn clear_query(&self, query: &TimerQuery) -> bool {
        query.clear()
    }

    /// Records the reset of the query pair and the start timestamp.
    pub fn begin_query(&self, command_buffer: &CommandBuffer, query: &TimerQuery) {
        let cb = command_buffer.raw();
        self.device
            .cmd_reset_query_pool(cb, self.pool, query.start_query(), 2);
        self.device.cmd_write_timestamp(
            cb,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            self.pool,
            query.start_query(),
        );
    }

    /// Records the stop timestamp and associates the query with the fence of `command_buffer`.
    pub fn end_query(&self, command_buffer: &CommandBuffer, query: &TimerQuery) {
        self.device.cmd_write_timestamp(
            command_buffer.raw(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            self.pool,
            query.stop_query(),
        );
        query.set_fence(command_buffer.fence().clone());
    }

    /// Whether the command buffer that ended the query has completed.
    pub fn is_completed(&self, query: &TimerQuery) -> bool {
        query.fence().map_or(false, |fence| fence.poll())
    }

    /// Reads the timestamps of the query. Returns zeros if they are not available yet.
    pub fn get_result(&self, query: &TimerQuery) -> QueryResult {
        let mut timestamps = [0u64; 2];
        match self
            .device
            .get_timestamp_results(self.pool, query.start_query(), &mut timestamps)
        {
            Ok(()) => QueryResult {
                begin: timestamps[0],
                end: timestamps[1],
            },
            Err(vk::Result::NOT_READY) => QueryResult::default(),
            Err(err) => panic!("failed to read timer query results: {}", err),
        }
    }
}

impl Drop for QueryManager {
    fn drop(&mut self) {
        let allocated = self.allocated();
        if allocated > 0 {
            warn!(allocated, "query pool destroyed with timer queries still allocated");
        }
        self.device.destroy_query_pool(self.pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDevice;

    #[test]
    fn pairs_do_not_overlap() {
        let device = Arc::new(NullDevice::new());
        let queries = QueryManager::new(device, 3).unwrap();
        let all: Vec<_> = (0..3).map(|_| queries.get_next_query().unwrap()).collect();
        let mut indices: Vec<_> = all
            .iter()
            .flat_map(|q| [q.start_query(), q.stop_query()])
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
        assert!(queries.get_next_query().is_none());
        for q in &all {
            queries.clear_query(q);
        }
    }

    #[test]
    fn clear_frees_exactly_one_slot() {
        let device = Arc::new(NullDevice::new());
        let queries = QueryManager::new(device, 2).unwrap();
        let a = queries.get_next_query().unwrap();
        let b = queries.get_next_query().unwrap();
        assert!(queries.clear_query(&a));
        assert!(!queries.clear_query(&a));
        assert_eq!(queries.allocated(), 1);
        let c = queries.get_next_query().unwrap();
        assert_eq!(c.start_query(), a.start_query());
        assert!(queries.get_next_query().is_none());
        queries.clear_query(&b);
        queries.clear_query(&c);
    }

    #[test]
    fn result_before_completion_is_zero() {
        let device = Arc::new(NullDevice::new());
        let queries = QueryManager::new(device, 1).unwrap();
        let q = queries.get_next_query().unwrap();
        assert!(!queries.is_completed(&q));
        assert_eq!(queries.get_result(&q), QueryResult::default());
        queries.clear_query(&q);
    }
}
