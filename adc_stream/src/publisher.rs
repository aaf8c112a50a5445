use std::sync::{atomic::AtomicU32, Arc};

use atomic::Ordering;

use crate::block::BlockTag;
use crate::block_queue::BlockQueue;
use crate::double_buffer::{BufferId, DoubleBuffer};

/// Acquisition-side state shared by the interrupt handler or sampling loop:
/// the physical buffers, the handoff queue and the sequence counter.
pub struct Publisher {
  memory: Arc<DoubleBuffer>,
  queue: BlockQueue,
  sequence: AtomicU32,
}

impl Publisher {
  pub fn new(buffer_samples: usize, queue_capacity: usize) -> Arc<Self> {
    Arc::new(Self {
      memory: DoubleBuffer::new(buffer_samples),
      queue: BlockQueue::new(queue_capacity),
      sequence: AtomicU32::new(0),
    })
  }

  pub fn memory(&self) -> &Arc<DoubleBuffer> {
    &self.memory
  }

  pub fn queue(&self) -> &BlockQueue {
    &self.queue
  }

  /// Announces that a half became stable. Never blocks; a full queue drops the block,
  /// which consumers see as a gap in `sequence`.
  #[inline(always)]
  pub fn publish(&self, buffer_id: BufferId, second_half: bool) -> bool {
    let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
    self.queue.push(BlockTag { sequence, buffer_id, second_half })
  }

  /// Blocks published (queued or dropped) since the last reset.
  pub fn published(&self) -> u32 {
    self.sequence.load(Ordering::Relaxed)
  }

  /// Restarts numbering and the writer position; call only while nothing is publishing.
  pub(crate) fn reset(&self) {
    self.sequence.store(0, Ordering::Relaxed);
    self.memory.reset_position();
  }
}
