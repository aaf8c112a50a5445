use std::{fmt, sync::Arc};

use atomic::{Atomic, Ordering};

use crate::common::*;
use crate::double_buffer::{BufferId, DoubleBuffer};
use crate::samples_utils::write_ne_samples;

/// Identity of a published half, without the memory it refers to.
/// This is what travels through the block queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTag {
  pub sequence: u32,
  pub buffer_id: BufferId,
  pub second_half: bool,
}

const BUFFER_ID_BIT: u64 = 1 << 32;
const SECOND_HALF_BIT: u64 = 1 << 33;

impl BlockTag {
  pub(crate) fn pack(self) -> u64 {
    let mut packed = self.sequence as u64;
    if self.buffer_id == BufferId::M1 {
      packed |= BUFFER_ID_BIT;
    }
    if self.second_half {
      packed |= SECOND_HALF_BIT;
    }
    packed
  }
  pub(crate) fn unpack(packed: u64) -> Self {
    Self {
      sequence: packed as u32,
      buffer_id: if packed & BUFFER_ID_BIT != 0 { BufferId::M1 } else { BufferId::M0 },
      second_half: packed & SECOND_HALF_BIT != 0,
    }
  }
}

/// View over one half of one physical buffer, as it was when the half became stable.
///
/// The samples are not owned: the producer keeps writing the double buffer and comes back
/// to this half one full cycle (four halves) after the block was published. Read it before
/// that, then check [`SampleBlock::is_intact`] to find out whether you were too slow.
#[derive(Clone)]
pub struct SampleBlock {
  memory: Arc<DoubleBuffer>,
  pub count: usize,
  pub sequence: u32,
  pub second_half: bool,
  pub buffer_id: BufferId,
}

impl SampleBlock {
  pub(crate) fn new(memory: Arc<DoubleBuffer>, tag: BlockTag) -> Self {
    Self {
      count: memory.half_len(),
      memory,
      sequence: tag.sequence,
      second_half: tag.second_half,
      buffer_id: tag.buffer_id,
    }
  }

  pub fn tag(&self) -> BlockTag {
    BlockTag { sequence: self.sequence, buffer_id: self.buffer_id, second_half: self.second_half }
  }

  pub fn samples(&self) -> &[Atomic<Sample>] {
    self.memory.half(self.buffer_id, self.second_half)
  }

  pub fn get(&self, index: usize) -> Option<Sample> {
    self.samples().get(index).map(|s| s.load(Ordering::Relaxed))
  }

  pub fn iter(&self) -> impl ExactSizeIterator<Item = Sample> + '_ {
    self.samples().iter().map(|s| s.load(Ordering::Relaxed))
  }

  pub fn byte_len(&self) -> usize {
    self.count * SAMPLE_BYTES
  }

  /// Encodes the block in the raw persisted format, starting `byte_offset` bytes into it.
  /// Either end may fall inside a sample. Returns the number of bytes written to `out`.
  pub fn write_ne_bytes(&self, byte_offset: usize, out: &mut [u8]) -> usize {
    let mut samples = self.iter().skip(byte_offset / SAMPLE_BYTES);
    let mut written = 0;
    let skip = byte_offset % SAMPLE_BYTES;
    if skip != 0 {
      let Some(sample) = samples.next() else { return 0 };
      let n = (SAMPLE_BYTES - skip).min(out.len());
      out[..n].copy_from_slice(&sample.to_ne_bytes()[skip..skip + n]);
      written = n;
    }
    written += write_ne_samples(&mut samples, &mut out[written..]);
    let rest = out.len() - written;
    if rest > 0 {
      if let Some(sample) = samples.next() {
        let n = rest.min(SAMPLE_BYTES);
        out[written..written + n].copy_from_slice(&sample.to_ne_bytes()[..n]);
        written += n;
      }
    }
    written
  }

  /// Whether the producer has not yet started overwriting this half.
  /// Meaningful only for blocks of the current start/stop cycle.
  pub fn is_intact(&self) -> bool {
    self.memory.halves_begun().wrapping_sub(self.sequence) <= HALVES_PER_CYCLE
  }
}

impl fmt::Debug for SampleBlock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SampleBlock")
      .field("count", &self.count)
      .field("sequence", &self.sequence)
      .field("second_half", &self.second_half)
      .field("buffer_id", &self.buffer_id)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::samples_utils::SamplesReader;
  use itertools::Itertools;

  #[test]
  fn test_tag_survives_packing() {
    let tag = BlockTag { sequence: u32::MAX, buffer_id: BufferId::M1, second_half: true };
    assert_eq!(BlockTag::unpack(tag.pack()), tag);
    let tag = BlockTag { sequence: 7, buffer_id: BufferId::M0, second_half: false };
    assert_eq!(BlockTag::unpack(tag.pack()), tag);
  }

  #[test]
  fn test_block_views_its_half() {
    let memory = DoubleBuffer::new(8);
    for i in 0..8 {
      memory.store(BufferId::M1, i, 10 * i as Sample);
    }
    let block = SampleBlock::new(memory, BlockTag { sequence: 0, buffer_id: BufferId::M1, second_half: true });
    assert_eq!(block.count, 4);
    assert_eq!(block.iter().collect_vec(), vec![40, 50, 60, 70]);
    assert_eq!(block.get(1), Some(50));
    assert_eq!(block.get(4), None);

    let mut bytes = [0u8; 8];
    assert_eq!(block.write_ne_bytes(4, &mut bytes), 4);
    assert_eq!(SamplesReader::new(&bytes[..4]).collect_vec(), vec![60, 70]);
  }

  #[test]
  fn test_encoding_may_split_samples() {
    let memory = DoubleBuffer::new(8);
    for (i, value) in [0x100, 0x101, 0x102, 0x103].into_iter().enumerate() {
      memory.store(BufferId::M0, i, value);
    }
    let block = SampleBlock::new(memory, BlockTag { sequence: 0, buffer_id: BufferId::M0, second_half: false });
    let mut encoded = vec![0u8; block.byte_len()];
    let mut offset = 0;
    for chunk in [3, 1, 3, 1] {
      assert_eq!(block.write_ne_bytes(offset, &mut encoded[offset..offset + chunk]), chunk);
      offset += chunk;
    }
    assert_eq!(SamplesReader::new(&encoded).collect_vec(), vec![0x100, 0x101, 0x102, 0x103]);
    // past the end nothing is written
    assert_eq!(block.write_ne_bytes(7, &mut [0u8; 4]), 1);
    assert_eq!(block.write_ne_bytes(8, &mut [0u8; 4]), 0);
  }

  #[test]
  fn test_block_is_intact_for_one_cycle() {
    let memory = DoubleBuffer::new(8);
    // writer began half 0, finished it and published it as sequence 0
    memory.begin_half();
    let block = SampleBlock::new(memory.clone(), BlockTag { sequence: 0, buffer_id: BufferId::M0, second_half: false });
    // M0 second half, M1 first half, M1 second half
    for _ in 0..3 {
      memory.begin_half();
    }
    assert!(block.is_intact());
    // writer is back at M0 first half
    memory.begin_half();
    assert!(!block.is_intact());
  }
}
