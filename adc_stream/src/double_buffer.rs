//! The two physical sample buffers written by the acquisition side.
//!
//! Cells are atomics because the writer (DMA engine or sampling thread) keeps running
//! while consumers read published halves; nothing locks the memory itself.

use std::sync::{atomic::AtomicU32, Arc};

use atomic::{Atomic, Ordering};
use itertools::Itertools;

use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferId {
  M0 = 0,
  M1 = 1,
}

impl BufferId {
  pub fn other(self) -> Self {
    match self {
      Self::M0 => Self::M1,
      Self::M1 => Self::M0,
    }
  }
  pub fn index(self) -> usize {
    self as usize
  }
  pub fn from_index(index: u8) -> Option<Self> {
    match index {
      0 => Some(Self::M0),
      1 => Some(Self::M1),
      _ => None,
    }
  }
}

pub struct DoubleBuffer {
  buffers: [Box<[Atomic<Sample>]>; 2],
  half_len: usize,
  // halves the writer has started filling since the last reset
  halves_begun: AtomicU32,
}

fn zeroed(length: usize) -> Box<[Atomic<Sample>]> {
  (0..length).map(|_| Atomic::new(0)).collect_vec().into_boxed_slice()
}

impl DoubleBuffer {
  /// `buffer_samples` is the length of each buffer and must be even.
  pub fn new(buffer_samples: usize) -> Arc<Self> {
    debug_assert!(buffer_samples % 2 == 0);
    Arc::new(Self {
      buffers: [zeroed(buffer_samples), zeroed(buffer_samples)],
      half_len: buffer_samples / 2,
      halves_begun: AtomicU32::new(0),
    })
  }

  pub fn buffer_len(&self) -> usize {
    self.half_len * 2
  }

  pub fn half_len(&self) -> usize {
    self.half_len
  }

  pub fn half(&self, buffer: BufferId, second_half: bool) -> &[Atomic<Sample>] {
    let start = if second_half { self.half_len } else { 0 };
    &self.buffers[buffer.index()][start..start + self.half_len]
  }

  #[inline(always)]
  pub fn store(&self, buffer: BufferId, index: usize, value: Sample) {
    self.buffers[buffer.index()][index].store(value, Ordering::Relaxed);
  }

  #[inline(always)]
  pub fn load(&self, buffer: BufferId, index: usize) -> Sample {
    self.buffers[buffer.index()][index].load(Ordering::Relaxed)
  }

  /// Writer-side marker: called right before the writer starts overwriting a half.
  #[inline(always)]
  pub fn begin_half(&self) {
    self.halves_begun.fetch_add(1, Ordering::Relaxed);
    atomic::fence(Ordering::Release);
  }

  /// Number of halves begun since the last reset. Pairs with `begin_half`:
  /// load it after reading samples to learn whether the writer came back in the meantime.
  pub fn halves_begun(&self) -> u32 {
    atomic::fence(Ordering::Acquire);
    self.halves_begun.load(Ordering::Relaxed)
  }

  pub(crate) fn reset_position(&self) {
    self.halves_begun.store(0, Ordering::Release);
  }
}
