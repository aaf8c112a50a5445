//! Bounded single-producer/single-consumer handoff of block descriptors.
//!
//! The producer side never blocks, never allocates and never takes a lock it could wait on,
//! so it is usable from an interrupt handler. When the queue is full the new block is
//! dropped and counted. The consumer side may suspend with a timeout.

use std::{
  sync::{
    atomic::{AtomicU64, AtomicUsize},
    Mutex, MutexGuard, PoisonError,
  },
  thread::{self, Thread},
  time::{Duration, Instant},
};

use atomic::Ordering;
use itertools::Itertools;

use crate::block::BlockTag;
use crate::error::{Error, Result};

pub struct BlockQueue {
  slots: Box<[AtomicU64]>,
  // consumer position, only advanced by the consumer
  head: AtomicUsize,
  // producer position, only advanced by the producer
  tail: AtomicUsize,
  dropped: AtomicU64,
  consumer: Mutex<()>,
  waiter: Mutex<Option<Thread>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BlockQueue {
  pub fn new(capacity: usize) -> Self {
    assert!(capacity > 0, "block queue capacity must be non-zero");
    Self {
      slots: (0..capacity).map(|_| AtomicU64::new(0)).collect_vec().into_boxed_slice(),
      head: AtomicUsize::new(0),
      tail: AtomicUsize::new(0),
      dropped: AtomicU64::new(0),
      consumer: Mutex::new(()),
      waiter: Mutex::new(None),
    }
  }

  pub fn capacity(&self) -> usize {
    self.slots.len()
  }

  pub fn len(&self) -> usize {
    let tail = self.tail.load(Ordering::Acquire);
    tail.wrapping_sub(self.head.load(Ordering::Acquire))
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Blocks discarded because the queue was full, since creation.
  pub fn dropped(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// Producer side. Returns `false` if the queue was full and `tag` was dropped.
  /// Must only be called from one context at a time.
  pub fn push(&self, tag: BlockTag) -> bool {
    let tail = self.tail.load(Ordering::Relaxed);
    let head = self.head.load(Ordering::Acquire);
    if tail.wrapping_sub(head) >= self.slots.len() {
      self.dropped.fetch_add(1, Ordering::Relaxed);
      return false;
    }
    self.slots[tail % self.slots.len()].store(tag.pack(), Ordering::Relaxed);
    self.tail.store(tail.wrapping_add(1), Ordering::Release);
    self.wake_consumer();
    true
  }

  fn wake_consumer(&self) {
    // try_lock only: if the consumer is registering right now it re-checks the queue afterwards
    if let Ok(waiter) = self.waiter.try_lock() {
      if let Some(thread) = waiter.as_ref() {
        thread.unpark();
      }
    }
  }

  fn take(&self) -> Option<BlockTag> {
    let head = self.head.load(Ordering::Relaxed);
    let tail = self.tail.load(Ordering::Acquire);
    if head == tail {
      return None;
    }
    let packed = self.slots[head % self.slots.len()].load(Ordering::Relaxed);
    self.head.store(head.wrapping_add(1), Ordering::Release);
    Some(BlockTag::unpack(packed))
  }

  /// Consumer side, non-suspending.
  pub fn try_pop(&self) -> Option<BlockTag> {
    let _consumer = lock(&self.consumer);
    self.take()
  }

  /// Consumer side. Returns the oldest queued block, waiting up to `timeout` for one.
  pub fn pop(&self, timeout: Duration) -> Result<BlockTag> {
    let _consumer = lock(&self.consumer);
    let deadline = Instant::now() + timeout;
    loop {
      if let Some(tag) = self.take() {
        return Ok(tag);
      }
      *lock(&self.waiter) = Some(thread::current());
      let taken = self.take();
      let now = Instant::now();
      if taken.is_some() || now >= deadline {
        *lock(&self.waiter) = None;
        return taken.ok_or(Error::Timeout);
      }
      thread::park_timeout(deadline - now);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::double_buffer::BufferId;
  use std::sync::Arc;

  fn tag(sequence: u32) -> BlockTag {
    BlockTag { sequence, buffer_id: BufferId::from_index((sequence / 2 % 2) as u8).unwrap(), second_half: sequence % 2 == 1 }
  }

  #[test]
  fn test_fifo_order() {
    let queue = BlockQueue::new(8);
    for i in 0..5 {
      assert!(queue.push(tag(i)));
    }
    assert_eq!(queue.len(), 5);
    for i in 0..5 {
      assert_eq!(queue.pop(Duration::ZERO).unwrap(), tag(i));
    }
    assert!(queue.is_empty());
  }

  #[test]
  fn test_full_queue_drops_newest() {
    let queue = BlockQueue::new(4);
    let accepted = (0..7).map(|i| queue.push(tag(i))).collect_vec();
    assert_eq!(accepted, vec![true, true, true, true, false, false, false]);
    assert_eq!(queue.dropped(), 3);
    let sequences = (0..4).map(|_| queue.pop(Duration::ZERO).unwrap().sequence).collect_vec();
    assert_eq!(sequences, vec![0, 1, 2, 3]);
    assert!(matches!(queue.pop(Duration::from_millis(5)), Err(Error::Timeout)));
  }

  #[test]
  fn test_wraps_around_many_times() {
    let queue = BlockQueue::new(3);
    for i in 0..100 {
      assert!(queue.push(tag(i)));
      assert_eq!(queue.try_pop(), Some(tag(i)));
    }
    assert_eq!(queue.dropped(), 0);
  }

  #[test]
  fn test_pop_times_out_on_empty_queue() {
    let queue = BlockQueue::new(2);
    let started = Instant::now();
    assert!(matches!(queue.pop(Duration::from_millis(20)), Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(20));
  }

  #[test]
  fn test_push_wakes_waiting_consumer() {
    let queue = Arc::new(BlockQueue::new(2));
    let producer_queue = queue.clone();
    let producer = thread::spawn(move || {
      thread::sleep(Duration::from_millis(20));
      producer_queue.push(tag(42));
    });
    let started = Instant::now();
    assert_eq!(queue.pop(Duration::from_secs(10)).unwrap().sequence, 42);
    assert!(started.elapsed() < Duration::from_secs(5));
    producer.join().unwrap();
  }

  #[test]
  fn test_concurrent_producer_keeps_order() {
    let queue = Arc::new(BlockQueue::new(16));
    let producer_queue = queue.clone();
    let producer = thread::spawn(move || {
      let mut i = 0;
      while i < 10_000 {
        if producer_queue.push(tag(i)) {
          i += 1;
        } else {
          thread::yield_now();
        }
      }
    });
    for i in 0..10_000 {
      assert_eq!(queue.pop(Duration::from_secs(10)).unwrap().sequence, i);
    }
    producer.join().unwrap();
  }
}
