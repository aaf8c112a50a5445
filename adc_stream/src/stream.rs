//! Lifecycle controller: one `init`/`start`/`stop`/`get` surface over any acquisition strategy.

use std::{
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use atomic::Ordering;
use atomic_enum::atomic_enum;

use crate::block::SampleBlock;
use crate::common::*;
use crate::config::StreamConfig;
use crate::double_buffer::DoubleBuffer;
use crate::error::{Error, Result};
use crate::publisher::Publisher;

/// What every block consumer relies on. Any acquisition strategy behind it is substitutable.
pub trait SampleStream: Send + Sync {
  /// Configures the channel and peripherals and resets the sequence counter.
  fn init(&self) -> Result<()>;
  /// Starts publishing blocks. Starting a running stream does nothing.
  fn start(&self) -> Result<()>;
  /// Returns once no further blocks will be published. Queued blocks stay consumable.
  fn stop(&self);
  /// Next block in publish order, waiting up to `timeout`.
  fn get(&self, timeout: Duration) -> Result<SampleBlock>;
  fn sample_rate_hz(&self) -> u32;
  fn resolution_bits(&self) -> u8;
  /// Blocks lost to a full queue.
  fn dropped_blocks(&self) -> u64;
}

/// A way of filling the double buffer and publishing its halves.
pub trait Acquisition: Send {
  fn name(&self) -> &'static str;
  /// Nominal rate this strategy samples at.
  fn sample_rate_hz(&self, config: &StreamConfig) -> u32;
  /// Prepares hardware. Must leave no partial configuration behind on error.
  fn init(&mut self, config: &StreamConfig, memory: &Arc<DoubleBuffer>) -> Result<()>;
  /// Begins acquisition; blocks are published through `publisher`.
  fn arm(&mut self, config: &StreamConfig, publisher: Arc<Publisher>) -> Result<()>;
  /// Stops acquisition; returns once nothing more will be published.
  fn halt(&mut self);
}

#[atomic_enum]
#[derive(PartialEq)]
pub enum StreamState {
  Uninitialized = 0,
  Ready,
  Running,
}

pub struct AdcStream<A: Acquisition> {
  config: StreamConfig,
  acquisition: Mutex<A>,
  publisher: Arc<Publisher>,
  state: AtomicStreamState,
}

impl<A: Acquisition> AdcStream<A> {
  pub fn new(config: StreamConfig, acquisition: A) -> Result<Self> {
    config.validate()?;
    let publisher = Publisher::new(config.buffer_samples, config.queue_capacity);
    Ok(Self {
      config,
      acquisition: Mutex::new(acquisition),
      publisher,
      state: AtomicStreamState::new(StreamState::Uninitialized),
    })
  }

  pub fn config(&self) -> &StreamConfig {
    &self.config
  }

  pub fn state(&self) -> StreamState {
    self.state.load(Ordering::Acquire)
  }

  pub fn is_running(&self) -> bool {
    self.state() == StreamState::Running
  }

  /// Blocks waiting in the queue.
  pub fn queued_blocks(&self) -> usize {
    self.publisher.queue().len()
  }

  /// Blocks published in the current start/stop cycle, including dropped ones.
  pub fn published_blocks(&self) -> u32 {
    self.publisher.published()
  }

  fn lock_acquisition(&self) -> MutexGuard<'_, A> {
    self.acquisition.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl<A: Acquisition> SampleStream for AdcStream<A> {
  fn init(&self) -> Result<()> {
    let mut acquisition = self.lock_acquisition();
    if self.is_running() {
      return Err(Error::config("stream is running, stop it before initializing"));
    }
    self.config.validate()?;
    if let Err(e) = acquisition.init(&self.config, self.publisher.memory()) {
      error!("{} init failed: {e}", acquisition.name());
      return Err(e);
    }
    self.publisher.reset();
    self.state.store(StreamState::Ready, Ordering::Release);
    debug!("{} initialized", acquisition.name());
    Ok(())
  }

  fn start(&self) -> Result<()> {
    let mut acquisition = self.lock_acquisition();
    match self.state() {
      StreamState::Running => return Ok(()),
      StreamState::Uninitialized => return Err(Error::NotInitialized),
      StreamState::Ready => {}
    }
    self.publisher.reset();
    acquisition.arm(&self.config, self.publisher.clone())?;
    self.state.store(StreamState::Running, Ordering::Release);
    info!(
      "{} started: {} Hz, {}-bit, {} samples per block",
      acquisition.name(), acquisition.sample_rate_hz(&self.config), self.config.resolution_bits, self.config.half_samples()
    );
    Ok(())
  }

  fn stop(&self) {
    let mut acquisition = self.lock_acquisition();
    if !self.is_running() {
      return;
    }
    acquisition.halt();
    self.state.store(StreamState::Ready, Ordering::Release);
    info!(
      "{} stopped after {} blocks ({} dropped in total)",
      acquisition.name(), self.publisher.published(), self.publisher.queue().dropped()
    );
  }

  fn get(&self, timeout: Duration) -> Result<SampleBlock> {
    let tag = self.publisher.queue().pop(timeout)?;
    Ok(SampleBlock::new(self.publisher.memory().clone(), tag))
  }

  fn sample_rate_hz(&self) -> u32 {
    self.lock_acquisition().sample_rate_hz(&self.config)
  }

  fn resolution_bits(&self) -> u8 {
    self.config.resolution_bits
  }

  fn dropped_blocks(&self) -> u64 {
    self.publisher.queue().dropped()
  }
}

impl<A: Acquisition> Drop for AdcStream<A> {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::double_buffer::BufferId;
  use itertools::Itertools;
  use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};

  /// Publishes four blocks synchronously on every arm.
  #[derive(Default)]
  struct ScriptedAcquisition {
    fail_init: bool,
    arms: Arc<AtomicUsize>,
    halts: Arc<AtomicUsize>,
  }

  impl Acquisition for ScriptedAcquisition {
    fn name(&self) -> &'static str {
      "scripted"
    }
    fn sample_rate_hz(&self, config: &StreamConfig) -> u32 {
      config.sample_rate_hz
    }
    fn init(&mut self, _config: &StreamConfig, _memory: &Arc<DoubleBuffer>) -> Result<()> {
      if self.fail_init { Err(Error::DeviceNotReady) } else { Ok(()) }
    }
    fn arm(&mut self, _config: &StreamConfig, publisher: Arc<Publisher>) -> Result<()> {
      self.arms.fetch_add(1, StdOrdering::SeqCst);
      for buffer_id in [BufferId::M0, BufferId::M1] {
        publisher.publish(buffer_id, false);
        publisher.publish(buffer_id, true);
      }
      Ok(())
    }
    fn halt(&mut self) {
      self.halts.fetch_add(1, StdOrdering::SeqCst);
    }
  }

  fn small_config() -> StreamConfig {
    StreamConfig { buffer_samples: 8, queue_capacity: 16, ..Default::default() }
  }

  fn drain(stream: &impl SampleStream) -> Vec<u32> {
    let mut sequences = vec![];
    while let Ok(block) = stream.get(Duration::from_millis(1)) {
      sequences.push(block.sequence);
    }
    sequences
  }

  #[test]
  fn test_start_requires_init() {
    let stream = AdcStream::new(small_config(), ScriptedAcquisition::default()).unwrap();
    assert!(matches!(stream.start(), Err(Error::NotInitialized)));
    assert!(stream.state() == StreamState::Uninitialized);
  }

  #[test]
  fn test_failed_init_leaves_stream_uninitialized() {
    let acquisition = ScriptedAcquisition { fail_init: true, ..Default::default() };
    let stream = AdcStream::new(small_config(), acquisition).unwrap();
    assert!(matches!(stream.init(), Err(Error::DeviceNotReady)));
    assert!(stream.state() == StreamState::Uninitialized);
  }

  #[test]
  fn test_invalid_config_is_rejected_up_front() {
    let config = StreamConfig { buffer_samples: 7, ..Default::default() };
    assert!(matches!(AdcStream::new(config, ScriptedAcquisition::default()), Err(Error::Configuration(_))));
  }

  #[test]
  fn test_start_and_stop_are_idempotent() {
    let acquisition = ScriptedAcquisition::default();
    let (arms, halts) = (acquisition.arms.clone(), acquisition.halts.clone());
    let stream = AdcStream::new(small_config(), acquisition).unwrap();
    stream.init().unwrap();
    stream.start().unwrap();
    stream.start().unwrap();
    assert_eq!(arms.load(StdOrdering::SeqCst), 1);
    assert_eq!(drain(&stream), vec![0, 1, 2, 3]);

    stream.stop();
    stream.stop();
    assert_eq!(halts.load(StdOrdering::SeqCst), 1);
    assert!(matches!(stream.get(Duration::from_millis(1)), Err(Error::Timeout)));
  }

  #[test]
  fn test_sequence_restarts_on_each_start() {
    let stream = AdcStream::new(small_config(), ScriptedAcquisition::default()).unwrap();
    stream.init().unwrap();
    stream.start().unwrap();
    stream.stop();
    stream.start().unwrap();
    assert_eq!(drain(&stream), vec![0, 1, 2, 3, 0, 1, 2, 3]);
  }

  #[test]
  fn test_blocks_reference_published_halves() {
    let stream = AdcStream::new(small_config(), ScriptedAcquisition::default()).unwrap();
    stream.init().unwrap();
    stream.start().unwrap();
    let blocks = (0..4).map(|_| stream.get(Duration::ZERO).unwrap()).collect_vec();
    let layout = blocks.iter().map(|b| (b.buffer_id, b.second_half, b.count)).collect_vec();
    assert_eq!(layout, vec![
      (BufferId::M0, false, 4),
      (BufferId::M0, true, 4),
      (BufferId::M1, false, 4),
      (BufferId::M1, true, 4),
    ]);
  }

  #[test]
  fn test_reinit_while_running_is_rejected() {
    let stream = AdcStream::new(small_config(), ScriptedAcquisition::default()).unwrap();
    stream.init().unwrap();
    stream.start().unwrap();
    assert!(matches!(stream.init(), Err(Error::Configuration(_))));
    assert!(stream.is_running());
  }
}
