//! Software-polled acquisition for targets without a timer-triggered DMA path.
//!
//! A dedicated thread converts synchronously, fills the same double buffer half by half and
//! publishes exactly the block shape the DMA variant does. Timing is only as good as the
//! [`Pacer`] it yields to.

use std::{
  sync::{atomic::AtomicBool, Arc},
  thread::JoinHandle,
  time::Duration,
};

use atomic::Ordering;

use crate::analog::AnalogChannel;
use crate::common::*;
use crate::config::StreamConfig;
use crate::double_buffer::{BufferId, DoubleBuffer};
use crate::error::{Error, Result};
use crate::pacing::Pacer;
use crate::publisher::Publisher;
use crate::stream::Acquisition;
use crate::thread_utils::spawn_realtime;

const SAMPLER_THREAD_PRIORITY: u8 = 80;

pub struct PollingAcquisition<C: AnalogChannel + 'static, P: Pacer + 'static> {
  // channel and pacer while no sampler thread owns them
  idle: Option<(C, P)>,
  sampler: Option<JoinHandle<(C, P)>>,
  running: Arc<AtomicBool>,
  initialized: bool,
}

impl<C: AnalogChannel + 'static, P: Pacer + 'static> PollingAcquisition<C, P> {
  pub fn new(channel: C, pacer: P) -> Self {
    Self { idle: Some((channel, pacer)), sampler: None, running: Arc::new(AtomicBool::new(false)), initialized: false }
  }

  pub fn is_sampling(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }
}

struct Sampler<C, P> {
  channel: C,
  pacer: P,
  publisher: Arc<Publisher>,
  running: Arc<AtomicBool>,
  mask: Sample,
  pace_every: usize,
  pace_interval: Duration,
}

impl<C: AnalogChannel, P: Pacer> Sampler<C, P> {
  fn fill_half(&mut self, memory: &DoubleBuffer, target: BufferId, second_half: bool, since_pace: &mut usize) {
    let offset = if second_half { memory.half_len() } else { 0 };
    memory.begin_half();
    for index in offset..offset + memory.half_len() {
      if *since_pace >= self.pace_every {
        *since_pace = 0;
        self.pacer.pace(self.pace_interval);
      }
      // a failed conversion leaves a zero in the stream rather than shifting it
      let value = self.channel.read().map(|v| v & self.mask).unwrap_or(0);
      memory.store(target, index, value);
      *since_pace += 1;
    }
  }

  fn run(mut self) -> (C, P) {
    let memory = self.publisher.memory().clone();
    let mut target = BufferId::M0;
    let mut since_pace = 0;
    'sampling: loop {
      for second_half in [false, true] {
        if !self.running.load(Ordering::Acquire) {
          break 'sampling;
        }
        self.fill_half(&memory, target, second_half, &mut since_pace);
        self.publisher.publish(target, second_half);
      }
      target = target.other();
    }
    (self.channel, self.pacer)
  }
}

impl<C: AnalogChannel + 'static, P: Pacer + 'static> Acquisition for PollingAcquisition<C, P> {
  fn name(&self) -> &'static str {
    "polling sampler"
  }

  fn sample_rate_hz(&self, config: &StreamConfig) -> u32 {
    config.polling.sample_rate_hz
  }

  fn init(&mut self, config: &StreamConfig, _memory: &Arc<DoubleBuffer>) -> Result<()> {
    let (channel, _) = self.idle.as_mut().ok_or(Error::DeviceNotReady)?;
    if !channel.is_ready() {
      return Err(Error::DeviceNotReady);
    }
    channel.setup(config.resolution_bits)?;
    self.initialized = true;
    debug!(
      "polling: {} Hz, pausing {:?} every {} samples",
      config.polling.sample_rate_hz, config.pace_interval(), config.pace_every_samples()
    );
    Ok(())
  }

  fn arm(&mut self, config: &StreamConfig, publisher: Arc<Publisher>) -> Result<()> {
    if !self.initialized {
      return Err(Error::NotInitialized);
    }
    if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
      return Ok(());
    }
    let Some((channel, pacer)) = self.idle.take() else {
      self.running.store(false, Ordering::Release);
      return Err(Error::DeviceNotReady);
    };
    let sampler = Sampler {
      channel,
      pacer,
      publisher,
      running: self.running.clone(),
      mask: config.sample_mask(),
      pace_every: config.pace_every_samples(),
      pace_interval: config.pace_interval(),
    };
    match spawn_realtime("adc sampler", SAMPLER_THREAD_PRIORITY, move || sampler.run()) {
      Ok(handle) => {
        self.sampler = Some(handle);
        Ok(())
      }
      Err(e) => {
        self.running.store(false, Ordering::Release);
        self.initialized = false;
        error!("cannot spawn sampler thread: {e}");
        Err(Error::config(format!("cannot spawn sampler thread: {e}")))
      }
    }
  }

  fn halt(&mut self) {
    self.running.store(false, Ordering::Release);
    if let Some(handle) = self.sampler.take() {
      match handle.join() {
        Ok(idle) => self.idle = Some(idle),
        Err(_) => {
          error!("sampler thread panicked, channel lost");
          self.initialized = false;
        }
      }
    }
  }
}

impl<C: AnalogChannel + 'static, P: Pacer + 'static> Drop for PollingAcquisition<C, P> {
  fn drop(&mut self) {
    self.halt();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::analog::SyntheticChannel;
  use crate::pacing::NoPacing;
  use crate::stream::{AdcStream, SampleStream};
  use itertools::Itertools;
  use std::sync::mpsc;

  /// Holds the sampler at every pacing point until the test lets it go.
  struct StepPacer(mpsc::Receiver<()>);

  impl Pacer for StepPacer {
    fn pace(&mut self, _delay: Duration) {
      let _ = self.0.recv();
    }
  }

  struct NotReady;

  impl AnalogChannel for NotReady {
    fn is_ready(&self) -> bool {
      false
    }
    fn setup(&mut self, _resolution_bits: u8) -> Result<()> {
      Ok(())
    }
    fn read(&mut self) -> Result<Sample> {
      Err(Error::DeviceNotReady)
    }
  }

  fn config() -> StreamConfig {
    let mut config = StreamConfig { buffer_samples: 8, queue_capacity: 64, ..Default::default() };
    config.polling.pace_every_samples = Some(4);
    config
  }

  const WAIT: Duration = Duration::from_secs(5);

  #[test]
  fn test_publishes_one_half_per_pacing_step() {
    let (step, steps) = mpsc::channel();
    let stream = AdcStream::new(config(), PollingAcquisition::new(SyntheticChannel::ramp(), StepPacer(steps))).unwrap();
    stream.init().unwrap();
    stream.start().unwrap();

    let first = stream.get(WAIT).unwrap();
    assert_eq!((first.sequence, first.buffer_id, first.second_half), (0, BufferId::M0, false));
    assert_eq!(first.iter().collect_vec(), vec![0, 1, 2, 3]);
    assert!(matches!(stream.get(Duration::from_millis(20)), Err(Error::Timeout)));

    let mut layout = vec![];
    for _ in 0..3 {
      step.send(()).unwrap();
      let block = stream.get(WAIT).unwrap();
      layout.push((block.sequence, block.buffer_id, block.second_half, block.iter().collect_vec()));
    }
    assert_eq!(layout, vec![
      (1, BufferId::M0, true, vec![4, 5, 6, 7]),
      (2, BufferId::M1, false, vec![8, 9, 10, 11]),
      (3, BufferId::M1, true, vec![12, 13, 14, 15]),
    ]);

    drop(step);
    stream.stop();
    let published = stream.published_blocks();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(stream.published_blocks(), published);
  }

  #[test]
  fn test_start_twice_runs_one_sampler() {
    let (step, steps) = mpsc::channel();
    let stream = AdcStream::new(config(), PollingAcquisition::new(SyntheticChannel::ramp(), StepPacer(steps))).unwrap();
    stream.init().unwrap();
    stream.start().unwrap();
    stream.start().unwrap();
    assert_eq!(stream.get(WAIT).unwrap().sequence, 0);
    step.send(()).unwrap();
    assert_eq!(stream.get(WAIT).unwrap().sequence, 1);
    // a second sampler would have published its own block 0 by now
    assert!(matches!(stream.get(Duration::from_millis(20)), Err(Error::Timeout)));
    drop(step);
    stream.stop();
  }

  #[test]
  fn test_arm_is_idempotent_on_its_own() {
    let publisher = Publisher::new(8, 64);
    let (step, steps) = mpsc::channel();
    let mut acquisition = PollingAcquisition::new(SyntheticChannel::ramp(), StepPacer(steps));
    acquisition.init(&config(), publisher.memory()).unwrap();
    acquisition.arm(&config(), publisher.clone()).unwrap();
    acquisition.arm(&config(), publisher.clone()).unwrap();
    assert!(acquisition.is_sampling());
    assert_eq!(publisher.queue().pop(WAIT).unwrap().sequence, 0);
    drop(step);
    acquisition.halt();
    assert!(!acquisition.is_sampling());
  }

  #[test]
  fn test_restart_reuses_channel() {
    let stream = AdcStream::new(config(), PollingAcquisition::new(SyntheticChannel::ramp(), NoPacing)).unwrap();
    stream.init().unwrap();
    for _ in 0..3 {
      stream.start().unwrap();
      assert_eq!(stream.get(WAIT).unwrap().sequence, 0);
      stream.stop();
      while stream.get(Duration::ZERO).is_ok() {}
    }
  }

  #[test]
  fn test_stop_is_idempotent_and_drains_to_timeout() {
    let stream = AdcStream::new(config(), PollingAcquisition::new(SyntheticChannel::ramp(), NoPacing)).unwrap();
    stream.init().unwrap();
    stream.start().unwrap();
    assert_eq!(stream.get(WAIT).unwrap().sequence, 0);
    stream.stop();
    stream.stop();
    let sequences = std::iter::from_fn(|| stream.get(Duration::from_millis(5)).ok()).map(|b| b.sequence).collect_vec();
    assert!(sequences.iter().tuple_windows().all(|(a, b)| b > a));
    assert!(matches!(stream.get(Duration::from_millis(5)), Err(Error::Timeout)));
  }

  #[test]
  fn test_not_ready_channel_fails_init() {
    let stream = AdcStream::new(config(), PollingAcquisition::new(NotReady, NoPacing)).unwrap();
    assert!(matches!(stream.init(), Err(Error::DeviceNotReady)));
    assert!(matches!(stream.start(), Err(Error::NotInitialized)));
  }

  #[test]
  fn test_reports_polling_rate() {
    let stream = AdcStream::new(config(), PollingAcquisition::new(SyntheticChannel::ramp(), NoPacing)).unwrap();
    assert_eq!(stream.sample_rate_hz(), 20_000);
    assert_eq!(stream.resolution_bits(), 12);
  }
}
