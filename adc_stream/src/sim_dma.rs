//! Software model of the timer + converter + double-buffer DMA stream.
//!
//! Either free-runs on its own thread at the timer rate, or is clocked by hand through a
//! [`DmaClock`] so tests can place every trigger deterministically.

use std::{
  sync::{
    atomic::{AtomicBool, AtomicU8},
    Arc, Mutex, MutexGuard, PoisonError,
  },
  thread::JoinHandle,
  time::{Duration, Instant},
};

use atomic::Ordering;

use crate::analog::AnalogChannel;
use crate::common::*;
use crate::config::StreamConfig;
use crate::dma_producer::{DmaEngine, DmaInterruptHandler, DmaStatus};
use crate::double_buffer::{BufferId, DoubleBuffer};
use crate::error::{Error, Result};
use crate::pacing::{Pacer, SleepPacer};
use crate::thread_utils::spawn_realtime;

const TIMER_THREAD_PRIORITY: u8 = 90;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Registers {
  half_transfer: AtomicBool,
  transfer_complete: AtomicBool,
  target: AtomicU8,
}

impl Registers {
  fn target(&self) -> BufferId {
    BufferId::from_index(self.target.load(Ordering::Acquire)).unwrap_or(BufferId::M0)
  }
  fn reset(&self) {
    self.half_transfer.store(false, Ordering::Release);
    self.transfer_complete.store(false, Ordering::Release);
    self.target.store(BufferId::M0.index() as u8, Ordering::Release);
  }
}

impl DmaStatus for Registers {
  fn take_half_transfer(&self) -> bool {
    self.half_transfer.swap(false, Ordering::AcqRel)
  }
  fn take_transfer_complete(&self) -> bool {
    self.transfer_complete.swap(false, Ordering::AcqRel)
  }
  fn current_target(&self) -> BufferId {
    self.target()
  }
}

struct Transfer {
  memory: Arc<DoubleBuffer>,
  mask: Sample,
  position: usize,
  timer_clock_hz: u64,
  ticks_per_sample: u64,
  // Some while the stream and its interrupts are enabled
  handler: Option<Arc<dyn DmaInterruptHandler>>,
}

struct Shared<C> {
  channel: Mutex<C>,
  registers: Registers,
  transfer: Mutex<Option<Transfer>>,
  timer_running: AtomicBool,
}

impl<C: AnalogChannel> Shared<C> {
  /// Fires the conversion trigger up to `count` times; returns how many conversions happened.
  fn convert(&self, count: usize) -> usize {
    let mut transfer = lock(&self.transfer);
    let Some(transfer) = transfer.as_mut() else { return 0 };
    let Some(handler) = transfer.handler.clone() else { return 0 };
    let mut channel = lock(&self.channel);
    let half = transfer.memory.half_len();
    for _ in 0..count {
      if transfer.position % half == 0 {
        transfer.memory.begin_half();
      }
      let target = self.registers.target();
      let value = channel.read().unwrap_or(0) & transfer.mask;
      transfer.memory.store(target, transfer.position, value);
      transfer.position += 1;
      if transfer.position == half {
        self.registers.half_transfer.store(true, Ordering::Release);
        handler.on_interrupt(&self.registers);
      } else if transfer.position == 2 * half {
        transfer.position = 0;
        self.registers.target.store(target.other().index() as u8, Ordering::Release);
        self.registers.transfer_complete.store(true, Ordering::Release);
        handler.on_interrupt(&self.registers);
      }
    }
    count
  }

  fn half_len(&self) -> usize {
    lock(&self.transfer).as_ref().map(|t| t.memory.half_len()).unwrap_or(0)
  }
}

fn run_timer<C: AnalogChannel>(shared: Arc<Shared<C>>, mut pacer: Box<dyn Pacer>) -> Box<dyn Pacer> {
  let (batch, timer_clock_hz, ticks_per_sample) = match lock(&shared.transfer).as_ref() {
    Some(t) => (t.memory.half_len(), t.timer_clock_hz, t.ticks_per_sample),
    None => return pacer,
  };
  let started = Instant::now();
  let mut conversions: u64 = 0;
  while shared.timer_running.load(Ordering::Acquire) {
    let done = shared.convert(batch);
    if done == 0 {
      break;
    }
    conversions += done as u64;
    let elapsed_ns = conversions as u128 * ticks_per_sample as u128 * 1_000_000_000 / timer_clock_hz.max(1) as u128;
    let due = started + Duration::from_nanos(elapsed_ns as u64);
    pacer.pace(due.saturating_duration_since(Instant::now()));
  }
  pacer
}

enum Clocking {
  FreeRunning,
  Manual,
}

pub struct SimulatedDma<C: AnalogChannel + 'static> {
  shared: Arc<Shared<C>>,
  clocking: Clocking,
  pacer: Option<Box<dyn Pacer>>,
  timer: Option<JoinHandle<Box<dyn Pacer>>>,
}

/// Hand-cranked timer of a manually clocked [`SimulatedDma`].
pub struct DmaClock<C: AnalogChannel + 'static> {
  shared: Arc<Shared<C>>,
}

impl<C: AnalogChannel + 'static> DmaClock<C> {
  /// Fires `count` conversion triggers. Returns 0 while the stream is disabled.
  pub fn trigger(&self, count: usize) -> usize {
    self.shared.convert(count)
  }

  /// Fires enough triggers to fill `halves` buffer halves.
  pub fn trigger_halves(&self, halves: usize) -> usize {
    self.trigger(halves * self.shared.half_len())
  }
}

impl<C: AnalogChannel + 'static> SimulatedDma<C> {
  fn with_clocking(channel: C, clocking: Clocking, pacer: Option<Box<dyn Pacer>>) -> Self {
    let shared = Arc::new(Shared {
      channel: Mutex::new(channel),
      registers: Registers {
        half_transfer: AtomicBool::new(false),
        transfer_complete: AtomicBool::new(false),
        target: AtomicU8::new(0),
      },
      transfer: Mutex::new(None),
      timer_running: AtomicBool::new(false),
    });
    Self { shared, clocking, pacer, timer: None }
  }

  /// Timer runs on its own thread, paced to the configured rate.
  pub fn free_running(channel: C, pacer: impl Pacer + 'static) -> Self {
    Self::with_clocking(channel, Clocking::FreeRunning, Some(Box::new(pacer)))
  }

  /// Timer only fires through the returned clock.
  pub fn manual(channel: C) -> (Self, DmaClock<C>) {
    let engine = Self::with_clocking(channel, Clocking::Manual, None);
    let clock = DmaClock { shared: engine.shared.clone() };
    (engine, clock)
  }

  fn stop_timer(&mut self) {
    self.shared.timer_running.store(false, Ordering::Release);
    if let Some(timer) = self.timer.take() {
      match timer.join() {
        Ok(pacer) => self.pacer = Some(pacer),
        Err(_) => error!("simulated DMA timer thread panicked"),
      }
    }
  }
}

impl<C: AnalogChannel + 'static> DmaEngine for SimulatedDma<C> {
  fn is_ready(&self) -> bool {
    lock(&self.shared.channel).is_ready()
  }

  fn configure(&mut self, config: &StreamConfig, memory: Arc<DoubleBuffer>) -> Result<()> {
    let auto_reload = config.auto_reload()?;
    if memory.buffer_len() != config.buffer_samples {
      return Err(Error::config(format!(
        "DMA memory holds {} samples per buffer, configuration wants {}", memory.buffer_len(), config.buffer_samples
      )));
    }
    lock(&self.shared.channel).setup(config.resolution_bits)?;
    *lock(&self.shared.transfer) = Some(Transfer {
      memory,
      mask: config.sample_mask(),
      position: 0,
      timer_clock_hz: config.timer_clock_hz as u64,
      ticks_per_sample: auto_reload as u64 + 1,
      handler: None,
    });
    self.shared.registers.reset();
    Ok(())
  }

  fn start(&mut self, handler: Arc<dyn DmaInterruptHandler>) -> Result<()> {
    {
      let mut transfer = lock(&self.shared.transfer);
      let transfer = transfer.as_mut().ok_or(Error::NotInitialized)?;
      self.shared.registers.reset();
      transfer.position = 0;
      transfer.handler = Some(handler);
    }
    if let Clocking::FreeRunning = self.clocking {
      self.shared.timer_running.store(true, Ordering::Release);
      let shared = self.shared.clone();
      let pacer = self.pacer.take().unwrap_or_else(|| Box::new(SleepPacer) as Box<dyn Pacer>);
      match spawn_realtime("dma timer", TIMER_THREAD_PRIORITY, move || run_timer(shared, pacer)) {
        Ok(timer) => self.timer = Some(timer),
        Err(e) => {
          self.stop();
          return Err(Error::config(format!("cannot start timer thread: {e}")));
        }
      }
    }
    Ok(())
  }

  fn stop(&mut self) {
    self.stop_timer();
    if let Some(transfer) = lock(&self.shared.transfer).as_mut() {
      transfer.handler = None;
    }
    self.shared.registers.reset();
  }
}

impl<C: AnalogChannel + 'static> Drop for SimulatedDma<C> {
  fn drop(&mut self) {
    self.stop_timer();
  }
}
