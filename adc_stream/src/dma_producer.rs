//! Timer-triggered, DMA-driven double-buffer acquisition.
//!
//! A timer fires at the sample rate and triggers one conversion; the DMA stream moves each
//! result into the buffer it currently targets, first half then second half, and flips the
//! target to the other buffer on completion. Its half-transfer and transfer-complete
//! interrupts are turned into published blocks here.

use std::sync::Arc;

use crate::common::*;
use crate::config::StreamConfig;
use crate::double_buffer::{BufferId, DoubleBuffer};
use crate::error::{Error, Result};
use crate::publisher::Publisher;
use crate::stream::Acquisition;

/// DMA stream status as seen from its interrupt handler.
pub trait DmaStatus {
  /// Reads and clears the half-transfer flag.
  fn take_half_transfer(&self) -> bool;
  /// Reads and clears the transfer-complete flag.
  fn take_transfer_complete(&self) -> bool;
  /// Buffer the stream is writing to. Already flipped when transfer-complete is observed.
  fn current_target(&self) -> BufferId;
}

pub trait DmaInterruptHandler: Send + Sync {
  fn on_interrupt(&self, status: &dyn DmaStatus);
}

/// Timer, converter and DMA stream, configured for double-buffer transfers.
pub trait DmaEngine: Send {
  fn is_ready(&self) -> bool;
  /// Programs the timer, converter and DMA addresses. Nothing may stay programmed on error.
  fn configure(&mut self, config: &StreamConfig, memory: Arc<DoubleBuffer>) -> Result<()>;
  /// Enables the stream and the half/complete interrupts, then starts the trigger.
  fn start(&mut self, handler: Arc<dyn DmaInterruptHandler>) -> Result<()>;
  /// Stops the trigger, disables the interrupts and the stream.
  fn stop(&mut self);
}

/// Interrupt handler of the double-buffer stream.
pub struct DoubleBufferIsr {
  publisher: Arc<Publisher>,
}

impl DoubleBufferIsr {
  pub fn new(publisher: Arc<Publisher>) -> Self {
    Self { publisher }
  }
}

impl DmaInterruptHandler for DoubleBufferIsr {
  fn on_interrupt(&self, status: &dyn DmaStatus) {
    // read once at entry: for transfer-complete the hardware has already flipped it
    let target = status.current_target();
    let half_transfer = status.take_half_transfer();
    let transfer_complete = status.take_transfer_complete();
    // when both are pending the completed buffer is older than the half being reported
    if transfer_complete {
      self.publisher.publish(target.other(), true);
    }
    if half_transfer {
      self.publisher.publish(target, false);
    }
  }
}

pub struct DmaAcquisition<E: DmaEngine> {
  engine: E,
  configured: bool,
}

impl<E: DmaEngine> DmaAcquisition<E> {
  pub fn new(engine: E) -> Self {
    Self { engine, configured: false }
  }
}

impl<E: DmaEngine> Acquisition for DmaAcquisition<E> {
  fn name(&self) -> &'static str {
    "dma sampler"
  }

  fn sample_rate_hz(&self, config: &StreamConfig) -> u32 {
    config.sample_rate_hz
  }

  fn init(&mut self, config: &StreamConfig, memory: &Arc<DoubleBuffer>) -> Result<()> {
    if !self.engine.is_ready() {
      return Err(Error::DeviceNotReady);
    }
    let auto_reload = config.auto_reload()?;
    let effective_rate = config.effective_sample_rate_hz()?;
    self.engine.configure(config, memory.clone())?;
    self.configured = true;
    if effective_rate != config.sample_rate_hz as f64 {
      warn!("timer cannot hit {} Hz exactly, sampling at {effective_rate:.1} Hz", config.sample_rate_hz);
    }
    debug!(
      "timer: clock {} Hz, auto-reload {auto_reload}, {} samples per buffer",
      config.timer_clock_hz, config.buffer_samples
    );
    Ok(())
  }

  fn arm(&mut self, _config: &StreamConfig, publisher: Arc<Publisher>) -> Result<()> {
    if !self.configured {
      return Err(Error::NotInitialized);
    }
    self.engine.start(Arc::new(DoubleBufferIsr::new(publisher)))
  }

  fn halt(&mut self) {
    self.engine.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{cell::Cell, time::Duration};

  struct Flags {
    half_transfer: Cell<bool>,
    transfer_complete: Cell<bool>,
    target: BufferId,
  }

  impl Flags {
    fn new(half_transfer: bool, transfer_complete: bool, target: BufferId) -> Self {
      Self { half_transfer: Cell::new(half_transfer), transfer_complete: Cell::new(transfer_complete), target }
    }
  }

  impl DmaStatus for Flags {
    fn take_half_transfer(&self) -> bool {
      self.half_transfer.replace(false)
    }
    fn take_transfer_complete(&self) -> bool {
      self.transfer_complete.replace(false)
    }
    fn current_target(&self) -> BufferId {
      self.target
    }
  }

  fn published(publisher: &Publisher) -> Vec<(u32, BufferId, bool)> {
    let mut out = vec![];
    while let Ok(tag) = publisher.queue().pop(Duration::ZERO) {
      out.push((tag.sequence, tag.buffer_id, tag.second_half));
    }
    out
  }

  #[test]
  fn test_half_transfer_reports_current_target() {
    let publisher = Publisher::new(8, 8);
    let isr = DoubleBufferIsr::new(publisher.clone());
    let flags = Flags::new(true, false, BufferId::M1);
    isr.on_interrupt(&flags);
    assert!(!flags.half_transfer.get());
    assert_eq!(published(&publisher), vec![(0, BufferId::M1, false)]);
  }

  #[test]
  fn test_transfer_complete_reports_previous_target() {
    let publisher = Publisher::new(8, 8);
    let isr = DoubleBufferIsr::new(publisher.clone());
    // M0 just completed, hardware already targets M1
    isr.on_interrupt(&Flags::new(false, true, BufferId::M1));
    isr.on_interrupt(&Flags::new(true, false, BufferId::M1));
    isr.on_interrupt(&Flags::new(false, true, BufferId::M0));
    assert_eq!(published(&publisher), vec![
      (0, BufferId::M0, true),
      (1, BufferId::M1, false),
      (2, BufferId::M1, true),
    ]);
  }

  #[test]
  fn test_both_pending_publishes_completed_buffer_first() {
    let publisher = Publisher::new(8, 8);
    let isr = DoubleBufferIsr::new(publisher.clone());
    isr.on_interrupt(&Flags::new(true, true, BufferId::M1));
    assert_eq!(published(&publisher), vec![(0, BufferId::M0, true), (1, BufferId::M1, false)]);
  }

  #[test]
  fn test_spurious_interrupt_publishes_nothing() {
    let publisher = Publisher::new(8, 8);
    DoubleBufferIsr::new(publisher.clone()).on_interrupt(&Flags::new(false, false, BufferId::M0));
    assert!(published(&publisher).is_empty());
    assert_eq!(publisher.published(), 0);
  }
}
