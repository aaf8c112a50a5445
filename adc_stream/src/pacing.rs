//! Scheduler hook for acquisition loops that run on a thread instead of a hardware timer.

use std::{thread, time::Duration};

pub trait Pacer: Send {
  /// Gives up the CPU for about `delay`. Best effort only.
  fn pace(&mut self, delay: Duration);
}

/// Sleeps the calling thread.
pub struct SleepPacer;

impl Pacer for SleepPacer {
  fn pace(&mut self, delay: Duration) {
    if delay.is_zero() {
      thread::yield_now();
    } else {
      thread::sleep(delay);
    }
  }
}

/// Only yields; runs as fast as the channel converts.
pub struct NoPacing;

impl Pacer for NoPacing {
  fn pace(&mut self, _delay: Duration) {
    thread::yield_now();
  }
}

impl<P: Pacer + ?Sized> Pacer for Box<P> {
  fn pace(&mut self, delay: Duration) {
    (**self).pace(delay)
  }
}
