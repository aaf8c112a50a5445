//! Analog input channel boundary and synthetic sources for running without a converter.

use rand::{rngs::SmallRng, Rng, SeedableRng};

use crate::common::*;
use crate::error::{Error, Result};

pub trait AnalogChannel: Send {
  fn is_ready(&self) -> bool {
    true
  }
  /// Applies the resolution; conversions are right-aligned to it afterwards.
  fn setup(&mut self, resolution_bits: u8) -> Result<()>;
  /// One synchronous conversion.
  fn read(&mut self) -> Result<Sample>;
}

impl<C: AnalogChannel + ?Sized> AnalogChannel for Box<C> {
  fn is_ready(&self) -> bool {
    (**self).is_ready()
  }
  fn setup(&mut self, resolution_bits: u8) -> Result<()> {
    (**self).setup(resolution_bits)
  }
  fn read(&mut self) -> Result<Sample> {
    (**self).read()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
  /// 0, 1, ..., full scale, 0, 1, ...
  Ramp,
  Constant(Sample),
  Noise { seed: u64 },
}

pub struct SyntheticChannel {
  waveform: Waveform,
  full_scale: Sample,
  next: Sample,
  rng: SmallRng,
}

impl SyntheticChannel {
  pub fn new(waveform: Waveform) -> Self {
    let seed = match waveform {
      Waveform::Noise { seed } => seed,
      _ => 0,
    };
    Self { waveform, full_scale: 0x0FFF, next: 0, rng: SmallRng::seed_from_u64(seed) }
  }

  pub fn ramp() -> Self {
    Self::new(Waveform::Ramp)
  }
}

impl AnalogChannel for SyntheticChannel {
  fn setup(&mut self, resolution_bits: u8) -> Result<()> {
    if resolution_bits == 0 || resolution_bits > 16 {
      return Err(Error::config(format!("synthetic channel cannot produce {resolution_bits}-bit samples")));
    }
    self.full_scale = ((1u32 << resolution_bits) - 1) as Sample;
    self.next = 0;
    Ok(())
  }

  fn read(&mut self) -> Result<Sample> {
    Ok(match self.waveform {
      Waveform::Ramp => {
        let value = self.next;
        self.next = if value >= self.full_scale { 0 } else { value + 1 };
        value
      }
      Waveform::Constant(value) => value & self.full_scale,
      Waveform::Noise { .. } => self.rng.gen_range(0..=self.full_scale),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use itertools::Itertools;

  #[test]
  fn test_ramp_wraps_at_full_scale() {
    let mut channel = SyntheticChannel::ramp();
    channel.setup(6).unwrap();
    let values = (0..66).map(|_| channel.read().unwrap()).collect_vec();
    assert_eq!(values[..64], (0..64).collect_vec()[..]);
    assert_eq!(values[64..], [0, 1]);
  }

  #[test]
  fn test_constant_is_masked() {
    let mut channel = SyntheticChannel::new(Waveform::Constant(0xFFFF));
    channel.setup(8).unwrap();
    assert_eq!(channel.read().unwrap(), 0xFF);
  }

  #[test]
  fn test_noise_stays_in_range_and_is_reproducible() {
    let mut a = SyntheticChannel::new(Waveform::Noise { seed: 3 });
    let mut b = SyntheticChannel::new(Waveform::Noise { seed: 3 });
    a.setup(10).unwrap();
    b.setup(10).unwrap();
    for _ in 0..1000 {
      let value = a.read().unwrap();
      assert!(value <= 0x3FF);
      assert_eq!(value, b.read().unwrap());
    }
  }
}
