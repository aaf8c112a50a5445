//! Raw persisted format: headerless native-endian fixed-width samples, one per conversion.

use crate::common::*;

/// Iterates samples stored in the raw persisted format.
pub struct SamplesReader<'a> {
  pub bytes: &'a [u8],
  pub read_pos: usize,
}

impl<'a> SamplesReader<'a> {
  pub fn new(bytes: &'a [u8]) -> Self {
    Self { bytes, read_pos: 0 }
  }
}

impl<'a> Iterator for SamplesReader<'a> {
  type Item = Sample;
  #[inline(always)]
  fn next(&mut self) -> Option<Sample> {
    let b = self.bytes.get(self.read_pos..self.read_pos + SAMPLE_BYTES)?;
    self.read_pos += SAMPLE_BYTES;
    Some(Sample::from_ne_bytes([b[0], b[1]]))
  }
  #[inline(always)]
  fn size_hint(&self) -> (usize, Option<usize>) {
    let size = (self.bytes.len() - self.read_pos) / SAMPLE_BYTES;
    (size, Some(size))
  }
}

impl<'a> ExactSizeIterator for SamplesReader<'a> {}

/// Writes samples into `dst` until either runs out; returns the number of bytes written.
#[inline(always)]
pub fn write_ne_samples(src: impl IntoIterator<Item = Sample>, dst: &mut [u8]) -> usize {
  let mut pos = 0;
  let mut srci = src.into_iter();
  while pos + SAMPLE_BYTES <= dst.len() {
    if let Some(sample) = srci.next() {
      dst[pos..pos + SAMPLE_BYTES].copy_from_slice(&sample.to_ne_bytes());
      pos += SAMPLE_BYTES;
    } else {
      break;
    }
  }
  pos
}
