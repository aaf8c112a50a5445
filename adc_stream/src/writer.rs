//! Persistence consumer: drains blocks into a storage sink through a staging buffer.

use std::{
  io,
  sync::{atomic::AtomicBool, Arc},
  thread::JoinHandle,
  time::Duration,
};

use atomic::Ordering;

use crate::block::SampleBlock;
use crate::common::*;
use crate::config::{FailurePolicy, WriterConfig};
use crate::error::{Error, Result};
use crate::storage::{Storage, StorageSink};
use crate::stream::SampleStream;

/// Cooperative stop request for a running [`PersistenceConsumer`], checked between pulls.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
  pub fn new() -> Self {
    Self::default()
  }
  pub fn stop(&self) {
    self.0.store(true, Ordering::Release);
  }
  pub fn is_stopped(&self) -> bool {
    self.0.load(Ordering::Acquire)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
  pub blocks: u64,
  pub bytes_written: u64,
  pub flushes: u64,
  pub periodic_syncs: u64,
  /// Places where `sequence` jumped forward, i.e. the queue dropped blocks.
  pub sequence_gaps: u64,
  pub missing_blocks: u64,
  /// Blocks the producer started overwriting before they were copied out.
  pub overrun_blocks: u64,
  pub failed_writes: u64,
  pub failed_syncs: u64,
}

/// Returns how many bytes the sink accepted, also when it failed part way.
fn write_all(sink: &mut impl StorageSink, bytes: &[u8]) -> (usize, io::Result<()>) {
  let mut accepted = 0;
  while accepted < bytes.len() {
    match sink.write(&bytes[accepted..]) {
      Ok(0) => return (accepted, Err(io::Error::new(io::ErrorKind::WriteZero, "storage accepted no bytes"))),
      Ok(n) => accepted += n,
      Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
      Err(e) => return (accepted, Err(e)),
    }
  }
  (accepted, Ok(()))
}

/// Staging buffer and sync bookkeeping in front of one open sink.
pub struct BlockWriter<S: StorageSink> {
  sink: S,
  staging: Box<[u8]>,
  staged: usize,
  sync_every: usize,
  // bytes flushed since the last periodic sync
  unsynced: usize,
  policy: FailurePolicy,
  next_sequence: Option<u32>,
  stats: WriterStats,
}

impl<S: StorageSink> BlockWriter<S> {
  /// Fails on a configuration the staging and sync bookkeeping cannot honour.
  pub fn new(sink: S, config: &WriterConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      sink,
      staging: vec![0; config.staging_bytes].into_boxed_slice(),
      staged: 0,
      sync_every: config.sync_every_bytes,
      unsynced: 0,
      policy: config.failure_policy,
      next_sequence: None,
      stats: WriterStats::default(),
    })
  }

  pub fn stats(&self) -> &WriterStats {
    &self.stats
  }

  /// Bytes waiting in the staging buffer.
  pub fn staged(&self) -> usize {
    self.staged
  }

  pub fn write_block(&mut self, block: &SampleBlock) -> Result<()> {
    if let Some(expected) = self.next_sequence {
      let missing = block.sequence.wrapping_sub(expected);
      if missing != 0 {
        self.stats.sequence_gaps += 1;
        self.stats.missing_blocks += missing as u64;
        warn!("{missing} blocks dropped before block {}", block.sequence);
      }
    }
    self.next_sequence = Some(block.sequence.wrapping_add(1));
    self.stats.blocks += 1;
    let staged = self.stage(block.byte_len(), |offset, out| block.write_ne_bytes(offset, out));
    if !block.is_intact() {
      self.stats.overrun_blocks += 1;
      warn!("block {} was overwritten while being copied, consumer is too slow", block.sequence);
    }
    staged
  }

  /// Stages already encoded bytes.
  pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
    self.stage(bytes.len(), |offset, out| {
      out.copy_from_slice(&bytes[offset..offset + out.len()]);
      out.len()
    })
  }

  /// `fill(offset, out)` encodes the incoming bytes starting at `offset` into `out`.
  fn stage(&mut self, len: usize, mut fill: impl FnMut(usize, &mut [u8]) -> usize) -> Result<()> {
    let capacity = self.staging.len();
    if self.staged > 0 && self.staged + len > capacity {
      self.flush()?;
    }
    let mut done = 0;
    while done < len {
      let n = (len - done).min(capacity - self.staged);
      let filled = fill(done, &mut self.staging[self.staged..self.staged + n]);
      debug_assert_eq!(filled, n);
      self.staged += n;
      done += n;
      if self.staged == capacity {
        self.flush()?;
      }
    }
    Ok(())
  }

  /// Writes out the staging buffer in one bulk write, then syncs if the threshold is reached.
  pub fn flush(&mut self) -> Result<()> {
    if self.staged == 0 {
      return Ok(());
    }
    let len = self.staged;
    let (accepted, written) = write_all(&mut self.sink, &self.staging[..len]);
    self.staging[..len].fill(0);
    self.staged = 0;
    self.stats.bytes_written += accepted as u64;
    self.unsynced += accepted;
    match written {
      Ok(()) => {
        self.stats.flushes += 1;
        self.maybe_sync()
      }
      Err(e) => {
        self.stats.failed_writes += 1;
        self.fail(Error::StorageWriteFailed(e))
      }
    }
  }

  fn maybe_sync(&mut self) -> Result<()> {
    if self.sync_every == 0 || self.unsynced < self.sync_every {
      return Ok(());
    }
    self.unsynced %= self.sync_every;
    match self.sink.sync() {
      Ok(()) => {
        self.stats.periodic_syncs += 1;
        Ok(())
      }
      Err(e) => {
        self.stats.failed_syncs += 1;
        self.fail(Error::StorageSyncFailed(e))
      }
    }
  }

  fn fail(&self, e: Error) -> Result<()> {
    match self.policy {
      FailurePolicy::Abort => Err(e),
      FailurePolicy::BestEffort => {
        error!("{e}, data discarded, continuing");
        Ok(())
      }
    }
  }

  /// Flushes what is staged, syncs and closes the sink. Every step is attempted even if
  /// an earlier one failed; the first error is returned.
  pub fn finish(&mut self) -> Result<()> {
    let flushed = self.flush();
    let synced = match self.sink.sync() {
      Ok(()) => Ok(()),
      Err(e) => {
        self.stats.failed_syncs += 1;
        self.fail(Error::StorageSyncFailed(e))
      }
    };
    let closed = match self.sink.close() {
      Ok(()) => Ok(()),
      Err(e) => self.fail(Error::StorageCloseFailed(e)),
    };
    flushed.and(synced).and(closed)
  }
}

pub struct PersistenceConsumer<St: Storage> {
  storage: St,
  config: WriterConfig,
}

impl<St: Storage> PersistenceConsumer<St> {
  pub fn new(storage: St, config: WriterConfig) -> Self {
    Self { storage, config }
  }

  pub fn config(&self) -> &WriterConfig {
    &self.config
  }

  /// Mounts storage and opens the target, then initializes and starts `stream` and writes
  /// every block until `stop` is signalled. On the way out the stream is stopped, the queue
  /// drained and the sink flushed, synced and closed.
  pub fn run<S: SampleStream + ?Sized>(&mut self, stream: &S, stop: &StopSignal) -> Result<WriterStats> {
    self.config.validate()?;
    self.storage.mount().map_err(Error::StorageMountFailed)?;
    let sink = self.storage.open_append(&self.config.path).map_err(Error::StorageOpenFailed)?;
    let mut writer = BlockWriter::new(sink, &self.config)?;

    if let Err(e) = stream.init().and_then(|()| stream.start()) {
      writer.finish().log_and_forget();
      return Err(e);
    }

    let mut result = self.pull(stream, &mut writer, stop);
    stream.stop();
    if result.is_ok() {
      result = Self::drain(stream, &mut writer);
    }
    let finished = writer.finish();
    let stats = writer.stats().clone();
    info!(
      "writer finished: {} blocks, {} bytes, {} syncs, {} blocks dropped, {} overrun",
      stats.blocks, stats.bytes_written, stats.periodic_syncs, stats.missing_blocks, stats.overrun_blocks
    );
    if stats.failed_writes > 0 || stats.failed_syncs > 0 {
      warn!("{} writes and {} syncs failed", stats.failed_writes, stats.failed_syncs);
    }
    result.and(finished).map(|()| stats)
  }

  fn pull<S: SampleStream + ?Sized>(&self, stream: &S, writer: &mut BlockWriter<St::Sink>, stop: &StopSignal) -> Result<()> {
    let timeout = self.config.poll_interval();
    while !stop.is_stopped() {
      match stream.get(timeout) {
        Ok(block) => writer.write_block(&block)?,
        Err(Error::Timeout) => {}
        Err(e) => return Err(e),
      }
    }
    Ok(())
  }

  fn drain<S: SampleStream + ?Sized>(stream: &S, writer: &mut BlockWriter<St::Sink>) -> Result<()> {
    while let Ok(block) = stream.get(Duration::ZERO) {
      writer.write_block(&block)?;
    }
    Ok(())
  }
}

impl<St: Storage + 'static> PersistenceConsumer<St> {
  /// Runs the consumer on its own normal-priority thread.
  pub fn spawn<S: SampleStream + ?Sized + 'static>(
    mut self,
    stream: Arc<S>,
    stop: StopSignal,
  ) -> io::Result<JoinHandle<Result<WriterStats>>> {
    std::thread::Builder::new().name("sd writer".to_owned()).spawn(move || self.run(&*stream, &stop))
  }
}
