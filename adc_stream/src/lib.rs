// adc-stream
// Copyright (C) 2024 adc-stream contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! adc-stream - continuous analog sampling into a double buffer, handed off block by block
//!
//! A producer (timer-triggered DMA, or a polling thread where there is no DMA) fills two
//! physical buffers half at a time and publishes each stable half as a [`SampleBlock`]:
//! a view into the buffer, not a copy. Blocks travel through a bounded queue that never
//! blocks the producer; when it is full the newest block is dropped and shows up as a gap
//! in `sequence`. A [`PersistenceConsumer`] drains blocks into block storage.
//!
//! Clocking a simulated DMA engine by hand:
//! ```
//! use std::time::Duration;
//! use adc_stream::{AdcStream, DmaAcquisition, SampleStream, SimulatedDma, StreamConfig, SyntheticChannel};
//!
//! let (engine, clock) = SimulatedDma::manual(SyntheticChannel::ramp());
//! let stream = AdcStream::new(StreamConfig::default(), DmaAcquisition::new(engine))?;
//! stream.init()?;
//! stream.start()?;
//! clock.trigger_halves(2);
//! let block = stream.get(Duration::from_millis(500))?;
//! assert_eq!((block.sequence, block.count, block.second_half), (0, 256, false));
//! assert_eq!(block.get(10), Some(10));
//! stream.stop();
//! # Ok::<(), adc_stream::Error>(())
//! ```
//!


mod analog;
mod block;
mod block_queue;
mod common;
mod config;
mod dma_producer;
mod double_buffer;
mod error;
mod os_utils;
mod pacing;
mod polling_producer;
mod publisher;
mod samples_utils;
mod sim_dma;
mod storage;
mod stream;
mod thread_utils;
mod writer;

pub use analog::{AnalogChannel, SyntheticChannel, Waveform};
pub use block::{BlockTag, SampleBlock};
pub use block_queue::BlockQueue;
pub use common::{Sample, HALVES_PER_CYCLE, SAMPLE_BYTES};
pub use config::{AppConfig, FailurePolicy, PollingConfig, StreamConfig, WriterConfig};
pub use dma_producer::{DmaAcquisition, DmaEngine, DmaInterruptHandler, DmaStatus, DoubleBufferIsr};
pub use double_buffer::{BufferId, DoubleBuffer};
pub use error::{Error, Result};
pub use pacing::{NoPacing, Pacer, SleepPacer};
pub use polling_producer::PollingAcquisition;
pub use publisher::Publisher;
pub use sim_dma::{DmaClock, SimulatedDma};
pub use storage::{FileSink, FileStorage, Storage, StorageSink};
pub use stream::{Acquisition, AdcStream, SampleStream, StreamState};
pub use writer::{BlockWriter, PersistenceConsumer, StopSignal, WriterStats};

pub mod utils {
  pub use crate::common::LogAndForget;
  pub use crate::os_utils::set_current_thread_realtime;
  pub use crate::samples_utils::{write_ne_samples, SamplesReader};
  pub use crate::thread_utils::spawn_realtime;
}
