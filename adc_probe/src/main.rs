//! Bring-up probe: streams for a while and logs what every block looks like.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use clap::{Parser, ValueEnum};
use log::{error, info, warn};

use adc_stream::{
  AdcStream, AppConfig, DmaAcquisition, Error, PollingAcquisition, SampleBlock, SampleStream, SimulatedDma,
  SleepPacer, StreamConfig, SyntheticChannel,
};

const GET_TIMEOUT: Duration = Duration::from_millis(500);
const HEAD_SAMPLES: usize = 8;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
  Dma,
  Polling,
}

#[derive(Parser)]
#[clap(name = "adc_probe", about = "Consumes sample blocks for a while and logs a summary of each")]
struct Opt {
  #[clap(long, short, value_enum, default_value_t = Strategy::Dma)]
  strategy: Strategy,
  #[clap(long, short = 't', default_value_t = 10, help = "How long to consume blocks, in seconds")]
  seconds: u64,
  #[clap(long, short, help = "TOML file with a [stream] table")]
  config: Option<PathBuf>,
}

fn describe(block: &SampleBlock) -> String {
  let head = block.iter().take(HEAD_SAMPLES);
  let (mut min, mut max, mut sum, mut n) = (u16::MAX, 0, 0u32, 0u32);
  for sample in head {
    min = min.min(sample);
    max = max.max(sample);
    sum += sample as u32;
    n += 1;
  }
  let avg = if n > 0 { sum / n } else { 0 };
  format!(
    "seq={} buf_id={} second_half={} min={min} max={max} avg={avg}",
    block.sequence, block.buffer_id.index(), block.second_half as u8
  )
}

fn probe(stream: &impl SampleStream, duration: Duration) -> Result<u64, Error> {
  stream.init()?;
  stream.start()?;
  info!("probing {} Hz, {}-bit for {duration:?}", stream.sample_rate_hz(), stream.resolution_bits());

  let deadline = Instant::now() + duration;
  let mut consumed = 0u64;
  while Instant::now() < deadline {
    match stream.get(GET_TIMEOUT) {
      Ok(block) => {
        consumed += 1;
        info!("{}", describe(&block));
      }
      Err(Error::Timeout) => warn!("no blocks yet..."),
      Err(e) => {
        stream.stop();
        return Err(e);
      }
    }
  }
  stream.stop();
  info!("consumed {consumed} blocks, {} dropped", stream.dropped_blocks());
  Ok(consumed)
}

fn run(opt: &Opt, config: StreamConfig) -> Result<u64, Error> {
  let duration = Duration::from_secs(opt.seconds);
  match opt.strategy {
    Strategy::Dma => {
      let engine = SimulatedDma::free_running(SyntheticChannel::ramp(), SleepPacer);
      probe(&AdcStream::new(config, DmaAcquisition::new(engine))?, duration)
    }
    Strategy::Polling => {
      probe(&AdcStream::new(config, PollingAcquisition::new(SyntheticChannel::ramp(), SleepPacer))?, duration)
    }
  }
}

fn main() {
  let logenv = env_logger::Env::default().default_filter_or("info");
  env_logger::init_from_env(logenv);

  let opt = Opt::parse();
  let config = match &opt.config {
    Some(path) => AppConfig::load(path).map(|c| c.stream),
    None => Ok(StreamConfig::default()),
  };
  if let Err(e) = config.and_then(|config| run(&opt, config)) {
    error!("probe failed: {e}");
    std::process::exit(1);
  }
}
