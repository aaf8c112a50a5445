use std::{path::PathBuf, sync::Arc};
use log::{error, info};
use clap::{Parser, ValueEnum};

use adc_stream::{
  Acquisition, AdcStream, AppConfig, DmaAcquisition, FailurePolicy, FileStorage, PersistenceConsumer,
  PollingAcquisition, SimulatedDma, SleepPacer, StopSignal, SyntheticChannel, Waveform, WriterStats,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
  Dma,
  Polling,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Signal {
  Ramp,
  Noise,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Streams analog samples into a raw file until interrupted", long_about = None)]
struct Args {
  #[arg(long, short, value_enum, default_value_t = Strategy::Dma)]
  strategy: Strategy,
  /// TOML file with [stream] and [writer] tables
  #[arg(long, short)]
  config: Option<PathBuf>,
  /// Directory standing in for the storage volume
  #[arg(long, default_value = ".")]
  root: PathBuf,
  /// Output file, relative to the root
  #[arg(long, short)]
  output: Option<PathBuf>,
  #[arg(long)]
  staging_bytes: Option<usize>,
  /// Bytes between durability syncs, 0 to only sync on exit
  #[arg(long)]
  sync_every: Option<usize>,
  /// abort or best-effort
  #[arg(long)]
  on_error: Option<FailurePolicy>,
  #[arg(long, value_enum, default_value_t = Signal::Ramp)]
  signal: Signal,
}

fn load_config(args: &Args) -> adc_stream::Result<AppConfig> {
  let mut config = match &args.config {
    Some(path) => AppConfig::load(path)?,
    None => AppConfig::default(),
  };
  if let Some(output) = &args.output {
    config.writer.path = output.clone();
  }
  if let Some(staging_bytes) = args.staging_bytes {
    config.writer.staging_bytes = staging_bytes;
  }
  if let Some(sync_every) = args.sync_every {
    config.writer.sync_every_bytes = sync_every;
  }
  if let Some(policy) = args.on_error {
    config.writer.failure_policy = policy;
  }
  config.stream.validate()?;
  config.writer.validate()?;
  Ok(config)
}

async fn stream_to_file<A: Acquisition + 'static>(
  acquisition: A,
  config: AppConfig,
  root: PathBuf,
) -> Result<WriterStats, Box<dyn std::error::Error>> {
  let stream = Arc::new(AdcStream::new(config.stream, acquisition)?);
  let stop = StopSignal::new();
  let mut consumer = PersistenceConsumer::new(FileStorage::new(root), config.writer);
  let writer_stop = stop.clone();
  let mut writer = tokio::task::spawn_blocking(move || consumer.run(&*stream, &writer_stop));

  let joined = tokio::select! {
    joined = &mut writer => joined,
    _ = tokio::signal::ctrl_c() => {
      info!("interrupted, flushing and closing");
      stop.stop();
      writer.await
    }
  };
  Ok(joined??)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
  let logenv = env_logger::Env::default().default_filter_or("info");
  env_logger::init_from_env(logenv);

  let args = Args::parse();
  let config = match load_config(&args) {
    Ok(config) => config,
    Err(e) => {
      error!("{e}");
      std::process::exit(2);
    }
  };
  let channel = SyntheticChannel::new(match args.signal {
    Signal::Ramp => Waveform::Ramp,
    Signal::Noise => Waveform::Noise { seed: 0x5eed },
  });

  let result = match args.strategy {
    Strategy::Dma => {
      let engine = SimulatedDma::free_running(channel, SleepPacer);
      stream_to_file(DmaAcquisition::new(engine), config, args.root).await
    }
    Strategy::Polling => stream_to_file(PollingAcquisition::new(channel, SleepPacer), config, args.root).await,
  };

  match result {
    Ok(stats) => info!("done: {stats:?}"),
    Err(e) => {
      error!("acquisition failed: {e}");
      std::process::exit(1);
    }
  }
}
