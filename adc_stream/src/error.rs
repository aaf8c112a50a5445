use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
  #[error("analog device not ready")]
  DeviceNotReady,
  #[error("configuration error: {0}")]
  Configuration(String),
  #[error("stream is not initialized")]
  NotInitialized,
  #[error("timed out waiting for a sample block")]
  Timeout,
  #[error("storage mount failed: {0}")]
  StorageMountFailed(#[source] io::Error),
  #[error("storage open failed: {0}")]
  StorageOpenFailed(#[source] io::Error),
  #[error("storage write failed: {0}")]
  StorageWriteFailed(#[source] io::Error),
  #[error("storage sync failed: {0}")]
  StorageSyncFailed(#[source] io::Error),
  #[error("storage close failed: {0}")]
  StorageCloseFailed(#[source] io::Error),
}

impl Error {
  pub(crate) fn config(message: impl Into<String>) -> Self {
    Self::Configuration(message.into())
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
