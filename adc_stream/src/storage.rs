//! Block-storage boundary of the persistence consumer.

use std::{
  fs::{self, File, OpenOptions},
  io::{self, Write},
  path::{Path, PathBuf},
};

use crate::common::*;

/// An open write target.
pub trait StorageSink: Send {
  /// One bulk write; may accept fewer bytes than offered.
  fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;
  /// Durability barrier: returns once everything written so far is persistent.
  fn sync(&mut self) -> io::Result<()>;
  fn close(&mut self) -> io::Result<()>;
}

pub trait Storage: Send {
  type Sink: StorageSink;
  fn mount(&mut self) -> io::Result<()>;
  /// Opens `path` for writing, creating it if missing and appending otherwise.
  fn open_append(&mut self, path: &Path) -> io::Result<Self::Sink>;
}

/// Directory tree of the host filesystem standing in for the card's volume.
pub struct FileStorage {
  root: PathBuf,
}

impl FileStorage {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }
}

impl Storage for FileStorage {
  type Sink = FileSink;

  fn mount(&mut self) -> io::Result<()> {
    fs::create_dir_all(&self.root)?;
    debug!("storage mounted at {}", self.root.display());
    Ok(())
  }

  fn open_append(&mut self, path: &Path) -> io::Result<FileSink> {
    let path = self.root.join(path);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    info!("writing samples to {}", path.display());
    Ok(FileSink { file: Some(file) })
  }
}

pub struct FileSink {
  file: Option<File>,
}

fn closed() -> io::Error {
  io::Error::new(io::ErrorKind::NotConnected, "sink already closed")
}

impl StorageSink for FileSink {
  fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
    self.file.as_mut().ok_or_else(closed)?.write(bytes)
  }

  fn sync(&mut self) -> io::Result<()> {
    let file = self.file.as_mut().ok_or_else(closed)?;
    file.flush()?;
    file.sync_data()
  }

  fn close(&mut self) -> io::Result<()> {
    match self.file.take() {
      Some(file) => file.sync_all(),
      None => Ok(()),
    }
  }
}
