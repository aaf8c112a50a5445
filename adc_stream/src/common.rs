pub use log::{debug, error, info, trace, warn};

/// One conversion result, right-aligned in a 16-bit cell.
pub type Sample = u16;

pub const SAMPLE_BYTES: usize = std::mem::size_of::<Sample>();

/// Halves filled in one full double-buffer cycle: M0 first, M0 second, M1 first, M1 second.
pub const HALVES_PER_CYCLE: u32 = 4;

pub trait LogAndForget {
  fn log_and_forget(&self);
}

impl<T, E: std::fmt::Debug> LogAndForget for Result<T, E> {
  fn log_and_forget(&self) {
    if let Err(e) = self {
      warn!("Encountered error {e:?} at {:?}", std::backtrace::Backtrace::capture());
    }
  }
}
