use std::{io, thread::JoinHandle};

use crate::common::*;
use crate::os_utils::set_current_thread_realtime;

/// Spawns a named thread and tries to give it a real-time FIFO priority.
/// Missing privileges only cost scheduling latency, so that failure is logged, not returned.
pub fn spawn_realtime<T: Send + 'static>(
  name: impl ToString,
  priority_hint: u8,
  f: impl FnOnce() -> T + Send + 'static,
) -> io::Result<JoinHandle<T>> {
  let name = name.to_string();
  std::thread::Builder::new().name(name.clone()).spawn(move || {
    if let Err(e) = set_current_thread_realtime(priority_hint) {
      debug!("{name}: running without real-time priority ({e:?})");
    }
    f()
  })
}
