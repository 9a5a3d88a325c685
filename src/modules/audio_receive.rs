//! Audio-receive module (§4.4): records incoming B-channel audio to a file with
//! silence detection, stopping on extended silence, a hard timeout, DTMF (if
//! `abort_on_dtmf`), or disconnect; truncates the trailing silent tail on exit.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::error::{CapiError, Result};
use crate::observer::ConnectionObserver;
use crate::silence::SilenceDetector;

use super::waiter::{self, EventWaiter};
use super::{fail_if_already_disconnected, ObserverScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStopReason {
  SilenceExceeded,
  TimedOut,
  AbortedByDtmf,
  Disconnected,
}

pub struct ReceiveOutcome {
  pub reason: ReceiveStopReason,
  pub bytes_written: u64,
}

/// Observer that forwards to an [`EventWaiter`] while also feeding every `data_in`
/// payload through a [`SilenceDetector`], recording whether the limit has tripped.
struct ReceiveObserver {
  waiter: Arc<EventWaiter>,
  detector: Mutex<SilenceDetector>,
  silence_tripped: AtomicBool,
}

impl ConnectionObserver for ReceiveObserver {
  fn alerting(&self) {
    self.waiter.alerting();
  }
  fn connected(&self) {
    self.waiter.connected();
  }
  fn disconnected_physical(&self, cause: u16) {
    self.waiter.disconnected_physical(cause);
  }
  fn disconnected_logical(&self) {
    self.waiter.disconnected_logical();
  }
  fn dtmf_arrived(&self) {
    self.waiter.dtmf_arrived();
  }
  fn transmission_complete(&self) {
    self.waiter.transmission_complete();
  }
  fn send_slot_freed(&self) {
    self.waiter.send_slot_freed();
  }
  fn data_in(&self, payload: &[u8]) {
    if self.detector.lock().unwrap().feed(payload) {
      self.silence_tripped.store(true, Ordering::SeqCst);
    }
    self.waiter.data_in(payload);
  }
}

/// Record to `path` until silence exceeds `silence_limit_seconds`, `timeout`
/// elapses, DTMF arrives (if `abort_on_dtmf`), or the call is disconnected.
pub fn execute(
  conn: &Arc<Connection>,
  path: &Path,
  silence_limit_seconds: u32,
  abort_on_dtmf: bool,
  timeout: Duration,
) -> Result<ReceiveOutcome> {
  fail_if_already_disconnected(conn)?;
  if abort_on_dtmf && !conn.read_dtmf().is_empty() {
    return Ok(ReceiveOutcome { reason: ReceiveStopReason::AbortedByDtmf, bytes_written: 0 });
  }

  conn.start_receive_file()?;
  let waiter = EventWaiter::new();
  let observer = Arc::new(ReceiveObserver {
    waiter: waiter.clone(),
    detector: Mutex::new(SilenceDetector::new(silence_limit_seconds)),
    silence_tripped: AtomicBool::new(false),
  });
  conn.set_observer(observer.clone() as Arc<dyn ConnectionObserver>);
  let _scope = DetachOnDrop { conn };

  let deadline = Instant::now() + timeout;
  let reason = loop {
    if waiter.is_disconnected() {
      break ReceiveStopReason::Disconnected;
    }
    if abort_on_dtmf && waiter.dtmf_digit_count() > 0 {
      break ReceiveStopReason::AbortedByDtmf;
    }
    if observer.silence_tripped.load(Ordering::SeqCst) {
      break ReceiveStopReason::SilenceExceeded;
    }
    if !waiter.wait_tick(Some(deadline)) {
      break ReceiveStopReason::TimedOut;
    }
  };

  let recorded = conn.stop_receive_file().unwrap_or_default();
  let drop_tail = observer.detector.lock().unwrap().trailing_bytes_to_drop() as usize;
  let keep = recorded.len().saturating_sub(drop_tail);
  let mut file = File::create(path).map_err(|e| CapiError::External(format!("creating {}: {}", path.display(), e)))?;
  file
    .write_all(&recorded[..keep])
    .map_err(|e| CapiError::External(format!("writing {}: {}", path.display(), e)))?;

  Ok(ReceiveOutcome { reason, bytes_written: keep as u64 })
}

struct DetachOnDrop<'a> {
  conn: &'a Connection,
}
impl<'a> Drop for DetachOnDrop<'a> {
  fn drop(&mut self) {
    self.conn.clear_observer();
  }
}
