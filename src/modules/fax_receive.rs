//! Fax-receive module (§4.4): records an incoming fax-G3 page stream until the
//! far side clears the B3 leg (`disconnected_logical`), a timeout, or a physical
//! disconnect. Unlike Audio-receive there is no silence detection or truncation —
//! fax pages have no concept of trailing silence.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::error::{CapiError, Result};

use super::waiter::{self, EventWaiter};
use super::{fail_if_already_disconnected, ObserverScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaxReceiveOutcome {
  Completed,
  DisconnectedPhysical,
  TimedOut,
}

pub struct FaxReceiveResult {
  pub outcome: FaxReceiveOutcome,
  pub bytes_written: u64,
}

pub fn execute(conn: &Arc<Connection>, path: &Path, timeout: Duration) -> Result<FaxReceiveResult> {
  fail_if_already_disconnected(conn)?;
  conn.start_receive_file()?;
  let w = EventWaiter::new();
  let _scope = ObserverScope::bind(conn, &w);

  let deadline = Instant::now() + timeout;
  let outcome = loop {
    if waiter::is_disconnected_physical(&w) {
      break FaxReceiveOutcome::DisconnectedPhysical;
    }
    if waiter::is_disconnected_logical(&w) {
      break FaxReceiveOutcome::Completed;
    }
    if !w.wait_tick(Some(deadline)) {
      break FaxReceiveOutcome::TimedOut;
    }
  };

  let recorded = conn.stop_receive_file().unwrap_or_default();
  let mut file = File::create(path).map_err(|e| CapiError::External(format!("creating {}: {}", path.display(), e)))?;
  file
    .write_all(&recorded)
    .map_err(|e| CapiError::External(format!("writing {}: {}", path.display(), e)))?;

  Ok(FaxReceiveResult { outcome, bytes_written: recorded.len() as u64 })
}
