//! Fax-send module (§4.4): streams an SFF (or Color-JPEG) file over an already
//! negotiated fax-G3 B channel until the send window has drained past EOF. Shares
//! the send window mechanics with Audio-send but has no DTMF/silence concerns of
//! its own.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::send_window::BLOCK_SIZE;
use crate::connection::Connection;
use crate::error::{CapiError, Result};

use super::waiter::{self, EventWaiter};
use super::{fail_if_already_disconnected, ObserverScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaxSendOutcome {
  Completed,
  Disconnected,
  TimedOut,
}

pub fn execute(conn: &Arc<Connection>, path: &Path, timeout: Duration) -> Result<FaxSendOutcome> {
  fail_if_already_disconnected(conn)?;
  let mut file =
    File::open(path).map_err(|e| CapiError::External(format!("opening {}: {}", path.display(), e)))?;

  conn.begin_send()?;
  let w = EventWaiter::new();
  let _scope = ObserverScope::bind(conn, &w);

  let deadline = Instant::now() + timeout;
  let mut eof = false;
  let outcome = loop {
    while !eof && conn.send_window_has_capacity() {
      let mut buf = vec![0u8; BLOCK_SIZE];
      let n = file.read(&mut buf).map_err(|e| CapiError::External(format!("reading {}: {}", path.display(), e)))?;
      if n == 0 {
        eof = true;
        break;
      }
      buf.truncate(n);
      conn.push_send_block(buf)?;
    }

    if waiter::is_disconnected_either(&w) {
      break FaxSendOutcome::Disconnected;
    }
    // `eof && used == 0` is the only valid completion signal: the window can
    // legitimately empty mid-file between a burst of DATA_B3_CONF on the reader
    // task and this thread's next refill, so `transmission_complete` (a one-shot
    // latch set from that same "window emptied" condition) can't be trusted here.
    if eof && conn.send_window_used() == 0 {
      break FaxSendOutcome::Completed;
    }
    if !w.wait_tick(Some(deadline)) {
      break FaxSendOutcome::TimedOut;
    }
  };

  Ok(outcome)
}
