//! Audio-send module (§4.4): streams a file of bit-reversed A-law audio to the B
//! channel through the connection's send window, stopping on exhaustion, DTMF (if
//! `abort_on_dtmf`), disconnect, or a hard timeout.

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
pub enum SendStopReason {
  Completed,
  AbortedByDtmf,
  Disconnected,
  TimedOut,
}

pub struct SendOutcome {
  pub reason: SendStopReason,
  pub elapsed: Duration,
}

/// Stream `path` onto the B channel. Returns immediately with
/// [`SendStopReason::AbortedByDtmf`] and zero elapsed time if DTMF digits are
/// already pending and `abort_on_dtmf` is set, without ever starting the send.
pub fn execute(conn: &Arc<Connection>, path: &Path, abort_on_dtmf: bool, timeout: Duration) -> Result<SendOutcome> {
  fail_if_already_disconnected(conn)?;
  if abort_on_dtmf && !conn.read_dtmf().is_empty() {
    return Ok(SendOutcome { reason: SendStopReason::AbortedByDtmf, elapsed: Duration::ZERO });
  }

  let mut file =
    File::open(path).map_err(|e| CapiError::External(format!("opening {}: {}", path.display(), e)))?;

  conn.begin_send()?;
  let w = EventWaiter::new();
  let _scope = ObserverScope::bind(conn, &w);

  let start = Instant::now();
  let deadline = start + timeout;
  let mut eof = false;
  let reason = loop {
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
      break SendStopReason::Disconnected;
    }
    if abort_on_dtmf && w.dtmf_digit_count() > 0 {
      break SendStopReason::AbortedByDtmf;
    }
    // `eof && used == 0` is the only valid completion signal: the window can
    // legitimately empty mid-file between a burst of DATA_B3_CONF on the reader
    // task and this thread's next refill, so `transmission_complete` (a one-shot
    // latch set from that same "window emptied" condition) can't be trusted here.
    if eof && conn.send_window_used() == 0 {
      break SendStopReason::Completed;
    }
    if !w.wait_tick(Some(deadline)) {
      break SendStopReason::TimedOut;
    }
  };

  Ok(SendOutcome { reason, elapsed: start.elapsed() })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::capi::{Message, PartyNumber, Request};
  use crate::connection::{ControllerCapability, FaxParams, Service};
  use std::io::Write;
  use std::sync::atomic::{AtomicU16, Ordering};
  use std::sync::Mutex;

  struct StubSender {
    counter: AtomicU16,
    sent: Mutex<Vec<Request>>,
  }
  impl crate::connection::MessageSender for StubSender {
    fn next_msg_nr(&self) -> u16 {
      self.counter.fetch_add(1, Ordering::SeqCst)
    }
    fn send(&self, req: Request) -> Result<()> {
      self.sent.lock().unwrap().push(req);
      Ok(())
    }
  }

  fn up_call() -> (Arc<Connection>, Arc<StubSender>) {
    let sender = Arc::new(StubSender { counter: AtomicU16::new(1), sent: Mutex::new(Vec::new()) });
    let conn = Arc::new(Connection::new_incoming(
      1,
      0x10001,
      1,
      PartyNumber::empty(),
      PartyNumber::empty(),
      None,
      sender.clone(),
      ControllerCapability { transparent: true, fax: false, fax_extended: false, is_avm: false },
    ));
    conn.accept(Service::Voice, &FaxParams::default()).unwrap();
    conn.on_message(&Message::ConnectActiveInd { plci: conn.plci(), msg_nr: 1 });
    let ncci = conn.ncci();
    conn.on_message(&Message::ConnectB3Ind { ncci, msg_nr: 2, ncpi: vec![] });
    conn.on_message(&Message::ConnectB3Conf { ncci, msg_nr: 3, info: 0 });
    conn.on_message(&Message::ConnectB3ActiveInd { ncci, msg_nr: 4, ncpi: vec![] });
    (conn, sender)
  }

  /// Drains DATA_B3_REQ off the sender and confirms them as soon as they appear,
  /// simulating the driver/reader loop, until `conn`'s window is empty and the
  /// source is exhausted.
  fn auto_confirm(conn: Arc<Connection>, sender: Arc<StubSender>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
      let mut next_idx = 0;
      loop {
        std::thread::sleep(Duration::from_millis(5));
        let pending: Vec<(u32, u16)> = {
          let sent = sender.sent.lock().unwrap();
          sent[next_idx..]
            .iter()
            .filter_map(|r| match r {
              Request::DataB3Req { ncci, handle, .. } => Some((*ncci, *handle)),
              _ => None,
            })
            .collect()
        };
        next_idx = sender.sent.lock().unwrap().len();
        for (ncci, handle) in pending {
          conn.on_message(&Message::DataB3Conf { ncci, msg_nr: 1, handle, info: 0 });
        }
        if conn.send_window_used() == 0 && next_idx > 0 {
          break;
        }
      }
    })
  }

  #[test]
  fn sends_a_small_file_to_completion() {
    let (conn, sender) = up_call();
    let mut tmp = tempfile_with(b"hello world");
    let auto = {
      let conn2 = conn.clone();
      let sender2 = sender.clone();
      std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(10));
        auto_confirm(conn2, sender2).join().unwrap();
      })
    };
    let outcome = execute(&conn, tmp.path(), false, Duration::from_secs(2)).unwrap();
    auto.join().unwrap();
    assert_eq!(outcome.reason, SendStopReason::Completed);
    tmp.flush_noop();
  }

  /// Confirms every `DataB3Req` it observes, without ever assuming the window
  /// emptying means the file is exhausted — it stops only once `expected_blocks`
  /// confirmations have gone out, so it keeps draining a multi-batch send even
  /// through a transient empty window partway through the file.
  fn auto_confirm_until(conn: Arc<Connection>, sender: Arc<StubSender>, expected_blocks: usize) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
      let mut next_idx = 0;
      let mut confirmed = 0usize;
      while confirmed < expected_blocks {
        std::thread::sleep(Duration::from_millis(2));
        let pending: Vec<(u32, u16)> = {
          let sent = sender.sent.lock().unwrap();
          sent[next_idx..]
            .iter()
            .filter_map(|r| match r {
              Request::DataB3Req { ncci, handle, .. } => Some((*ncci, *handle)),
              _ => None,
            })
            .collect()
        };
        next_idx = sender.sent.lock().unwrap().len();
        for (ncci, handle) in pending {
          conn.on_message(&Message::DataB3Conf { ncci, msg_nr: 1, handle, info: 0 });
          confirmed += 1;
        }
      }
    })
  }

  #[test]
  fn sends_a_multi_batch_file_without_truncating_when_the_window_drains_mid_file() {
    let (conn, sender) = up_call();
    // More than `INFLIGHT_TARGET` (4) blocks: the first batch of 4 can be fully
    // confirmed, emptying the window, while the fifth block's bytes are still
    // unread on disk — exactly the state a stale `transmission_complete` latch
    // would misreport as done.
    let content: Vec<u8> = (0..(4 * BLOCK_SIZE + 100)).map(|i| (i % 251) as u8).collect();
    let tmp = tempfile_with(&content);
    let expected_blocks = 5;
    let auto = auto_confirm_until(conn.clone(), sender.clone(), expected_blocks);
    let outcome = execute(&conn, tmp.path(), false, Duration::from_secs(5)).unwrap();
    auto.join().unwrap();
    assert_eq!(outcome.reason, SendStopReason::Completed);

    let delivered: Vec<u8> = sender
      .sent
      .lock()
      .unwrap()
      .iter()
      .filter_map(|r| match r {
        Request::DataB3Req { data, .. } => Some(data.clone()),
        _ => None,
      })
      .flatten()
      .collect();
    assert_eq!(delivered, content);
  }

  #[test]
  fn abort_on_dtmf_returns_immediately_if_digits_already_pending() {
    let (conn, _sender) = up_call();
    conn.on_message(&Message::FacilityIndDtmf { plci: conn.plci(), msg_nr: 5, digits: b"1".to_vec() });
    let tmp = tempfile_with(b"data");
    let outcome = execute(&conn, tmp.path(), true, Duration::from_secs(2)).unwrap();
    assert_eq!(outcome.reason, SendStopReason::AbortedByDtmf);
    assert_eq!(outcome.elapsed, Duration::ZERO);
  }

  struct TempFile(std::path::PathBuf);
  impl TempFile {
    fn path(&self) -> &Path {
      &self.0
    }
    fn flush_noop(&mut self) {}
  }
  impl Drop for TempFile {
    fn drop(&mut self) {
      let _ = std::fs::remove_file(&self.0);
    }
  }
  fn tempfile_with(data: &[u8]) -> TempFile {
    let path = std::env::temp_dir().join(format!("capid-test-{}-{:?}", std::process::id(), std::thread::current().id()));
    let mut f = File::create(&path).unwrap();
    f.write_all(data).unwrap();
    TempFile(path)
  }
}
