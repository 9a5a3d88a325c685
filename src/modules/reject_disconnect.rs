//! Reject/Disconnect module (§4.4): chooses between `reject(cause)` and
//! `disconnect(mode)` depending on where the connection currently sits, and waits
//! for the physical leg to reach `terminal`. Tolerates a connection that is already
//! gone rather than treating it as a module failure — this is the one module the
//! spec explicitly asks to be forgiving about already-disconnected connections,
//! since it is commonly invoked from cleanup paths.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::{Connection, DisconnectMode, PlciState};
use crate::error::Result;

use super::waiter::{self, EventWaiter};
use super::ObserverScope;

/// Tear a connection down. If it is still in the `incoming` (waiting) state,
/// emits CONNECT_RESP with `cause`; otherwise issues `disconnect(mode)`. Either
/// way, blocks until `disconnected_physical` fires or `timeout` elapses.
pub fn execute(conn: &Arc<Connection>, cause: u16, mode: DisconnectMode, timeout: Duration) -> Result<()> {
  if conn.plci_state().is_terminal() {
    return Ok(());
  }
  let w = EventWaiter::new();
  let _scope = ObserverScope::bind(conn, &w);

  if conn.plci_state() == PlciState::Incoming {
    conn.reject(cause)?;
  } else {
    conn.disconnect(mode)?;
  }

  let deadline = Instant::now() + timeout;
  w.wait_until(Some(deadline), waiter::is_disconnected_physical);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::capi::{Message, PartyNumber};
  use crate::connection::ControllerCapability;
  use std::sync::atomic::{AtomicU16, Ordering};
  use std::sync::Mutex;

  struct StubSender {
    counter: AtomicU16,
    sent: Mutex<Vec<crate::capi::Request>>,
  }
  impl crate::connection::MessageSender for StubSender {
    fn next_msg_nr(&self) -> u16 {
      self.counter.fetch_add(1, Ordering::SeqCst)
    }
    fn send(&self, req: crate::capi::Request) -> Result<()> {
      self.sent.lock().unwrap().push(req);
      Ok(())
    }
  }

  fn incoming() -> Arc<Connection> {
    let sender = Arc::new(StubSender { counter: AtomicU16::new(1), sent: Mutex::new(Vec::new()) });
    Arc::new(Connection::new_incoming(
      1,
      0x10001,
      1,
      PartyNumber { type_plan: 0x21, digits: b"4930123456".to_vec() },
      PartyNumber::empty(),
      None,
      sender,
      ControllerCapability { transparent: true, fax: false, fax_extended: false, is_avm: false },
    ))
  }

  #[test]
  fn already_disconnected_connection_is_tolerated() {
    let conn = incoming();
    conn.on_message(&Message::DisconnectInd { plci: conn.plci(), msg_nr: 9, reason: 0x3490 });
    assert!(execute(&conn, 0x34A9, DisconnectMode::All, Duration::from_millis(100)).is_ok());
  }

  #[test]
  fn rejects_while_still_waiting() {
    let conn = incoming();
    let conn2 = conn.clone();
    std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(20));
      conn2.on_message(&Message::DisconnectInd { plci: conn2.plci(), msg_nr: 2, reason: 0x3490 });
    });
    execute(&conn, 0x34A9, DisconnectMode::All, Duration::from_secs(2)).unwrap();
  }
}
