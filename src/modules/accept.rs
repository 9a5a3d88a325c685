//! Accept module (§4.4): accepts a waiting incoming call and blocks until the B
//! channel comes up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::{Connection, FaxParams, Service};
use crate::error::{CapiError, Result};

use super::waiter::{self, EventWaiter};
use super::{fail_if_already_disconnected, ObserverScope};

/// Accept the waiting call as `service`, blocking until `connected` fires or the
/// call is disconnected first. `fax` is ignored for [`Service::Voice`].
pub fn execute(conn: &Arc<Connection>, service: Service, fax: &FaxParams, timeout: Duration) -> Result<()> {
  fail_if_already_disconnected(conn)?;
  let w = EventWaiter::new();
  let _scope = ObserverScope::bind(conn, &w);

  conn.accept(service, fax)?;

  let deadline = Instant::now() + timeout;
  let ready = w.wait_until(Some(deadline), |w| waiter::is_connected(w) || waiter::is_disconnected_either(w));
  if !ready {
    return Err(CapiError::ConnectionGone("accept: timed out waiting for connection".to_string()));
  }
  if waiter::is_disconnected_either(&w) {
    return Err(CapiError::ConnectionGone("accept: call disconnected before connecting".to_string()));
  }
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

  fn incoming() -> (Arc<Connection>, Arc<StubSender>) {
    let sender = Arc::new(StubSender { counter: AtomicU16::new(1), sent: Mutex::new(Vec::new()) });
    let conn = Arc::new(Connection::new_incoming(
      1,
      0x10001,
      1,
      PartyNumber { type_plan: 0x21, digits: b"4930123456".to_vec() },
      PartyNumber { type_plan: 0x21, digits: b"4930111".to_vec() },
      None,
      sender.clone(),
      ControllerCapability { transparent: true, fax: true, fax_extended: false, is_avm: false },
    ));
    (conn, sender)
  }

  #[test]
  fn accept_times_out_without_connect_active() {
    let (conn, _sender) = incoming();
    let err = execute(&conn, Service::Voice, &FaxParams::default(), Duration::from_millis(120));
    assert!(err.is_err());
  }

  #[test]
  fn accept_resolves_once_connected_fires() {
    let (conn, _sender) = incoming();
    let conn2 = conn.clone();
    std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(30));
      conn2.on_message(&Message::ConnectActiveInd { plci: conn2.plci(), msg_nr: 1 });
      let ncci = conn2.ncci();
      conn2.on_message(&Message::ConnectB3Ind { ncci, msg_nr: 2, ncpi: vec![] });
      conn2.on_message(&Message::ConnectB3Conf { ncci, msg_nr: 3, info: 0 });
      conn2.on_message(&Message::ConnectB3ActiveInd { ncci, msg_nr: 4, ncpi: vec![] });
    });
    execute(&conn, Service::Voice, &FaxParams::default(), Duration::from_secs(2)).unwrap();
  }
}
