//! Switch-to-fax module (§4.4): live B-protocol switch from an active voice call
//! to fax-G3 on the same PLCI. `disconnect(logical_only)`, wait for
//! `disconnected_logical`; `change_protocol(fax_g3, ...)`, wait for `connected`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::{Connection, DisconnectMode, FaxParams, Service};
use crate::error::{CapiError, Result};

use super::waiter::{self, EventWaiter};
use super::{fail_if_already_disconnected, ObserverScope};

pub fn execute(conn: &Arc<Connection>, fax_station_id: &str, fax_headline: &str, timeout: Duration) -> Result<()> {
  fail_if_already_disconnected(conn)?;
  let fax = FaxParams { station_id: fax_station_id.to_string(), headline: fax_headline.to_string() };
  let deadline = Instant::now() + timeout;

  {
    let w = EventWaiter::new();
    let _scope = ObserverScope::bind(conn, &w);
    conn.disconnect(DisconnectMode::LogicalOnly)?;
    let ok = w.wait_until(Some(deadline), |w| waiter::is_disconnected_logical(w) || waiter::is_disconnected_physical(w));
    if !ok {
      return Err(CapiError::ConnectionGone("switch_to_fax: timed out tearing down the B3 leg".to_string()));
    }
    if waiter::is_disconnected_physical(&w) {
      return Err(CapiError::ConnectionGone("switch_to_fax: call disconnected during logical teardown".to_string()));
    }
  }

  let w = EventWaiter::new();
  let _scope = ObserverScope::bind(conn, &w);
  conn.change_protocol(Service::FaxG3, &fax)?;
  let ok = w.wait_until(Some(deadline), |w| waiter::is_connected(w) || waiter::is_disconnected_physical(w));
  if !ok {
    return Err(CapiError::ConnectionGone("switch_to_fax: timed out renegotiating B3".to_string()));
  }
  if waiter::is_disconnected_physical(&w) {
    return Err(CapiError::ConnectionGone("switch_to_fax: call disconnected while renegotiating".to_string()));
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

  fn active_voice_call() -> (Arc<Connection>, Arc<StubSender>) {
    let sender = Arc::new(StubSender { counter: AtomicU16::new(1), sent: Mutex::new(Vec::new()) });
    let conn = Arc::new(Connection::new_incoming(
      1,
      0x10001,
      1,
      PartyNumber { type_plan: 0x21, digits: b"4930123456".to_vec() },
      PartyNumber::empty(),
      None,
      sender.clone(),
      ControllerCapability { transparent: true, fax: true, fax_extended: false, is_avm: false },
    ));
    conn.accept(Service::Voice, &FaxParams::default()).unwrap();
    conn.on_message(&Message::ConnectActiveInd { plci: conn.plci(), msg_nr: 1 });
    let ncci = conn.ncci();
    conn.on_message(&Message::ConnectB3Ind { ncci, msg_nr: 2, ncpi: vec![] });
    conn.on_message(&Message::ConnectB3Conf { ncci, msg_nr: 3, info: 0 });
    conn.on_message(&Message::ConnectB3ActiveInd { ncci, msg_nr: 4, ncpi: vec![] });
    (conn, sender)
  }

  #[test]
  fn switch_sequences_logical_teardown_then_reconnect() {
    let (conn, _sender) = active_voice_call();
    let conn2 = conn.clone();
    std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(20));
      let ncci = conn2.ncci();
      conn2.on_message(&Message::DisconnectB3Ind { ncci, msg_nr: 5, reason_b3: 0, ncpi: vec![] });
      std::thread::sleep(Duration::from_millis(20));
      conn2.on_message(&Message::ConnectB3Ind { ncci, msg_nr: 6, ncpi: vec![] });
      conn2.on_message(&Message::ConnectB3Conf { ncci, msg_nr: 7, info: 0 });
      conn2.on_message(&Message::ConnectB3ActiveInd { ncci, msg_nr: 8, ncpi: vec![] });
    });
    execute(&conn, "0123", "hdr", Duration::from_secs(2)).unwrap();
    assert_eq!(conn.service(), Some(Service::FaxG3));
  }
}
