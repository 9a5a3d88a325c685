//! Outgoing module (§4.4): places a call on a controller and waits for it to
//! become usable. Unlike every other module this one has no pre-existing
//! `Connection` to work against — it builds one, registers it under a pseudo-PLCI,
//! and issues the CONNECT_REQ itself.
//!
//! Waiting has two phases: first, with no timeout at all, for the far side to
//! start alerting (or connect outright, or fail outright) — a call that never
//! even rings should not be charged against the caller's timeout. Once alerting
//! (or an earlier connect) is observed, the caller's `timeout` is armed for the
//! wait to `connected`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::capi::constants::cip;
use crate::capi::PartyNumber;
use crate::connection::{Connection, DisconnectMode, FaxParams, Service};
use crate::controller::Controller;
use crate::error::Result;
use crate::observer::ConnectionObserver;

use super::waiter::{self, EventWaiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingOutcome {
  Success,
  TimeoutExceeded,
  FailedWithCause(u16),
  FailedNoCause,
}

/// Place a call from `from` to `to`. `fax_station_id`/`fax_headline` are only used
/// when `service` is `FaxG3`; pass empty strings for voice calls.
pub fn execute(
  controller: &Controller,
  from: &str,
  to: &str,
  service: Service,
  fax_station_id: &str,
  fax_headline: &str,
  timeout: Duration,
) -> Result<(Arc<Connection>, OutgoingOutcome)> {
  let sender = controller.sender();
  let msg_nr = sender.next_msg_nr();
  let pseudo = crate::controller::pseudo_plci(msg_nr);
  let caller = PartyNumber { type_plan: 0x21, digits: from.as_bytes().to_vec() };
  let callee = PartyNumber { type_plan: 0x21, digits: to.as_bytes().to_vec() };

  let conn = Arc::new(Connection::new_outgoing(
    controller.controller_id(),
    pseudo,
    caller,
    callee,
    sender,
    controller.capability(),
  ));
  controller.register_outgoing(msg_nr, conn.clone());

  let w = EventWaiter::new();
  conn.set_observer(w.clone() as Arc<dyn ConnectionObserver>);

  let fax = FaxParams { station_id: fax_station_id.to_string(), headline: fax_headline.to_string() };
  let cip_value = match service {
    Service::Voice => cip::AUDIO_3_1K,
    Service::FaxG3 => cip::FAX_G3,
  };
  conn.place_call(cip_value, service, &fax)?;

  // Phase 1: wait without a deadline for the far side to start ringing, connect
  // outright, or fail outright.
  w.wait_until(None, |w| {
    waiter::is_alerting(w) || waiter::is_connected(w) || waiter::is_connect_failed(w) || waiter::is_disconnected_physical(w)
  });

  let outcome = if let Some(cause) = w.connect_failed_cause() {
    if cause == 0 { OutgoingOutcome::FailedNoCause } else { OutgoingOutcome::FailedWithCause(cause) }
  } else if waiter::is_connected(&w) {
    OutgoingOutcome::Success
  } else if let Some(cause) = w.disconnected_physical_cause() {
    if cause == 0 { OutgoingOutcome::FailedNoCause } else { OutgoingOutcome::FailedWithCause(cause) }
  } else {
    // Alerting: arm the caller's timeout and wait for `connected` or a failure.
    let deadline = Instant::now() + timeout;
    let settled = w.wait_until(Some(deadline), |w| {
      waiter::is_connected(w) || waiter::is_disconnected_physical(w) || waiter::is_connect_failed(w)
    });
    if !settled {
      let _ = conn.disconnect(DisconnectMode::All);
      w.wait_until(Some(Instant::now() + Duration::from_secs(5)), waiter::is_disconnected_physical);
      OutgoingOutcome::TimeoutExceeded
    } else if waiter::is_connected(&w) {
      OutgoingOutcome::Success
    } else if let Some(cause) = w.connect_failed_cause() {
      if cause == 0 { OutgoingOutcome::FailedNoCause } else { OutgoingOutcome::FailedWithCause(cause) }
    } else {
      match w.disconnected_physical_cause() {
        Some(0) | None => OutgoingOutcome::FailedNoCause,
        Some(cause) => OutgoingOutcome::FailedWithCause(cause),
      }
    }
  };

  conn.clear_observer();
  Ok((conn, outcome))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::capi::driver::fake::FakeDriver;
  use crate::capi::Message;
  use crate::controller::ControllerConfig;
  use std::thread;

  fn controller_with_fake() -> Controller {
    let mut fake = FakeDriver::default();
    fake.profile.b1_protocols = 0x1;
    fake.profile.b3_protocols = (1 << 4) | (1 << 5);
    let cfg = ControllerConfig {
      controller_id: 1,
      max_logical_connections: 2,
      max_b_data_blocks: 7,
      max_b_data_block_size: 2048,
      ddi: None,
    };
    Controller::new(Box::new(fake), cfg).unwrap()
  }

  /// `Controller::new` never consumes a message number itself, so the first
  /// CONNECT_REQ issued by a freshly built controller always carries `msg_nr == 1`
  /// and registers under `pseudo_plci(1)` — deterministic enough to drive from the
  /// test thread without a running reader loop.
  #[test]
  fn connect_conf_failure_resolves_to_failed_with_cause() {
    let controller = Arc::new(controller_with_fake());
    let controller2 = controller.clone();
    let driver = thread::spawn(move || {
      let key = crate::controller::pseudo_plci(1);
      let conn = loop {
        if let Some(conn) = controller2.lookup_for_test(key) {
          break conn;
        }
        thread::sleep(Duration::from_millis(5));
      };
      conn.on_message(&Message::ConnectConf { plci: conn.plci(), msg_nr: 1, info: 0x2001 });
    });

    let (_, outcome) = execute(&controller, "111", "222", Service::Voice, "", "", Duration::from_millis(500)).unwrap();
    driver.join().unwrap();
    assert_eq!(outcome, OutgoingOutcome::FailedWithCause(0x2001));
  }

  #[test]
  fn full_handshake_resolves_to_success() {
    let controller = Arc::new(controller_with_fake());
    let controller2 = controller.clone();
    let driver = thread::spawn(move || {
      let key = crate::controller::pseudo_plci(1);
      let conn = loop {
        if let Some(conn) = controller2.lookup_for_test(key) {
          break conn;
        }
        thread::sleep(Duration::from_millis(5));
      };
      let plci = 0x30001;
      conn.on_message(&Message::ConnectConf { plci, msg_nr: 1, info: 0 });
      conn.on_message(&Message::ConnectActiveInd { plci, msg_nr: 2 });
      let ncci = conn.ncci();
      conn.on_message(&Message::ConnectB3Ind { ncci, msg_nr: 3, ncpi: vec![] });
      conn.on_message(&Message::ConnectB3Conf { ncci, msg_nr: 4, info: 0 });
      conn.on_message(&Message::ConnectB3ActiveInd { ncci, msg_nr: 5, ncpi: vec![] });
    });

    let (conn, outcome) = execute(&controller, "111", "222", Service::Voice, "", "", Duration::from_secs(2)).unwrap();
    driver.join().unwrap();
    assert_eq!(outcome, OutgoingOutcome::Success);
    assert_eq!(conn.service(), Some(Service::Voice));
  }
}
