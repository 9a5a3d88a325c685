//! Read-DTMF module (§4.4, scenario 5): accumulates DTMF digits already enabled on
//! the connection (`enable_dtmf`/`FACILITY_REQ`) until `max_digits` is reached,
//! `min_digits` is reached and the per-digit idle timer elapses with no further
//! digit, or the call disconnects. Each new digit resets the idle timer; only
//! `max_digits` is a hard cap independent of idle time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::error::Result;

use super::waiter::{self, EventWaiter};
use super::{fail_if_already_disconnected, ObserverScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfStopReason {
  MaxDigitsReached,
  IdleAfterMinDigits,
  Disconnected,
  TimedOut,
}

pub struct DtmfResult {
  pub reason: DtmfStopReason,
  pub digits: String,
}

/// Wait for DTMF on `conn`. `min_digits`/`max_digits` bound the accumulated count;
/// `idle_timeout` is how long to wait after the last digit (or after entry, if none
/// have arrived yet) once `min_digits` has been satisfied; `overall_timeout` is a
/// hard ceiling independent of digit activity.
pub fn execute(
  conn: &Arc<Connection>,
  min_digits: usize,
  max_digits: usize,
  idle_timeout: Duration,
  overall_timeout: Duration,
) -> Result<DtmfResult> {
  fail_if_already_disconnected(conn)?;
  conn.clear_dtmf();

  let w = EventWaiter::new();
  let _scope = ObserverScope::bind(conn, &w);
  conn.enable_dtmf()?;

  let overall_deadline = Instant::now() + overall_timeout;
  let mut last_seen_count = 0usize;
  let mut idle_deadline = Instant::now() + idle_timeout;

  let reason = loop {
    let count = w.dtmf_digit_count();
    if count >= max_digits && max_digits > 0 {
      break DtmfStopReason::MaxDigitsReached;
    }
    if waiter::is_disconnected_either(&w) {
      break DtmfStopReason::Disconnected;
    }
    if count > last_seen_count {
      last_seen_count = count;
      idle_deadline = Instant::now() + idle_timeout;
    }
    if count >= min_digits && Instant::now() >= idle_deadline {
      break DtmfStopReason::IdleAfterMinDigits;
    }
    // The idle clock only matters once `min_digits` is satisfied; before that,
    // bound the wait solely by the overall deadline so a quiet line doesn't spin.
    let tick_deadline = if count >= min_digits { overall_deadline.min(idle_deadline) } else { overall_deadline };
    if !w.wait_tick(Some(tick_deadline)) && Instant::now() >= overall_deadline {
      break DtmfStopReason::TimedOut;
    }
  };

  let _ = conn.disable_dtmf();
  Ok(DtmfResult { reason, digits: conn.read_dtmf() })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::capi::{Message, PartyNumber, Request};
  use crate::connection::ControllerCapability;
  use std::sync::atomic::{AtomicU16, Ordering};

  struct StubSender {
    counter: AtomicU16,
  }
  impl crate::connection::MessageSender for StubSender {
    fn next_msg_nr(&self) -> u16 {
      self.counter.fetch_add(1, Ordering::SeqCst)
    }
    fn send(&self, _req: Request) -> Result<()> {
      Ok(())
    }
  }

  fn connected_call() -> Arc<Connection> {
    let sender = Arc::new(StubSender { counter: AtomicU16::new(1) });
    Arc::new(Connection::new_incoming(
      1,
      0x10001,
      1,
      PartyNumber::empty(),
      PartyNumber::empty(),
      None,
      sender,
      ControllerCapability { transparent: true, fax: false, fax_extended: false, is_avm: false },
    ))
  }

  #[test]
  fn stops_at_max_digits() {
    let conn = connected_call();
    let plci = conn.plci();
    let conn2 = conn.clone();
    std::thread::spawn(move || {
      for (i, d) in b"1234".iter().enumerate() {
        std::thread::sleep(Duration::from_millis(10));
        conn2.on_message(&Message::FacilityIndDtmf { plci, msg_nr: i as u16 + 2, digits: vec![*d] });
      }
    });
    let result = execute(&conn, 1, 4, Duration::from_secs(1), Duration::from_secs(5)).unwrap();
    assert_eq!(result.reason, DtmfStopReason::MaxDigitsReached);
    assert_eq!(result.digits, "1234");
  }

  #[test]
  fn stops_on_idle_once_min_digits_reached() {
    let conn = connected_call();
    let plci = conn.plci();
    let conn2 = conn.clone();
    std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(10));
      conn2.on_message(&Message::FacilityIndDtmf { plci, msg_nr: 2, digits: b"5".to_vec() });
    });
    let result = execute(&conn, 1, 10, Duration::from_millis(150), Duration::from_secs(5)).unwrap();
    assert_eq!(result.reason, DtmfStopReason::IdleAfterMinDigits);
    assert_eq!(result.digits, "5");
  }

  #[test]
  fn times_out_overall_if_min_digits_never_reached() {
    let conn = connected_call();
    let result = execute(&conn, 3, 10, Duration::from_secs(5), Duration::from_millis(150)).unwrap();
    assert_eq!(result.reason, DtmfStopReason::TimedOut);
    assert_eq!(result.digits, "");
  }
}
