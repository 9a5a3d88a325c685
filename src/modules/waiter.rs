//! The completion-flag/`Condvar` plumbing every call module waits on.
//!
//! The reader task fires [`crate::observer::ConnectionObserver`] callbacks; a call
//! module's thread blocks on those callbacks via `Condvar::wait_timeout`, polling
//! at the cadence named in §5 so the module can also notice a deadline without a
//! dedicated timer thread. One `EventWaiter` is bound to exactly one connection for
//! the duration of one module's `execute`.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::observer::ConnectionObserver;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct WaiterState {
  alerting: bool,
  connected: bool,
  connect_failed: Option<u16>,
  disconnected_physical: Option<u16>,
  disconnected_logical: bool,
  dtmf_digit_count: usize,
}

/// Binds to one connection's observer slot and lets a call module block on any
/// combination of the events named in §4.3/§4.4.
pub struct EventWaiter {
  state: Mutex<WaiterState>,
  condvar: Condvar,
}

impl EventWaiter {
  pub fn new() -> Arc<EventWaiter> {
    Arc::new(EventWaiter { state: Mutex::new(WaiterState::default()), condvar: Condvar::new() })
  }

  fn notify(&self) {
    self.condvar.notify_all();
  }

  pub fn dtmf_digit_count(&self) -> usize {
    self.state.lock().unwrap().dtmf_digit_count
  }

  pub fn is_disconnected(&self) -> bool {
    let s = self.state.lock().unwrap();
    s.disconnected_physical.is_some() || s.disconnected_logical
  }

  pub fn disconnected_physical_cause(&self) -> Option<u16> {
    self.state.lock().unwrap().disconnected_physical
  }

  pub fn connect_failed_cause(&self) -> Option<u16> {
    self.state.lock().unwrap().connect_failed
  }

  /// Block until `predicate` is true or `deadline` passes. Returns whether the
  /// predicate became true (`true`) or the wait timed out (`false`). `deadline =
  /// None` waits with no timeout at all, matching "Outgoing" waiting for `alerting`
  /// before its user timer is armed.
  pub fn wait_until(&self, deadline: Option<Instant>, mut predicate: impl FnMut(&EventWaiter) -> bool) -> bool {
    if predicate(self) {
      return true;
    }
    let mut guard = self.state.lock().unwrap();
    loop {
      if predicate(self) {
        return true;
      }
      let slice = match deadline {
        None => POLL_INTERVAL,
        Some(dl) => {
          let now = Instant::now();
          if now >= dl {
            return predicate(self);
          }
          POLL_INTERVAL.min(dl - now)
        }
      };
      let (g, _timeout) = self.condvar.wait_timeout(guard, slice).unwrap();
      guard = g;
    }
  }

  /// Sleep for one poll tick (or until `deadline`, if sooner), waking early on any
  /// event. Returns `false` once `deadline` has passed, `true` otherwise. Used by
  /// modules (audio send/receive) that must react to more than one condition on
  /// every wake-up rather than a single boolean predicate.
  pub fn wait_tick(&self, deadline: Option<Instant>) -> bool {
    let guard = self.state.lock().unwrap();
    let slice = match deadline {
      None => POLL_INTERVAL,
      Some(dl) => {
        let now = Instant::now();
        if now >= dl {
          return false;
        }
        POLL_INTERVAL.min(dl - now)
      }
    };
    let _ = self.condvar.wait_timeout(guard, slice).unwrap();
    match deadline {
      None => true,
      Some(dl) => Instant::now() < dl,
    }
  }
}

impl ConnectionObserver for EventWaiter {
  fn alerting(&self) {
    self.state.lock().unwrap().alerting = true;
    self.notify();
  }
  fn connected(&self) {
    self.state.lock().unwrap().connected = true;
    self.notify();
  }
  fn connect_failed(&self, cause: u16) {
    self.state.lock().unwrap().connect_failed = Some(cause);
    self.notify();
  }
  fn disconnected_physical(&self, cause: u16) {
    self.state.lock().unwrap().disconnected_physical = Some(cause);
    self.notify();
  }
  fn disconnected_logical(&self) {
    self.state.lock().unwrap().disconnected_logical = true;
    self.notify();
  }
  fn dtmf_arrived(&self) {
    self.state.lock().unwrap().dtmf_digit_count += 1;
    self.notify();
  }
  fn send_slot_freed(&self) {
    self.notify();
  }
}

pub fn is_alerting(w: &EventWaiter) -> bool {
  w.state.lock().unwrap().alerting
}
pub fn is_connected(w: &EventWaiter) -> bool {
  w.state.lock().unwrap().connected
}
pub fn is_connect_failed(w: &EventWaiter) -> bool {
  w.state.lock().unwrap().connect_failed.is_some()
}
pub fn is_disconnected_physical(w: &EventWaiter) -> bool {
  w.state.lock().unwrap().disconnected_physical.is_some()
}
pub fn is_disconnected_logical(w: &EventWaiter) -> bool {
  w.state.lock().unwrap().disconnected_logical
}
pub fn is_disconnected_either(w: &EventWaiter) -> bool {
  is_disconnected_physical(w) || is_disconnected_logical(w)
}
