//! The boundary between the connection engine and whatever drives a call: the
//! call modules (`modules`) implement `ConnectionObserver` to be notified of
//! asynchronous events, and the controller calls `IncomingCallHandler` once a
//! new call is fully identified.

use crate::connection::Connection;
use std::sync::Arc;

/// Per-call event sink. The reader task invokes these; implementations must not
/// block for long, since overlapping callbacks for other connections still need
/// to run promptly on the same thread.
pub trait ConnectionObserver: Send + Sync {
  /// INFO_IND(ALERTING) arrived while the PLCI is in `out_alerting`.
  fn alerting(&self) {}
  /// NCCI reached `active`: the B channel is usable.
  fn connected(&self) {}
  /// CONNECT_CONF returned a non-zero info code: the outgoing call never left
  /// `req_pending`. Distinct from `disconnected_physical`, which presumes the PLCI
  /// reached `terminal` through a DISCONNECT_IND.
  fn connect_failed(&self, _cause: u16) {}
  /// PLCI reached `terminal`: the physical call ended.
  fn disconnected_physical(&self, cause: u16) {}
  /// NCCI returned to `idle` without chaining into a physical disconnect.
  fn disconnected_logical(&self) {}
  /// A DATA_B3_IND payload arrived (before DATA_B3_RESP is sent).
  fn data_in(&self, _payload: &[u8]) {}
  /// One or more DTMF digits were appended to the buffer.
  fn dtmf_arrived(&self) {}
  /// The send window drained after the source file was exhausted.
  fn transmission_complete(&self) {}
  /// A DATA_B3_CONF freed a ring slot; send modules use this to wake promptly and
  /// refill rather than waiting out a full poll tick.
  fn send_slot_freed(&self) {}
}

/// Application boundary: receives fully-identified incoming calls.
pub trait IncomingCallHandler: Send + Sync {
  fn call_waiting(&self, connection: Arc<Connection>);
}
