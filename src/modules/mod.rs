//! Call modules: short-lived, single-purpose controllers that drive one connection
//! through a single high-level operation (§4.4). Each module binds an [`EventWaiter`]
//! as the connection's observer for the duration of its `execute`, runs to
//! completion or timeout on the calling thread, and detaches (clears the observer)
//! before returning. None of these spawn their own thread — the scripting boundary
//! (`scripting::CallHandler`) already runs each call's handler on its own thread, so
//! call modules simply block that thread.

pub mod accept;
pub mod audio_receive;
pub mod audio_send;
pub mod fax_receive;
pub mod fax_send;
pub mod outgoing;
pub mod read_dtmf;
pub mod reject_disconnect;
pub mod switch_to_fax;
pub mod waiter;

use std::sync::Arc;

use crate::connection::Connection;
use crate::error::{CapiError, Result};
use waiter::EventWaiter;

/// "disconnect that has already occurred before `execute` begins is an immediate
/// failure" (§4.4) — every module calls this before doing anything else.
fn fail_if_already_disconnected(conn: &Connection) -> Result<()> {
  if conn.plci_state().is_terminal() {
    return Err(CapiError::ConnectionGone("connection already disconnected".to_string()));
  }
  Ok(())
}

/// Installs `waiter` as `conn`'s observer for the scope of a module's `execute`,
/// restoring `None` on drop so the next module (or nothing) owns the slot.
struct ObserverScope<'a> {
  conn: &'a Connection,
}

impl<'a> ObserverScope<'a> {
  fn bind(conn: &'a Connection, waiter: &Arc<EventWaiter>) -> ObserverScope<'a> {
    conn.set_observer(waiter.clone() as Arc<dyn crate::observer::ConnectionObserver>);
    ObserverScope { conn }
  }
}

impl<'a> Drop for ObserverScope<'a> {
  fn drop(&mut self) {
    self.conn.clear_observer();
  }
}
