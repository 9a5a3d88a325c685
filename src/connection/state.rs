//! PLCI and NCCI state machines (CAPI 2.0 §7.2 naming).

/// Physical link state, tracked per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlciState {
  Idle,
  ReqPending,
  OutAlerting,
  Incoming,
  InAlerting,
  Active,
  Disconnecting,
  Terminal,
}

/// Logical (B3) connection state, tracked per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcciState {
  Idle,
  ReqPending,
  Accepting,
  ActivePending,
  Active,
  Disconnecting,
}

impl PlciState {
  pub fn is_terminal(self) -> bool {
    matches!(self, PlciState::Terminal)
  }
}

impl NcciState {
  pub fn is_active(self) -> bool {
    matches!(self, NcciState::Active)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn terminal_state_is_terminal() {
    assert!(PlciState::Terminal.is_terminal());
    assert!(!PlciState::Active.is_terminal());
  }
}
