//! The outbound DATA_B3 ring: up to seven in-flight 2048-byte buffers.
//!
//! Mutated from both the call task (priming/refilling from the source file) and the
//! reader task (advancing on DATA_B3_CONF), always under the connection's send lock.

pub const RING_SIZE: usize = 7;
pub const BLOCK_SIZE: usize = 2048;
pub const INFLIGHT_TARGET: usize = 4;

pub struct SendWindow {
  buffers: Vec<Vec<u8>>,
  head: usize,
  used: usize,
}

impl SendWindow {
  pub fn new() -> SendWindow {
    SendWindow { buffers: vec![Vec::new(); RING_SIZE], head: 0, used: 0 }
  }

  pub fn used(&self) -> usize {
    self.used
  }

  pub fn is_full(&self) -> bool {
    self.used >= RING_SIZE
  }

  pub fn has_capacity_for_inflight_target(&self) -> bool {
    self.used < INFLIGHT_TARGET
  }

  /// Place a new outbound block at the tail of the window. Returns its ring slot
  /// (the DATA_B3 data-handle) or `None` if the window is already full.
  pub fn push(&mut self, data: Vec<u8>) -> Option<usize> {
    if self.is_full() {
      return None;
    }
    let slot = (self.head + self.used) % RING_SIZE;
    self.buffers[slot] = data;
    self.used += 1;
    Some(slot)
  }

  /// Acknowledge the block at `head` on DATA_B3_CONF. Returns an error string if
  /// the confirmed handle isn't the current head (a protocol violation).
  pub fn confirm(&mut self, handle: usize) -> Result<(), String> {
    if self.used == 0 {
      return Err("DATA_B3_CONF with no outstanding blocks".to_string());
    }
    if handle != self.head {
      return Err(format!("DATA_B3_CONF for handle {} but head is {}", handle, self.head));
    }
    self.buffers[self.head] = Vec::new();
    self.head = (self.head + 1) % RING_SIZE;
    self.used -= 1;
    Ok(())
  }

  /// DISCONNECT_B3_IND arrived: the driver issues no further confirmations for
  /// buffers still in flight. Drop them silently.
  pub fn reset_on_disconnect(&mut self) {
    self.used = 0;
    self.head = 0;
    for b in self.buffers.iter_mut() {
      b.clear();
    }
  }
}

impl Default for SendWindow {
  fn default() -> SendWindow {
    SendWindow::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn push_fills_up_to_ring_size() {
    let mut w = SendWindow::new();
    for _ in 0..RING_SIZE {
      assert!(w.push(vec![0]).is_some());
    }
    assert!(w.push(vec![0]).is_none());
    assert!(w.is_full());
  }

  #[test]
  fn confirm_advances_head_and_frees_a_slot() {
    let mut w = SendWindow::new();
    let h0 = w.push(vec![1]).unwrap();
    w.push(vec![2]).unwrap();
    w.confirm(h0).unwrap();
    assert_eq!(w.used(), 1);
    assert!(w.push(vec![3]).is_some());
  }

  #[test]
  fn confirm_for_non_head_handle_is_an_error() {
    let mut w = SendWindow::new();
    w.push(vec![1]).unwrap();
    w.push(vec![2]).unwrap();
    assert!(w.confirm(1).is_err());
  }

  #[test]
  fn disconnect_drops_inflight_silently() {
    let mut w = SendWindow::new();
    w.push(vec![1]).unwrap();
    w.push(vec![2]).unwrap();
    w.reset_on_disconnect();
    assert_eq!(w.used(), 0);
  }
}
