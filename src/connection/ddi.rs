//! Reconstructs a direct-dial-in callee number from a stream of INFO_IND
//! called-party-number elements, for controllers configured with `ddi_length > 0`.
//!
//! `base_length` is carried through from configuration for parity with the source's
//! `DDIBaseLength`, but completion is judged purely on the accumulated extension
//! digits, matching the worked example: a 7-digit base length together with a
//! 3-digit DDI completes as soon as 3 digits have arrived, not 10.

/// Configuration a controller applies to every connection's accumulator.
#[derive(Debug, Clone)]
pub struct DdiConfig {
  pub length: usize,
  pub base_length: usize,
  pub stop_numbers: Vec<String>,
}

/// Accumulates digits appended by successive INFO_IND elements.
#[derive(Debug, Clone)]
pub struct DdiAccumulator {
  config: DdiConfig,
  digits: String,
}

impl DdiAccumulator {
  pub fn new(config: DdiConfig) -> DdiAccumulator {
    DdiAccumulator { config, digits: String::new() }
  }

  /// Append newly received digits. Returns `Some(full_number)` the first time
  /// completion criteria are met; returns `None` (and is a no-op) afterwards.
  pub fn append(&mut self, more: &str) -> Option<String> {
    if self.is_complete() {
      return None;
    }
    self.digits.push_str(more);
    if self.is_complete() {
      return Some(self.digits.clone());
    }
    None
  }

  fn is_complete(&self) -> bool {
    self.digits.len() >= self.config.length
      || self.config.stop_numbers.iter().any(|stop| self.digits.ends_with(stop.as_str()))
  }

  pub fn accumulated(&self) -> &str {
    &self.digits
  }
}
