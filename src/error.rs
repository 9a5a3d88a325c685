//! Error taxonomy for the CAPI protocol engine.
//!
//! A single typed enum covers every failure kind so call sites propagate with `?`
//! and the application boundary can match on the kind without string-sniffing.

use std::fmt;

/// The five error kinds the engine distinguishes: driver / protocol / external /
/// connection-gone / configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapiError {
  /// A non-zero CAPI info code returned by a send or retrieve operation.
  Driver(u16),
  /// A message arrived in a PLCI/NCCI state that has no transition for it.
  Protocol(String),
  /// Caller-side misuse: bad path, unsupported service, empty number, cause 0, ...
  External(String),
  /// The operation's target connection no longer permits it (checked at entry only).
  ConnectionGone(String),
  /// A configuration file or value could not be parsed.
  Configuration(String),
}

impl fmt::Display for CapiError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CapiError::Driver(info) => write!(f, "CAPI driver error: info=0x{:04x}", info),
      CapiError::Protocol(msg) => write!(f, "protocol error: {}", msg),
      CapiError::External(msg) => write!(f, "invalid request: {}", msg),
      CapiError::ConnectionGone(msg) => write!(f, "connection gone: {}", msg),
      CapiError::Configuration(msg) => write!(f, "configuration error: {}", msg),
    }
  }
}

impl std::error::Error for CapiError {}

impl CapiError {
  /// True for errors a protocol-level caller should treat as "the call is over",
  /// as opposed to a simple bad request that leaves the connection untouched.
  pub fn is_fatal_to_connection(&self) -> bool {
    matches!(self, CapiError::Protocol(_) | CapiError::Driver(_))
  }
}

pub type Result<T> = std::result::Result<T, CapiError>;
