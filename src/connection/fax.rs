//! Fax metadata, decoded from the NCPI trailer at both CONNECT_B3_ACTIVE_IND
//! (connect-time) and DISCONNECT_B3_IND (final). Re-exported under a connection-facing
//! name so callers don't need to reach into `capi::message` directly.

pub use crate::capi::FaxNcpi as FaxInfo;
pub use crate::capi::message::parse_fax_ncpi;
