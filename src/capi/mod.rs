//! Everything that speaks the CAPI 2.0 wire protocol: constants, message codec and
//! the kernel driver adapter. Nothing in this module knows about PLCI/NCCI state
//! machines or call semantics; that lives in `connection` and `controller`.

pub mod constants;
pub mod driver;
pub mod message;

pub use crate::error::CapiError as Error;
pub use driver::{CapiDriver, LinuxCapiDriver, Profile};
pub use message::{decode, encode, FaxNcpi, Message, PartyNumber, Request};
