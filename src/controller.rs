//! The process-wide driver controller: registration, listen masks, the PLCI/pseudo-id
//! → connection directory, and the single reader task that pumps driver messages into
//! connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};

use crate::capi::constants::{listen_mask, PSEUDO_PLCI_TAG};
use crate::capi::driver::{CapiDriver, Profile};
use crate::capi::{Message, Request};
use crate::connection::{Connection, ControllerCapability, DdiConfig, MessageSender};
use crate::error::{CapiError, Result};
use crate::observer::IncomingCallHandler;

/// Key the connection directory is indexed by: a real PLCI once assigned, or the
/// pseudo-id synthesised for a pending outgoing CONNECT_REQ.
pub fn pseudo_plci(msg_nr: u16) -> u32 {
  PSEUDO_PLCI_TAG | msg_nr as u32
}

struct Sender {
  driver: Mutex<Box<dyn CapiDriver>>,
  appl_id: u16,
  msg_nr: AtomicU16,
}

impl MessageSender for Sender {
  fn next_msg_nr(&self) -> u16 {
    self.msg_nr.fetch_add(1, Ordering::SeqCst)
  }

  fn send(&self, req: Request) -> Result<()> {
    let bytes = crate::capi::encode(&req, self.appl_id);
    self.driver.lock().unwrap().put_message(&bytes)
  }
}

/// Configuration the controller needs at construction time.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
  pub controller_id: u32,
  pub max_logical_connections: u32,
  pub max_b_data_blocks: u32,
  pub max_b_data_block_size: u32,
  pub ddi: Option<DdiConfig>,
}

/// One per process. Owns the driver, the connection directory and the listen masks.
pub struct Controller {
  config: ControllerConfig,
  sender: Arc<Sender>,
  profile: Profile,
  capability: ControllerCapability,
  connections: Mutex<HashMap<u32, Arc<Connection>>>,
  info_mask: Mutex<u32>,
  cip_mask: Mutex<u32>,
  incoming: Mutex<Option<Arc<dyn IncomingCallHandler>>>,
}

fn capability_from_profile(profile: &Profile, ddi_needs_info: bool) -> ControllerCapability {
  let _ = ddi_needs_info;
  ControllerCapability {
    transparent: profile.b1_protocols & 0x1 != 0,
    fax: profile.b3_protocols & (1 << 4) != 0,
    fax_extended: profile.b3_protocols & (1 << 5) != 0,
    is_avm: false,
  }
}

impl Controller {
  /// Register with the driver and read its profile. Does not yet issue LISTEN_REQ;
  /// call `listen_voice` / `listen_fax` to opt in per service.
  pub fn new(mut driver: Box<dyn CapiDriver>, config: ControllerConfig) -> Result<Controller> {
    driver.register(config.max_logical_connections, config.max_b_data_blocks, config.max_b_data_block_size)?;
    let profile = driver.get_profile(config.controller_id)?;
    let capability = capability_from_profile(&profile, config.ddi.is_some());
    let sender = Arc::new(Sender { driver: Mutex::new(driver), appl_id: 1, msg_nr: AtomicU16::new(1) });
    Ok(Controller {
      config,
      sender,
      profile,
      capability,
      connections: Mutex::new(HashMap::new()),
      info_mask: Mutex::new(listen_mask::INFO_DEFAULT),
      cip_mask: Mutex::new(0),
      incoming: Mutex::new(None),
    })
  }

  pub fn set_incoming_handler(&self, handler: Arc<dyn IncomingCallHandler>) {
    *self.incoming.lock().unwrap() = Some(handler);
  }

  pub fn controller_id(&self) -> u32 {
    self.config.controller_id
  }

  pub fn profile(&self) -> Profile {
    self.profile
  }

  pub fn capability(&self) -> ControllerCapability {
    self.capability
  }

  /// Enable voice listening, refusing if the profile lacks transparent support.
  pub fn listen_voice(&self) -> Result<()> {
    if !self.capability.transparent {
      return Err(CapiError::External("controller profile has no transparent capability".to_string()));
    }
    self.update_cip_mask(listen_mask::CIP_VOICE)
  }

  /// Enable fax-G3 listening, refusing if the profile lacks fax support.
  pub fn listen_fax(&self) -> Result<()> {
    if !self.capability.fax && !self.capability.fax_extended {
      return Err(CapiError::External("controller profile has no fax-G3 capability".to_string()));
    }
    self.update_cip_mask(listen_mask::CIP_FAX_G3)
  }

  fn update_cip_mask(&self, bits: u32) -> Result<()> {
    let mut cip_mask = self.cip_mask.lock().unwrap();
    *cip_mask |= bits;
    let mut info_mask = self.info_mask.lock().unwrap();
    if self.config.ddi.is_some() {
      *info_mask |= listen_mask::INFO_CALLED_PARTY_NUMBER;
    }
    self.sender.send(Request::ListenReq {
      controller: self.config.controller_id,
      msg_nr: self.sender.next_msg_nr(),
      info_mask: *info_mask,
      cip_mask: *cip_mask,
    })
  }

  fn insert(&self, key: u32, conn: Arc<Connection>) {
    self.connections.lock().unwrap().insert(key, conn);
  }

  fn lookup(&self, key: u32) -> Option<Arc<Connection>> {
    self.connections.lock().unwrap().get(&key).cloned()
  }

  fn rekey(&self, old: u32, new: u32) {
    let mut map = self.connections.lock().unwrap();
    if let Some(conn) = map.remove(&old) {
      map.insert(new, conn);
    }
  }

  fn remove(&self, key: u32) {
    self.connections.lock().unwrap().remove(&key);
  }

  /// Register a not-yet-PLCI'd outgoing connection under its pending pseudo-id.
  pub fn register_outgoing(&self, msg_nr: u16, conn: Arc<Connection>) {
    self.insert(pseudo_plci(msg_nr), conn);
  }

  pub fn sender(&self) -> Arc<dyn MessageSender> {
    self.sender.clone()
  }

  /// Run the single blocking reader loop. Returns when `should_stop` reports true,
  /// polled at the same cadence as message waits (≈100ms), honoring the
  /// cooperative-shutdown polling point named by the concurrency model.
  pub fn run_reader(&self, should_stop: impl Fn() -> bool) {
    while !should_stop() {
      match self.sender.driver.lock().unwrap().wait_for_message(Duration::from_millis(100)) {
        Ok(true) => {}
        Ok(false) => continue,
        Err(e) => {
          error!("driver wait_for_message failed: {}", e);
          continue;
        }
      }
      let raw = match self.sender.driver.lock().unwrap().get_message() {
        Ok(bytes) => bytes,
        Err(e) => {
          error!("driver get_message failed: {}", e);
          continue;
        }
      };
      let msg = match crate::capi::decode(&raw) {
        Ok(m) => m,
        Err(e) => {
          warn!("failed to decode CAPI message: {}", e);
          continue;
        }
      };
      self.dispatch(msg);
    }
  }

  fn dispatch(&self, msg: Message) {
    match &msg {
      Message::ListenConf { info, .. } if *info != 0 => {
        error!("LISTEN_CONF returned info=0x{:04x}; no further messages will arrive", info);
      }
      Message::ConnectInd { plci, calling_party_number, called_party_number, msg_nr, .. } => {
        self.on_connect_ind(*plci, *msg_nr, calling_party_number.clone(), called_party_number.clone());
      }
      Message::ConnectConf { msg_nr, .. } => {
        let pending = pseudo_plci(*msg_nr);
        if let Some(conn) = self.lookup(pending) {
          if let Message::ConnectConf { plci, .. } = &msg {
            self.rekey(pending, *plci);
          }
          conn.on_message(&msg);
        } else {
          warn!("CONNECT_CONF for unknown pending request {:04x}", msg_nr);
        }
      }
      other => {
        if let Some(key) = other.plci_or_ncci() {
          match self.lookup(key) {
            Some(conn) => {
              let terminal_after = matches!(other, Message::DisconnectInd { .. });
              let ddi_complete = conn.on_message(&msg);
              if ddi_complete {
                self.maybe_publish_ddi_complete(conn.clone());
              }
              if terminal_after {
                self.remove(key);
              }
            }
            None => warn!("message for unknown PLCI/NCCI 0x{:08x}: {:?}", key, other),
          }
        } else {
          debug!("unhandled message: {:?}", other);
        }
      }
    }
  }

  fn on_connect_ind(
    &self,
    plci: u32,
    msg_nr: u16,
    caller: crate::capi::PartyNumber,
    called: crate::capi::PartyNumber,
  ) {
    let ddi = self.config.ddi.clone();
    let conn = Arc::new(Connection::new_incoming(
      self.config.controller_id,
      plci,
      msg_nr,
      caller,
      if ddi.is_some() { crate::capi::PartyNumber::empty() } else { called },
      ddi,
      self.sender.clone(),
      self.capability,
    ));
    self.insert(plci, conn.clone());
    if self.config.ddi.is_none() {
      self.publish(conn);
    }
    // In DDI mode, publication is held back until the accumulator completes; see
    // `dispatch`'s generic arm, which calls `maybe_publish_ddi_complete` once
    // `Connection::on_message` reports the INFO_IND just finished the number.
  }

  fn publish(&self, conn: Arc<Connection>) {
    if let Some(handler) = self.incoming.lock().unwrap().as_ref() {
      handler.call_waiting(conn);
    }
  }

  /// Called from `dispatch` once `Connection::on_message` reports that an INFO_IND
  /// just completed DDI accumulation; connections don't know about the application
  /// boundary, so the controller is the one that publishes.
  fn maybe_publish_ddi_complete(&self, conn: Arc<Connection>) {
    self.publish(conn);
  }
}

#[cfg(test)]
impl Controller {
  /// Test-only window into the connection directory, used to drive a pending
  /// outgoing call's CONNECT_CONF without a running reader loop.
  pub fn lookup_for_test(&self, key: u32) -> Option<Arc<Connection>> {
    self.lookup(key)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::capi::driver::fake::FakeDriver;

  fn controller_with_fake() -> (Controller, ()) {
    let mut fake = FakeDriver::default();
    fake.profile.b1_protocols = 0x1;
    fake.profile.b3_protocols = (1 << 4) | (1 << 5);
    let cfg = ControllerConfig {
      controller_id: 1,
      max_logical_connections: 2,
      max_b_data_blocks: 7,
      max_b_data_block_size: 2048,
      ddi: None,
    };
    (Controller::new(Box::new(fake), cfg).unwrap(), ())
  }

  #[test]
  fn listen_voice_requires_transparent_capability() {
    let (controller, _) = controller_with_fake();
    assert!(controller.listen_voice().is_ok());
  }

  #[test]
  fn listen_fax_refused_without_capability() {
    let mut fake = FakeDriver::default();
    fake.profile.b1_protocols = 0x1;
    let cfg = ControllerConfig {
      controller_id: 1,
      max_logical_connections: 2,
      max_b_data_blocks: 7,
      max_b_data_block_size: 2048,
      ddi: None,
    };
    let controller = Controller::new(Box::new(fake), cfg).unwrap();
    assert!(controller.listen_fax().is_err());
  }

  #[test]
  fn pseudo_plci_tag_is_applied() {
    assert_eq!(pseudo_plci(7) & 0xFFFF_0000, PSEUDO_PLCI_TAG);
  }

  struct RecordingHandler(Mutex<Vec<String>>);
  impl IncomingCallHandler for RecordingHandler {
    fn call_waiting(&self, connection: Arc<Connection>) {
      self.0.lock().unwrap().push(connection.callee_number());
    }
  }

  #[test]
  fn ddi_completion_publishes_the_connection_exactly_once() {
    let mut fake = FakeDriver::default();
    fake.profile.b1_protocols = 0x1;
    fake.profile.b3_protocols = (1 << 4) | (1 << 5);
    let cfg = ControllerConfig {
      controller_id: 1,
      max_logical_connections: 2,
      max_b_data_blocks: 7,
      max_b_data_block_size: 2048,
      ddi: Some(DdiConfig { length: 3, base_length: 7, stop_numbers: vec![] }),
    };
    let controller = Controller::new(Box::new(fake), cfg).unwrap();
    let handler = Arc::new(RecordingHandler(Mutex::new(Vec::new())));
    controller.set_incoming_handler(handler.clone());

    controller.dispatch(Message::ConnectInd {
      plci: 0x10001,
      msg_nr: 1,
      cip: 16,
      called_party_number: crate::capi::PartyNumber::empty(),
      calling_party_number: crate::capi::PartyNumber::empty(),
    });
    // No call_waiting yet: DDI accumulation hasn't completed.
    assert!(handler.0.lock().unwrap().is_empty());

    controller.dispatch(Message::InfoIndCalledPartyNumber {
      plci: 0x10001,
      msg_nr: 2,
      number: crate::capi::PartyNumber { type_plan: 0x81, digits: b"1".to_vec() },
    });
    assert!(handler.0.lock().unwrap().is_empty());

    controller.dispatch(Message::InfoIndCalledPartyNumber {
      plci: 0x10001,
      msg_nr: 3,
      number: crate::capi::PartyNumber { type_plan: 0x81, digits: b"23".to_vec() },
    });
    assert_eq!(handler.0.lock().unwrap().as_slice(), &["123".to_string()]);

    // A further INFO_IND must not publish a second time.
    controller.dispatch(Message::InfoIndCalledPartyNumber {
      plci: 0x10001,
      msg_nr: 4,
      number: crate::capi::PartyNumber { type_plan: 0x81, digits: b"4".to_vec() },
    });
    assert_eq!(handler.0.lock().unwrap().len(), 1);
  }
}
