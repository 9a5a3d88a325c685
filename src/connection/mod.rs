//! The connection engine: one instance per ISDN call, owning the PLCI/NCCI state
//! machines, the send window, the receive sink, the DTMF buffer, the fax metadata
//! and the DDI accumulator.

pub mod bprotocol;
pub mod ddi;
pub mod fax;
pub mod number;
pub mod send_window;
pub mod state;

use std::sync::{Arc, Mutex};

use crate::capi::constants::cause;
use crate::capi::{Message, PartyNumber, Request};
use crate::error::{CapiError, Result};
use crate::observer::ConnectionObserver;

pub use bprotocol::{ControllerCapability, FaxParams, Service};
pub use ddi::{DdiAccumulator, DdiConfig};
pub use fax::FaxInfo;
pub use state::{NcciState, PlciState};

/// Default DTMF tone/gap duration, in tenths of a millisecond, used by `enable_dtmf`.
pub const DEFAULT_DTMF_TONE_TENTHS: u16 = 40;
pub const DEFAULT_DTMF_GAP_TENTHS: u16 = 40;

/// Abstraction over "can allocate a message number and hand a request to the driver",
/// implemented by the controller. Keeps `Connection` free of direct driver/appl-id
/// knowledge so it can be unit tested against a stub sender.
pub trait MessageSender: Send + Sync {
  fn next_msg_nr(&self) -> u16;
  fn send(&self, req: Request) -> Result<()>;
}

/// Mode argument to [`Connection::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
  All,
  PhysicalOnly,
  LogicalOnly,
}

struct ConnectionState {
  plci: u32,
  ncci: u32,
  plci_state: PlciState,
  ncci_state: NcciState,
  we_initiated: bool,
  caller: PartyNumber,
  callee: PartyNumber,
  service: Option<Service>,
  connect_ind_msg_nr: u16,
  disconnect_cause: u16,
  disconnect_cause_b3: u16,
  dtmf_buffer: String,
  fax_info: Option<FaxInfo>,
  suppress_physical_disconnect: bool,
  ddi: Option<DdiAccumulator>,
}

/// A single ISDN call, addressable by the application through its observer until
/// the PLCI state returns to `terminal`.
pub struct Connection {
  controller_id: u32,
  sender: Arc<dyn MessageSender>,
  capability: ControllerCapability,
  state: Mutex<ConnectionState>,
  send_window: Mutex<send_window::SendWindow>,
  receive_sink: Mutex<Option<Vec<u8>>>,
  observer: Mutex<Option<Arc<dyn ConnectionObserver>>>,
}

impl Connection {
  /// Build a connection for an incoming call (CONNECT_IND already parsed by the caller).
  pub fn new_incoming(
    controller_id: u32,
    plci: u32,
    msg_nr: u16,
    caller: PartyNumber,
    callee: PartyNumber,
    ddi: Option<DdiConfig>,
    sender: Arc<dyn MessageSender>,
    capability: ControllerCapability,
  ) -> Connection {
    Connection {
      controller_id,
      sender,
      capability,
      state: Mutex::new(ConnectionState {
        plci,
        ncci: plci,
        plci_state: PlciState::Incoming,
        ncci_state: NcciState::Idle,
        we_initiated: false,
        caller,
        callee,
        service: None,
        connect_ind_msg_nr: msg_nr,
        disconnect_cause: 0,
        disconnect_cause_b3: 0,
        dtmf_buffer: String::new(),
        fax_info: None,
        suppress_physical_disconnect: false,
        ddi: ddi.map(DdiAccumulator::new),
      }),
      send_window: Mutex::new(send_window::SendWindow::new()),
      receive_sink: Mutex::new(None),
      observer: Mutex::new(None),
    }
  }

  /// Build a connection for an outgoing call, indexed under a pseudo-PLCI until
  /// CONNECT_CONF assigns the real one (see `controller::pseudo_plci`).
  pub fn new_outgoing(
    controller_id: u32,
    pseudo_plci: u32,
    caller: PartyNumber,
    callee: PartyNumber,
    sender: Arc<dyn MessageSender>,
    capability: ControllerCapability,
  ) -> Connection {
    Connection {
      controller_id,
      sender,
      capability,
      state: Mutex::new(ConnectionState {
        plci: pseudo_plci,
        ncci: pseudo_plci,
        plci_state: PlciState::Idle,
        ncci_state: NcciState::Idle,
        we_initiated: true,
        caller,
        callee,
        service: None,
        connect_ind_msg_nr: 0,
        disconnect_cause: 0,
        disconnect_cause_b3: 0,
        dtmf_buffer: String::new(),
        fax_info: None,
        suppress_physical_disconnect: false,
        ddi: None,
      }),
      send_window: Mutex::new(send_window::SendWindow::new()),
      receive_sink: Mutex::new(None),
      observer: Mutex::new(None),
    }
  }

  pub fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
    *self.observer.lock().unwrap() = Some(observer);
  }

  /// Detach whichever observer is currently bound, if any. Called by call modules
  /// when their `execute` returns so the next module (or nothing) owns the slot.
  pub fn clear_observer(&self) {
    *self.observer.lock().unwrap() = None;
  }

  fn with_observer(&self, f: impl FnOnce(&dyn ConnectionObserver)) {
    if let Some(o) = self.observer.lock().unwrap().as_ref() {
      f(o.as_ref());
    }
  }

  pub fn plci(&self) -> u32 {
    self.state.lock().unwrap().plci
  }

  pub fn ncci(&self) -> u32 {
    self.state.lock().unwrap().ncci
  }

  pub fn controller_id(&self) -> u32 {
    self.controller_id
  }

  pub fn plci_state(&self) -> PlciState {
    self.state.lock().unwrap().plci_state
  }

  pub fn ncci_state(&self) -> NcciState {
    self.state.lock().unwrap().ncci_state
  }

  pub fn caller_number(&self) -> String {
    number::format_number(&self.state.lock().unwrap().caller)
  }

  pub fn callee_number(&self) -> String {
    number::format_number(&self.state.lock().unwrap().callee)
  }

  pub fn service(&self) -> Option<Service> {
    self.state.lock().unwrap().service
  }

  pub fn disconnect_cause(&self) -> (u16, u16) {
    let s = self.state.lock().unwrap();
    (s.disconnect_cause, s.disconnect_cause_b3)
  }

  pub fn fax_info(&self) -> Option<FaxInfo> {
    self.state.lock().unwrap().fax_info.clone()
  }

  pub fn read_dtmf(&self) -> String {
    self.state.lock().unwrap().dtmf_buffer.clone()
  }

  pub fn clear_dtmf(&self) {
    self.state.lock().unwrap().dtmf_buffer.clear();
  }

  // ---- public operations -------------------------------------------------

  pub fn accept(&self, service: Service, fax: &FaxParams) -> Result<()> {
    let mut s = self.state.lock().unwrap();
    if s.plci_state != PlciState::Incoming {
      return Err(CapiError::ConnectionGone("accept outside waiting state".to_string()));
    }
    let config = bprotocol::build(service, self.capability, fax)?;
    self.sender.send(Request::ConnectResp {
      plci: s.plci,
      msg_nr: s.connect_ind_msg_nr,
      accept: 0,
      b1_proto: config.b1,
      b2_proto: config.b2,
      b3_proto: config.b3,
      b3_config: config.b3_config,
    })?;
    s.service = Some(service);
    s.plci_state = PlciState::InAlerting;
    Ok(())
  }

  pub fn reject(&self, cause: u16) -> Result<()> {
    if cause == 0 {
      return Err(CapiError::External("reject cause must be non-zero".to_string()));
    }
    let mut s = self.state.lock().unwrap();
    if s.plci_state != PlciState::Incoming {
      return Err(CapiError::ConnectionGone("reject outside waiting state".to_string()));
    }
    self.sender.send(Request::ConnectResp {
      plci: s.plci,
      msg_nr: s.connect_ind_msg_nr,
      accept: cause,
      b1_proto: 0,
      b2_proto: 0,
      b3_proto: 0,
      b3_config: Vec::new(),
    })?;
    s.plci_state = PlciState::Disconnecting;
    Ok(())
  }

  pub fn alert(&self) -> Result<()> {
    let s = self.state.lock().unwrap();
    if s.plci_state != PlciState::Incoming {
      return Err(CapiError::ConnectionGone("alert outside waiting state".to_string()));
    }
    self.sender.send(Request::AlertReq { plci: s.plci, msg_nr: self.sender.next_msg_nr() })
  }

  pub fn change_protocol(&self, service: Service, fax: &FaxParams) -> Result<()> {
    let mut s = self.state.lock().unwrap();
    if s.plci_state != PlciState::Active || s.ncci_state != NcciState::Idle {
      return Err(CapiError::ConnectionGone("change_protocol requires PLCI active / NCCI idle".to_string()));
    }
    if s.service == Some(service) {
      return Ok(());
    }
    let config = bprotocol::build(service, self.capability, fax)?;
    self.sender.send(Request::SelectBProtocolReq {
      plci: s.plci,
      msg_nr: self.sender.next_msg_nr(),
      b1_proto: config.b1,
      b2_proto: config.b2,
      b3_proto: config.b3,
      b3_config: config.b3_config,
    })?;
    s.service = Some(service);
    Ok(())
  }

  /// Issue the initial CONNECT_REQ for a freshly-built outgoing connection. The
  /// message number the pseudo-PLCI was minted from (its low 16 bits, see
  /// `controller::pseudo_plci`) is reused as the CONNECT_REQ's own `msg_nr` so the
  /// eventual CONNECT_CONF routes back to this connection.
  pub fn place_call(&self, cip: u16, service: Service, fax: &FaxParams) -> Result<()> {
    let mut s = self.state.lock().unwrap();
    if !s.we_initiated || s.plci_state != PlciState::Idle {
      return Err(CapiError::ConnectionGone("place_call requires a fresh outgoing connection".to_string()));
    }
    let config = bprotocol::build(service, self.capability, fax)?;
    let msg_nr = (s.plci & 0xFFFF) as u16;
    self.sender.send(Request::ConnectReq {
      controller: self.controller_id,
      msg_nr,
      cip,
      called_party_number: s.callee.clone(),
      calling_party_number: s.caller.clone(),
      b1_proto: config.b1,
      b2_proto: config.b2,
      b3_proto: config.b3,
      b3_config: config.b3_config,
    })?;
    s.service = Some(service);
    s.plci_state = PlciState::ReqPending;
    Ok(())
  }

  pub fn disconnect(&self, mode: DisconnectMode) -> Result<()> {
    let mut s = self.state.lock().unwrap();
    if s.plci_state.is_terminal() {
      return Ok(()); // idempotent
    }
    match mode {
      DisconnectMode::All => {
        if s.ncci_state.is_active() || s.ncci_state == NcciState::Accepting || s.ncci_state == NcciState::ActivePending {
          self.sender.send(Request::DisconnectB3Req { ncci: s.ncci, msg_nr: self.sender.next_msg_nr() })?;
          s.ncci_state = NcciState::Disconnecting;
        }
        self.sender.send(Request::DisconnectReq { plci: s.plci, msg_nr: self.sender.next_msg_nr() })?;
        s.plci_state = PlciState::Disconnecting;
      }
      DisconnectMode::PhysicalOnly => {
        self.sender.send(Request::DisconnectReq { plci: s.plci, msg_nr: self.sender.next_msg_nr() })?;
        s.plci_state = PlciState::Disconnecting;
      }
      DisconnectMode::LogicalOnly => {
        self.sender.send(Request::DisconnectB3Req { ncci: s.ncci, msg_nr: self.sender.next_msg_nr() })?;
        s.ncci_state = NcciState::Disconnecting;
        s.suppress_physical_disconnect = true;
      }
    }
    Ok(())
  }

  pub fn enable_dtmf(&self) -> Result<()> {
    let s = self.state.lock().unwrap();
    self.sender.send(Request::FacilityReqDtmfListen {
      plci: s.plci,
      msg_nr: self.sender.next_msg_nr(),
      start: true,
      tone_duration_tenths: DEFAULT_DTMF_TONE_TENTHS,
      gap_duration_tenths: DEFAULT_DTMF_GAP_TENTHS,
    })
  }

  pub fn disable_dtmf(&self) -> Result<()> {
    let s = self.state.lock().unwrap();
    self.sender.send(Request::FacilityReqDtmfListen {
      plci: s.plci,
      msg_nr: self.sender.next_msg_nr(),
      start: false,
      tone_duration_tenths: DEFAULT_DTMF_TONE_TENTHS,
      gap_duration_tenths: DEFAULT_DTMF_GAP_TENTHS,
    })
  }

  /// Entry check for starting a send: requires the connection fully up and no
  /// other send already in progress. The module driving the file read loop then
  /// calls `push_send_block` directly as it reads chunks.
  pub fn begin_send(&self) -> Result<()> {
    if self.plci_state() != PlciState::Active || self.ncci_state() != NcciState::Active {
      return Err(CapiError::ConnectionGone("connection not fully up for send".to_string()));
    }
    if self.send_window.lock().unwrap().used() > 0 {
      return Err(CapiError::External("a send is already active".to_string()));
    }
    Ok(())
  }

  pub fn send_window_used(&self) -> usize {
    self.send_window.lock().unwrap().used()
  }

  pub fn send_window_has_capacity(&self) -> bool {
    self.send_window.lock().unwrap().has_capacity_for_inflight_target()
  }

  pub fn push_send_block(&self, data: Vec<u8>) -> Result<Option<usize>> {
    let ncci = self.ncci();
    let mut window = self.send_window.lock().unwrap();
    let slot = window.push(data.clone());
    if let Some(handle) = slot {
      drop(window);
      self.sender.send(Request::DataB3Req { ncci, msg_nr: self.sender.next_msg_nr(), handle: handle as u16, data })?;
    }
    Ok(slot)
  }

  pub fn start_receive_file(&self) -> Result<()> {
    let mut sink = self.receive_sink.lock().unwrap();
    if sink.is_some() {
      return Err(CapiError::External("a receive sink is already installed".to_string()));
    }
    *sink = Some(Vec::new());
    Ok(())
  }

  pub fn stop_receive_file(&self) -> Option<Vec<u8>> {
    self.receive_sink.lock().unwrap().take()
  }

  // ---- driver-event handlers, invoked only from the reader task ----------

  /// Applies `msg` to this connection's state machine. Returns `true` exactly when
  /// this call just completed DDI digit accumulation — the only signal the
  /// controller needs beyond firing observer callbacks, since it alone decides when
  /// to `call_waiting` a connection that was held back pending a full callee number.
  pub fn on_message(&self, msg: &Message) -> bool {
    match msg {
      Message::ConnectConf { info, .. } => {
        self.on_connect_conf(*info);
        false
      }
      Message::ConnectActiveInd { .. } => {
        self.on_connect_active_ind();
        false
      }
      Message::InfoIndAlerting { .. } => {
        self.with_observer(|o| o.alerting());
        false
      }
      Message::InfoIndCalledPartyNumber { number, .. } => self.on_ddi_digits(number),
      Message::FacilityIndDtmf { digits, .. } => {
        self.on_dtmf(digits);
        false
      }
      Message::ConnectB3Ind { ncci, .. } => {
        self.on_connect_b3_ind(*ncci);
        false
      }
      Message::ConnectB3Conf { info, .. } => {
        self.on_connect_b3_conf(*info);
        false
      }
      Message::ConnectB3ActiveInd { ncpi, .. } => {
        self.on_connect_b3_active_ind(ncpi);
        false
      }
      Message::DataB3Ind { ncci, handle, data, .. } => {
        self.on_data_b3_ind(*ncci, *handle, data);
        false
      }
      Message::DataB3Conf { handle, .. } => {
        self.on_data_b3_conf(*handle as usize);
        false
      }
      Message::DisconnectInd { reason, .. } => {
        self.on_disconnect_ind(*reason);
        false
      }
      Message::DisconnectB3Ind { reason_b3, ncpi, .. } => {
        self.on_disconnect_b3_ind(*reason_b3, ncpi);
        false
      }
      _ => false,
    }
  }

  fn on_connect_conf(&self, info: u16) {
    let failed = {
      let mut s = self.state.lock().unwrap();
      if info == 0 {
        s.plci_state = PlciState::OutAlerting;
        false
      } else {
        s.plci_state = PlciState::Idle;
        s.disconnect_cause = info;
        true
      }
    };
    if failed {
      self.with_observer(|o| o.connect_failed(info));
    }
  }

  fn on_connect_active_ind(&self) {
    let (ncci, msg_nr) = {
      let mut s = self.state.lock().unwrap();
      s.plci_state = PlciState::Active;
      s.ncci_state = state::NcciState::ReqPending;
      (s.ncci, self.sender.next_msg_nr())
    };
    let _ = self.sender.send(Request::ConnectB3Req { plci: ncci, msg_nr });
  }

  fn on_ddi_digits(&self, number: &PartyNumber) -> bool {
    let digits = String::from_utf8_lossy(&number.digits).into_owned();
    let mut s = self.state.lock().unwrap();
    let complete = s.ddi.as_mut().and_then(|acc| acc.append(&digits));
    match complete {
      Some(full) => {
        s.callee = PartyNumber { type_plan: s.callee.type_plan, digits: full.into_bytes() };
        true
      }
      None => false,
    }
  }

  fn on_dtmf(&self, digits: &[u8]) {
    {
      let mut s = self.state.lock().unwrap();
      s.dtmf_buffer.push_str(&String::from_utf8_lossy(digits));
    }
    self.with_observer(|o| o.dtmf_arrived());
  }

  fn on_connect_b3_ind(&self, ncci: u32) {
    let mut s = self.state.lock().unwrap();
    s.ncci = ncci;
    s.ncci_state = NcciState::Accepting;
  }

  fn on_connect_b3_conf(&self, info: u16) {
    let mut s = self.state.lock().unwrap();
    if info == 0 {
      s.ncci_state = NcciState::ActivePending;
    }
  }

  fn on_connect_b3_active_ind(&self, ncpi: &[u8]) {
    {
      let mut s = self.state.lock().unwrap();
      s.ncci_state = NcciState::Active;
      s.fax_info = fax::parse_fax_ncpi(ncpi);
    }
    self.with_observer(|o| o.connected());
  }

  fn on_data_b3_ind(&self, ncci: u32, handle: u16, data: &[u8]) {
    if let Some(sink) = self.receive_sink.lock().unwrap().as_mut() {
      sink.extend_from_slice(data);
    }
    self.with_observer(|o| o.data_in(data));
    let _ = self.sender.send(Request::DataB3Resp { ncci, msg_nr: self.sender.next_msg_nr(), handle });
  }

  fn on_data_b3_conf(&self, handle: usize) {
    let emptied = {
      let mut window = self.send_window.lock().unwrap();
      if window.confirm(handle).is_err() {
        return;
      }
      window.used() == 0
    };
    self.with_observer(|o| o.send_slot_freed());
    if emptied {
      self.with_observer(|o| o.transmission_complete());
    }
  }

  fn on_disconnect_ind(&self, reason: u16) {
    {
      let mut s = self.state.lock().unwrap();
      s.plci_state = PlciState::Terminal;
      s.disconnect_cause = reason;
    }
    self.with_observer(|o| o.disconnected_physical(reason));
  }

  fn on_disconnect_b3_ind(&self, reason_b3: u16, ncpi: &[u8]) {
    let chain_physical = {
      let mut s = self.state.lock().unwrap();
      s.ncci_state = NcciState::Idle;
      s.disconnect_cause_b3 = reason_b3;
      if let Some(info) = fax::parse_fax_ncpi(ncpi) {
        s.fax_info = Some(info);
      }
      self.send_window.lock().unwrap().reset_on_disconnect();
      let suppress = s.suppress_physical_disconnect;
      s.suppress_physical_disconnect = false;
      !suppress
    };
    self.with_observer(|o| o.disconnected_logical());
    if chain_physical {
      let _ = self.disconnect(DisconnectMode::PhysicalOnly);
    }
  }
}

/// Cause used for forced teardown from destructor-equivalent paths (`Drop`).
pub const FORCED_TEARDOWN_CAUSE: u16 = cause::TEMPORARY_FAILURE;

impl Drop for Connection {
  fn drop(&mut self) {
    let terminal = self.state.lock().unwrap().plci_state.is_terminal();
    if !terminal {
      let _ = self.disconnect(DisconnectMode::PhysicalOnly);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex as StdMutex;

  struct StubSender {
    sent: StdMutex<Vec<Request>>,
    counter: std::sync::atomic::AtomicU16,
  }

  impl StubSender {
    fn new() -> Arc<StubSender> {
      Arc::new(StubSender { sent: StdMutex::new(Vec::new()), counter: std::sync::atomic::AtomicU16::new(1) })
    }
  }

  impl MessageSender for StubSender {
    fn next_msg_nr(&self) -> u16 {
      self.counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
    fn send(&self, req: Request) -> Result<()> {
      self.sent.lock().unwrap().push(req);
      Ok(())
    }
  }

  fn incoming_connection(sender: Arc<StubSender>) -> Connection {
    Connection::new_incoming(
      1,
      0x10001,
      1,
      PartyNumber { type_plan: 0x21, digits: b"4930123456".to_vec() },
      PartyNumber { type_plan: 0x21, digits: b"4930111".to_vec() },
      None,
      sender,
      ControllerCapability { transparent: true, fax: true, fax_extended: false, is_avm: false },
    )
  }

  #[test]
  fn accept_transitions_to_in_alerting_and_sends_connect_resp() {
    let sender = StubSender::new();
    let conn = incoming_connection(sender.clone());
    conn.accept(Service::Voice, &FaxParams::default()).unwrap();
    assert_eq!(conn.plci_state(), PlciState::InAlerting);
    assert_eq!(sender.sent.lock().unwrap().len(), 1);
  }

  #[test]
  fn reject_with_cause_zero_is_rejected() {
    let sender = StubSender::new();
    let conn = incoming_connection(sender);
    assert!(conn.reject(0).is_err());
  }

  #[test]
  fn accept_outside_waiting_state_is_connection_gone() {
    let sender = StubSender::new();
    let conn = incoming_connection(sender);
    conn.accept(Service::Voice, &FaxParams::default()).unwrap();
    let err = conn.accept(Service::Voice, &FaxParams::default());
    assert!(matches!(err, Err(CapiError::ConnectionGone(_))));
  }

  #[test]
  fn disconnect_all_is_idempotent() {
    let sender = StubSender::new();
    let conn = incoming_connection(sender);
    conn.disconnect(DisconnectMode::All).unwrap();
    conn.on_message(&Message::DisconnectInd { plci: conn.plci(), msg_nr: 1, reason: 0x3490 });
    assert!(conn.disconnect(DisconnectMode::All).is_ok());
  }

  #[test]
  fn logical_only_disconnect_suppresses_exactly_one_physical_chain() {
    let sender = StubSender::new();
    let conn = incoming_connection(sender.clone());
    conn.disconnect(DisconnectMode::LogicalOnly).unwrap();
    let ncci = conn.ncci();
    conn.on_message(&Message::DisconnectB3Ind { ncci, msg_nr: 2, reason_b3: 0, ncpi: vec![] });
    // no DisconnectReq should have been queued for the physical leg
    let sent = sender.sent.lock().unwrap();
    assert!(!sent.iter().any(|r| matches!(r, Request::DisconnectReq { .. })));
  }

  #[test]
  fn send_window_reports_full_after_seven_pushes() {
    let sender = StubSender::new();
    let conn = incoming_connection(sender);
    for _ in 0..7 {
      conn.push_send_block(vec![0]).unwrap();
    }
    assert_eq!(conn.send_window_used(), 7);
    assert!(conn.push_send_block(vec![0]).unwrap().is_none());
  }

  #[test]
  fn data_b3_conf_fires_transmission_complete_when_window_drains() {
    use std::sync::atomic::{AtomicBool, Ordering};
    struct Obs(Arc<AtomicBool>);
    impl ConnectionObserver for Obs {
      fn transmission_complete(&self) {
        self.0.store(true, Ordering::SeqCst);
      }
    }
    let sender = StubSender::new();
    let conn = incoming_connection(sender);
    let fired = Arc::new(AtomicBool::new(false));
    conn.set_observer(Arc::new(Obs(fired.clone())));
    let handle = conn.push_send_block(vec![0]).unwrap().unwrap();
    conn.on_message(&Message::DataB3Conf { ncci: conn.ncci(), msg_nr: 1, handle: handle as u16, info: 0 });
    assert!(fired.load(Ordering::SeqCst));
  }
}
