//! Assembles and disassembles CAPI 2.0 messages.
//!
//! Every message on the wire starts with a fixed header (total length, application id,
//! command, subcommand, message number) followed by a command-specific body. Variable
//! length sub-structures (`_cstruct` in the C API) are Pascal-style: one length byte
//! followed by that many bytes. We decode into `Message`, a sum type over every
//! (command, phase) pair the controller and connection engine need to react to, and
//! encode `Request` values the same way in reverse.

use super::constants::{command, subcommand};
use crate::error::{CapiError, Result};

/// A parsed ISDN party number (calling or called), before it is rendered to a
/// human-readable string by [`crate::connection::number::format_number`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyNumber {
  /// Type-of-number / numbering-plan byte. High nibble 0x1 = international, 0x2 = national.
  pub type_plan: u8,
  /// ASCII digits, in wire order.
  pub digits: Vec<u8>,
}

impl PartyNumber {
  pub fn empty() -> PartyNumber {
    PartyNumber { type_plan: 0, digits: Vec::new() }
  }

  /// Decode a CalledPartyNumber struct: `[len][type_plan][digits...]`.
  pub fn decode_called(raw: &[u8]) -> Result<PartyNumber> {
    if raw.is_empty() {
      return Ok(PartyNumber::empty());
    }
    let len = raw[0] as usize;
    if raw.len() < 1 + len || len == 0 {
      return Ok(PartyNumber::empty());
    }
    Ok(PartyNumber { type_plan: raw[1], digits: raw[2..1 + len].to_vec() })
  }

  /// Decode a CallingPartyNumber struct: `[len][type_plan][presentation][digits...]`.
  /// A calling number's digits start one byte later than a called number's.
  pub fn decode_calling(raw: &[u8]) -> Result<PartyNumber> {
    if raw.is_empty() {
      return Ok(PartyNumber::empty());
    }
    let len = raw[0] as usize;
    if raw.len() < 1 + len || len < 1 {
      return Ok(PartyNumber::empty());
    }
    Ok(PartyNumber { type_plan: raw[1], digits: raw[3..1 + len].to_vec() })
  }

  pub fn encode_called(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + self.digits.len());
    out.push((1 + self.digits.len()) as u8);
    out.push(self.type_plan);
    out.extend_from_slice(&self.digits);
    out
  }

  pub fn encode_calling(&self) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + self.digits.len());
    out.push((2 + self.digits.len()) as u8);
    out.push(self.type_plan);
    out.push(0); // presentation/screening: presentation allowed, network-provided
    out.extend_from_slice(&self.digits);
    out
  }
}

/// Fax metadata decoded from the NCPI trailer of CONNECT_B3_ACTIVE_IND / DISCONNECT_B3_IND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaxNcpi {
  pub rate: u16,
  pub high_res: bool,
  pub color_jpeg: bool,
  pub pages: u16,
  pub station_id: Vec<u8>,
}

/// Parse the NCPI trailer. Returns `None` when the NCPI is shorter than the 9 bytes
/// the fax fields require (CAPI encodes "no NCPI" as a zero-length struct).
pub fn parse_fax_ncpi(ncpi: &[u8]) -> Option<FaxNcpi> {
  if ncpi.is_empty() || (ncpi[0] as usize) < 9 {
    return None;
  }
  let station_len = *ncpi.get(9)? as usize;
  let station_id = ncpi.get(10..10 + station_len).unwrap_or(&[]).to_vec();
  Some(FaxNcpi {
    rate: ncpi[1] as u16 | ((ncpi[2] as u16) << 8),
    high_res: ncpi[3] & 0x01 != 0,
    color_jpeg: ncpi[4] & 0x04 != 0,
    pages: ncpi[7] as u16 | ((ncpi[8] as u16) << 8),
    station_id,
  })
}

/// A decoded CAPI message, restricted to the (command, phase) pairs the core acts on:
/// one variant per message category (indication / confirmation) crossed with command.
#[derive(Debug, Clone)]
pub enum Message {
  ListenConf { controller: u32, msg_nr: u16, info: u16 },
  ConnectInd {
    plci: u32,
    msg_nr: u16,
    cip: u16,
    called_party_number: PartyNumber,
    calling_party_number: PartyNumber,
  },
  ConnectConf { plci: u32, msg_nr: u16, info: u16 },
  ConnectActiveInd { plci: u32, msg_nr: u16 },
  AlertConf { plci: u32, msg_nr: u16, info: u16 },
  InfoIndAlerting { plci: u32, msg_nr: u16 },
  InfoIndCalledPartyNumber { plci: u32, msg_nr: u16, number: PartyNumber },
  InfoConf { plci: u32, msg_nr: u16, info: u16 },
  SelectBProtocolConf { plci: u32, msg_nr: u16, info: u16 },
  FacilityIndDtmf { plci: u32, msg_nr: u16, digits: Vec<u8> },
  FacilityConfDtmf { plci: u32, msg_nr: u16, info: u16 },
  DisconnectInd { plci: u32, msg_nr: u16, reason: u16 },
  DisconnectConf { plci: u32, msg_nr: u16, info: u16 },
  ConnectB3Ind { ncci: u32, msg_nr: u16, ncpi: Vec<u8> },
  ConnectB3Conf { ncci: u32, msg_nr: u16, info: u16 },
  ConnectB3ActiveInd { ncci: u32, msg_nr: u16, ncpi: Vec<u8> },
  DataB3Ind { ncci: u32, msg_nr: u16, handle: u16, data: Vec<u8> },
  DataB3Conf { ncci: u32, msg_nr: u16, handle: u16, info: u16 },
  DisconnectB3Ind { ncci: u32, msg_nr: u16, reason_b3: u16, ncpi: Vec<u8> },
  DisconnectB3Conf { ncci: u32, msg_nr: u16, info: u16 },
  /// Anything we decoded a header for but don't act on (kept so the reader can at
  /// least count/log it instead of treating it as a parse failure).
  Other { command: u8, subcommand: u8, plci: u32, msg_nr: u16 },
}

impl Message {
  /// The PLCI (or NCCI, whose low 16 bits are the PLCI) this message concerns, if any.
  /// CONNECT_CONF carries no PLCI of its own before the driver assigns one; the caller
  /// must route it via the pseudo-id derived from `msg_nr` instead.
  pub fn plci_or_ncci(&self) -> Option<u32> {
    match self {
      Message::ConnectInd { plci, .. }
      | Message::ConnectActiveInd { plci, .. }
      | Message::AlertConf { plci, .. }
      | Message::InfoIndAlerting { plci, .. }
      | Message::InfoIndCalledPartyNumber { plci, .. }
      | Message::InfoConf { plci, .. }
      | Message::SelectBProtocolConf { plci, .. }
      | Message::FacilityIndDtmf { plci, .. }
      | Message::FacilityConfDtmf { plci, .. }
      | Message::DisconnectInd { plci, .. }
      | Message::DisconnectConf { plci, .. }
      | Message::Other { plci, .. } => Some(*plci),
      Message::ConnectB3Ind { ncci, .. }
      | Message::ConnectB3Conf { ncci, .. }
      | Message::ConnectB3ActiveInd { ncci, .. }
      | Message::DataB3Ind { ncci, .. }
      | Message::DataB3Conf { ncci, .. }
      | Message::DisconnectB3Ind { ncci, .. }
      | Message::DisconnectB3Conf { ncci, .. } => Some(*ncci),
      Message::ListenConf { .. } => None,
    }
  }
}

/// A request this process sends to the driver. Mirrors `Message` but only for the
/// REQ/RESP phases the core emits.
#[derive(Debug, Clone)]
pub enum Request {
  ListenReq { controller: u32, msg_nr: u16, info_mask: u32, cip_mask: u32 },
  AlertReq { plci: u32, msg_nr: u16 },
  ConnectReq {
    controller: u32,
    msg_nr: u16,
    cip: u16,
    called_party_number: PartyNumber,
    calling_party_number: PartyNumber,
    b1_proto: u16,
    b2_proto: u16,
    b3_proto: u16,
    b3_config: Vec<u8>,
  },
  ConnectResp { plci: u32, msg_nr: u16, accept: u16, b1_proto: u16, b2_proto: u16, b3_proto: u16, b3_config: Vec<u8> },
  SelectBProtocolReq { plci: u32, msg_nr: u16, b1_proto: u16, b2_proto: u16, b3_proto: u16, b3_config: Vec<u8> },
  ConnectB3Req { plci: u32, msg_nr: u16 },
  ConnectB3Resp { ncci: u32, msg_nr: u16, reject: u16 },
  DataB3Req { ncci: u32, msg_nr: u16, handle: u16, data: Vec<u8> },
  DataB3Resp { ncci: u32, msg_nr: u16, handle: u16 },
  FacilityReqDtmfListen { plci: u32, msg_nr: u16, start: bool, tone_duration_tenths: u16, gap_duration_tenths: u16 },
  FacilityRespDtmf { plci: u32, msg_nr: u16 },
  DisconnectReq { plci: u32, msg_nr: u16 },
  DisconnectResp { plci: u32, msg_nr: u16 },
  DisconnectB3Req { ncci: u32, msg_nr: u16 },
}

impl Request {
  pub fn command_subcommand(&self) -> (u8, u8) {
    match self {
      Request::ListenReq { .. } => (command::LISTEN, subcommand::REQ),
      Request::AlertReq { .. } => (command::ALERT, subcommand::REQ),
      Request::ConnectReq { .. } => (command::CONNECT, subcommand::REQ),
      Request::ConnectResp { .. } => (command::CONNECT, subcommand::RESP),
      Request::SelectBProtocolReq { .. } => (command::SELECT_B_PROTOCOL, subcommand::REQ),
      Request::ConnectB3Req { .. } => (command::CONNECT_B3, subcommand::REQ),
      Request::ConnectB3Resp { .. } => (command::CONNECT_B3, subcommand::RESP),
      Request::DataB3Req { .. } => (command::DATA_B3, subcommand::REQ),
      Request::DataB3Resp { .. } => (command::DATA_B3, subcommand::RESP),
      Request::FacilityReqDtmfListen { .. } => (command::FACILITY, subcommand::REQ),
      Request::FacilityRespDtmf { .. } => (command::FACILITY, subcommand::RESP),
      Request::DisconnectReq { .. } => (command::DISCONNECT, subcommand::REQ),
      Request::DisconnectResp { .. } => (command::DISCONNECT, subcommand::RESP),
      Request::DisconnectB3Req { .. } => (command::DISCONNECT_B3, subcommand::REQ),
    }
  }

  pub fn msg_nr(&self) -> u16 {
    match self {
      Request::ListenReq { msg_nr, .. }
      | Request::AlertReq { msg_nr, .. }
      | Request::ConnectReq { msg_nr, .. }
      | Request::ConnectResp { msg_nr, .. }
      | Request::SelectBProtocolReq { msg_nr, .. }
      | Request::ConnectB3Req { msg_nr, .. }
      | Request::ConnectB3Resp { msg_nr, .. }
      | Request::DataB3Req { msg_nr, .. }
      | Request::DataB3Resp { msg_nr, .. }
      | Request::FacilityReqDtmfListen { msg_nr, .. }
      | Request::FacilityRespDtmf { msg_nr, .. }
      | Request::DisconnectReq { msg_nr, .. }
      | Request::DisconnectResp { msg_nr, .. }
      | Request::DisconnectB3Req { msg_nr, .. } => *msg_nr,
    }
  }
}

/// Fixed CAPI message header: total length (incl. header), appl id, command,
/// subcommand, message number. All multi-byte fields are little-endian.
struct Header {
  appl_id: u16,
  command: u8,
  subcommand: u8,
  msg_nr: u16,
}

fn write_header(out: &mut Vec<u8>, appl_id: u16, command: u8, subcommand: u8, msg_nr: u16) {
  out.extend_from_slice(&0u16.to_le_bytes()); // length patched below
  out.extend_from_slice(&appl_id.to_le_bytes());
  out.push(command);
  out.push(subcommand);
  out.extend_from_slice(&msg_nr.to_le_bytes());
}

fn patch_length(buf: &mut [u8]) {
  let len = buf.len() as u16;
  buf[0..2].copy_from_slice(&len.to_le_bytes());
}

fn write_cstruct(out: &mut Vec<u8>, bytes: &[u8]) {
  out.push(bytes.len() as u8);
  out.extend_from_slice(bytes);
}

/// Encode a request into the wire format the driver's `write()` expects.
pub fn encode(req: &Request, appl_id: u16) -> Vec<u8> {
  let (cmd, sub) = req.command_subcommand();
  let mut out = Vec::with_capacity(32);
  write_header(&mut out, appl_id, cmd, sub, req.msg_nr());
  match req {
    Request::ListenReq { controller, info_mask, cip_mask, .. } => {
      out.extend_from_slice(&controller.to_le_bytes());
      out.extend_from_slice(&info_mask.to_le_bytes());
      out.extend_from_slice(&cip_mask.to_le_bytes());
      write_cstruct(&mut out, &[]); // CallerPartyNumber, unused
      write_cstruct(&mut out, &[]); // CallerPartySubaddress, unused
    }
    Request::AlertReq { plci, .. } => {
      out.extend_from_slice(&plci.to_le_bytes());
      write_cstruct(&mut out, &[]);
    }
    Request::ConnectReq { controller, cip, called_party_number, calling_party_number, b1_proto, b2_proto, b3_proto, b3_config, .. } => {
      out.extend_from_slice(&controller.to_le_bytes());
      out.extend_from_slice(&cip.to_le_bytes());
      write_cstruct(&mut out, &called_party_number.encode_called());
      write_cstruct(&mut out, &calling_party_number.encode_calling());
      out.extend_from_slice(&b1_proto.to_le_bytes());
      out.extend_from_slice(&b2_proto.to_le_bytes());
      out.extend_from_slice(&b3_proto.to_le_bytes());
      write_cstruct(&mut out, &[]); // B1 configuration
      write_cstruct(&mut out, &[]); // B2 configuration
      write_cstruct(&mut out, b3_config);
    }
    Request::ConnectResp { plci, accept, b1_proto, b2_proto, b3_proto, b3_config, .. } => {
      out.extend_from_slice(&plci.to_le_bytes());
      out.extend_from_slice(&accept.to_le_bytes());
      out.extend_from_slice(&b1_proto.to_le_bytes());
      out.extend_from_slice(&b2_proto.to_le_bytes());
      out.extend_from_slice(&b3_proto.to_le_bytes());
      write_cstruct(&mut out, &[]);
      write_cstruct(&mut out, &[]);
      write_cstruct(&mut out, b3_config);
    }
    Request::SelectBProtocolReq { plci, b1_proto, b2_proto, b3_proto, b3_config, .. } => {
      out.extend_from_slice(&plci.to_le_bytes());
      out.extend_from_slice(&b1_proto.to_le_bytes());
      out.extend_from_slice(&b2_proto.to_le_bytes());
      out.extend_from_slice(&b3_proto.to_le_bytes());
      write_cstruct(&mut out, &[]);
      write_cstruct(&mut out, &[]);
      write_cstruct(&mut out, b3_config);
    }
    Request::ConnectB3Req { plci, .. } => {
      out.extend_from_slice(&plci.to_le_bytes());
      write_cstruct(&mut out, &[]);
    }
    Request::ConnectB3Resp { ncci, reject, .. } => {
      out.extend_from_slice(&ncci.to_le_bytes());
      out.extend_from_slice(&reject.to_le_bytes());
      write_cstruct(&mut out, &[]);
    }
    Request::DataB3Req { ncci, handle, data, .. } => {
      out.extend_from_slice(&ncci.to_le_bytes());
      out.extend_from_slice(&(data.len() as u32).to_le_bytes());
      out.extend_from_slice(&handle.to_le_bytes());
      out.extend_from_slice(&0u16.to_le_bytes()); // flags
      out.extend_from_slice(data);
    }
    Request::DataB3Resp { ncci, handle, .. } => {
      out.extend_from_slice(&ncci.to_le_bytes());
      out.extend_from_slice(&handle.to_le_bytes());
    }
    Request::FacilityReqDtmfListen { plci, start, tone_duration_tenths, gap_duration_tenths, .. } => {
      out.extend_from_slice(&plci.to_le_bytes());
      out.extend_from_slice(&super::constants::facility_selector::DTMF.to_le_bytes());
      let mut param = Vec::new();
      param.push(if *start { 1 } else { 2 }); // 1 = start listen, 2 = stop listen
      param.extend_from_slice(&0u16.to_le_bytes()); // send-tone struct: empty
      let mut characteristics = Vec::new();
      characteristics.extend_from_slice(&tone_duration_tenths.to_le_bytes());
      characteristics.extend_from_slice(&gap_duration_tenths.to_le_bytes());
      write_cstruct(&mut param, &characteristics);
      write_cstruct(&mut out, &param);
    }
    Request::FacilityRespDtmf { plci, .. } => {
      out.extend_from_slice(&plci.to_le_bytes());
      out.extend_from_slice(&super::constants::facility_selector::DTMF.to_le_bytes());
      write_cstruct(&mut out, &[]);
    }
    Request::DisconnectReq { plci, .. } => {
      out.extend_from_slice(&plci.to_le_bytes());
      write_cstruct(&mut out, &[]);
    }
    Request::DisconnectResp { plci, .. } => {
      out.extend_from_slice(&plci.to_le_bytes());
    }
    Request::DisconnectB3Req { ncci, .. } => {
      out.extend_from_slice(&ncci.to_le_bytes());
      write_cstruct(&mut out, &[]);
    }
  }
  patch_length(&mut out);
  out
}

struct Cursor<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> Cursor<'a> {
  fn new(buf: &'a [u8]) -> Cursor<'a> {
    Cursor { buf, pos: 0 }
  }
  fn u8(&mut self) -> Result<u8> {
    let v = *self.buf.get(self.pos).ok_or_else(err_short)?;
    self.pos += 1;
    Ok(v)
  }
  fn u16(&mut self) -> Result<u16> {
    let b = self.buf.get(self.pos..self.pos + 2).ok_or_else(err_short)?;
    self.pos += 2;
    Ok(u16::from_le_bytes([b[0], b[1]]))
  }
  fn u32(&mut self) -> Result<u32> {
    let b = self.buf.get(self.pos..self.pos + 4).ok_or_else(err_short)?;
    self.pos += 4;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
  }
  fn cstruct(&mut self) -> Result<Vec<u8>> {
    let len = self.u8()? as usize;
    let b = self.buf.get(self.pos..self.pos + len).ok_or_else(err_short)?;
    self.pos += len;
    Ok(b.to_vec())
  }
  fn rest(&mut self) -> &'a [u8] {
    let b = &self.buf[self.pos.min(self.buf.len())..];
    self.pos = self.buf.len();
    b
  }
}

fn err_short() -> CapiError {
  CapiError::Protocol("truncated CAPI message".to_string())
}

/// Decode a single message received from the driver's `read()`.
pub fn decode(raw: &[u8]) -> Result<Message> {
  if raw.len() < 8 {
    return Err(err_short());
  }
  let header = Header {
    appl_id: u16::from_le_bytes([raw[2], raw[3]]),
    command: raw[4],
    subcommand: raw[5],
    msg_nr: u16::from_le_bytes([raw[6], raw[7]]),
  };
  let _ = header.appl_id;
  let mut c = Cursor::new(&raw[8..]);
  let msg_nr = header.msg_nr;

  use command::*;
  use subcommand::*;
  Ok(match (header.command, header.subcommand) {
    (LISTEN, CONF) => {
      let controller = c.u32()?;
      let info = c.u16()?;
      Message::ListenConf { controller, msg_nr, info }
    }
    (CONNECT, IND) => {
      let plci = c.u32()?;
      let cip = c.u16()?;
      let called = c.cstruct()?;
      let calling = c.cstruct()?;
      Message::ConnectInd {
        plci,
        msg_nr,
        cip,
        called_party_number: PartyNumber::decode_called(&called)?,
        calling_party_number: PartyNumber::decode_calling(&calling)?,
      }
    }
    (CONNECT, CONF) => {
      let plci = c.u32()?;
      let info = c.u16()?;
      Message::ConnectConf { plci, msg_nr, info }
    }
    (CONNECT_ACTIVE, IND) => {
      let plci = c.u32()?;
      Message::ConnectActiveInd { plci, msg_nr }
    }
    (ALERT, CONF) => {
      let plci = c.u32()?;
      let info = c.u16()?;
      Message::AlertConf { plci, msg_nr, info }
    }
    (INFO, IND) => {
      let plci = c.u32()?;
      let number = c.u16()?;
      let element = c.cstruct()?;
      match number {
        n if n == super::constants::info_number::ALERTING => Message::InfoIndAlerting { plci, msg_nr },
        n if n == super::constants::info_number::CALLED_PARTY_NUMBER => {
          Message::InfoIndCalledPartyNumber { plci, msg_nr, number: PartyNumber::decode_called(&element)? }
        }
        _ => Message::Other { command: INFO, subcommand: IND, plci, msg_nr },
      }
    }
    (INFO, CONF) => {
      let plci = c.u32()?;
      let info = c.u16()?;
      Message::InfoConf { plci, msg_nr, info }
    }
    (SELECT_B_PROTOCOL, CONF) => {
      let plci = c.u32()?;
      let info = c.u16()?;
      Message::SelectBProtocolConf { plci, msg_nr, info }
    }
    (FACILITY, IND) => {
      let plci = c.u32()?;
      let selector = c.u16()?;
      let param = c.cstruct()?;
      if selector == super::constants::facility_selector::DTMF {
        // DTMF facility indication parameter: [len][digit0..digitN]
        let digits = param.get(1..).unwrap_or(&[]).to_vec();
        Message::FacilityIndDtmf { plci, msg_nr, digits }
      } else {
        Message::Other { command: FACILITY, subcommand: IND, plci, msg_nr }
      }
    }
    (FACILITY, CONF) => {
      let plci = c.u32()?;
      let selector = c.u16()?;
      let info = c.u16()?;
      if selector == super::constants::facility_selector::DTMF {
        Message::FacilityConfDtmf { plci, msg_nr, info }
      } else {
        Message::Other { command: FACILITY, subcommand: CONF, plci, msg_nr }
      }
    }
    (DISCONNECT, IND) => {
      let plci = c.u32()?;
      let reason = c.u16()?;
      Message::DisconnectInd { plci, msg_nr, reason }
    }
    (DISCONNECT, CONF) => {
      let plci = c.u32()?;
      let info = c.u16()?;
      Message::DisconnectConf { plci, msg_nr, info }
    }
    (CONNECT_B3, IND) => {
      let ncci = c.u32()?;
      let ncpi = c.cstruct()?;
      Message::ConnectB3Ind { ncci, msg_nr, ncpi }
    }
    (CONNECT_B3, CONF) => {
      let ncci = c.u32()?;
      let info = c.u16()?;
      Message::ConnectB3Conf { ncci, msg_nr, info }
    }
    (CONNECT_B3_ACTIVE, IND) => {
      let ncci = c.u32()?;
      let ncpi = c.cstruct()?;
      Message::ConnectB3ActiveInd { ncci, msg_nr, ncpi }
    }
    (DATA_B3, IND) => {
      let ncci = c.u32()?;
      let _len = c.u32()?;
      let handle = c.u16()?;
      let _flags = c.u16()?;
      let data = c.rest().to_vec();
      Message::DataB3Ind { ncci, msg_nr, handle, data }
    }
    (DATA_B3, CONF) => {
      let ncci = c.u32()?;
      let handle = c.u16()?;
      let info = c.u16()?;
      Message::DataB3Conf { ncci, msg_nr, handle, info }
    }
    (DISCONNECT_B3, IND) => {
      let ncci = c.u32()?;
      let reason_b3 = c.u16()?;
      let ncpi = c.cstruct()?;
      Message::DisconnectB3Ind { ncci, msg_nr, reason_b3, ncpi }
    }
    (DISCONNECT_B3, CONF) => {
      let ncci = c.u32()?;
      let info = c.u16()?;
      Message::DisconnectB3Conf { ncci, msg_nr, info }
    }
    (cmd, sub) => {
      let plci = c.u32().unwrap_or(0);
      Message::Other { command: cmd, subcommand: sub, plci, msg_nr }
    }
  })
}
