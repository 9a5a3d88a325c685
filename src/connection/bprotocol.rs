//! Builds the B1/B2/B3 protocol numbers and configuration blob CONNECT_RESP,
//! CONNECT_REQ and SELECT_B_PROTOCOL_REQ need for a given service.

use crate::capi::constants::b_protocol;
use crate::error::{CapiError, Result};

/// One of the services the engine negotiates B-channel protocols for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
  Voice,
  FaxG3,
}

/// Bits from the controller profile this builder needs to check capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerCapability {
  pub transparent: bool,
  pub fax: bool,
  pub fax_extended: bool,
  /// True for AVM-manufactured controllers, which need their fax headline
  /// transcoded from ISO-8859-1 to CP437 before being sent in the B3 config.
  pub is_avm: bool,
}

/// Fax-specific parameters carried in the B3 configuration blob.
#[derive(Debug, Clone, Default)]
pub struct FaxParams {
  pub station_id: String,
  pub headline: String,
}

/// B1/B2/B3 protocol numbers plus the B3 configuration blob.
pub struct BConfig {
  pub b1: u16,
  pub b2: u16,
  pub b3: u16,
  pub b3_config: Vec<u8>,
}

/// Build the protocol/config tuple for `service`, validating against what the
/// controller's profile actually supports.
pub fn build(service: Service, capability: ControllerCapability, fax: &FaxParams) -> Result<BConfig> {
  match service {
    Service::Voice => {
      if !capability.transparent {
        return Err(CapiError::External("controller does not support transparent B-protocol".to_string()));
      }
      Ok(BConfig {
        b1: b_protocol::B1_TRANSPARENT,
        b2: b_protocol::B2_TRANSPARENT,
        b3: b_protocol::B3_TRANSPARENT,
        b3_config: Vec::new(),
      })
    }
    Service::FaxG3 => {
      if !capability.fax && !capability.fax_extended {
        return Err(CapiError::External("controller does not support fax-G3".to_string()));
      }
      if fax.station_id.len() > 20 {
        return Err(CapiError::External("fax station id longer than 20 characters".to_string()));
      }
      if fax.headline.len() > 254 {
        return Err(CapiError::External("fax headline longer than 254 characters".to_string()));
      }
      let b3 = if capability.fax_extended { b_protocol::B3_T30_EXTENDED } else { b_protocol::B3_T30 };
      let headline = if capability.is_avm {
        transcode_headline_for_avm(&fax.headline)
      } else {
        fax.headline.as_bytes().to_vec()
      };
      Ok(BConfig {
        b1: b_protocol::B1_T30_MODEM,
        b2: b_protocol::B2_T30,
        b3,
        b3_config: build_fax_config_blob(fax.station_id.as_bytes(), &headline),
      })
    }
  }
}

/// `[len][resolution,color-accept][format,0][stationID.len][stationID][headline.len][headline]`
fn build_fax_config_blob(station: &[u8], headline: &[u8]) -> Vec<u8> {
  let len = 2 + 2 + 1 + station.len() + 1 + headline.len();
  let mut out = Vec::with_capacity(1 + len);
  out.push(len as u8);
  out.push(0x00);
  out.push(0x04); // standard resolution, color-capable acceptance bit set
  out.push(0x00);
  out.push(0x00); // format: SFF
  out.push(station.len() as u8);
  out.extend_from_slice(station);
  out.push(headline.len() as u8);
  out.extend_from_slice(headline);
  out
}

/// Best-effort ISO-8859-1 → CP437 transcoding for fax headlines, required only by
/// AVM-manufactured controllers. Each input `char` is ISO-8859-1, so its code point
/// already equals the Latin-1 byte value; only the handful of accented letters CP437
/// relocates need remapping, everything else (incl. plain ASCII) passes through as-is.
pub fn transcode_headline_for_avm(headline: &str) -> Vec<u8> {
  headline
    .chars()
    .map(|c| match c {
      '\u{00e4}' => 0x84, // ä
      '\u{00f6}' => 0x94, // ö
      '\u{00fc}' => 0x81, // ü
      '\u{00c4}' => 0x8e, // Ä
      '\u{00d6}' => 0x99, // Ö
      '\u{00dc}' => 0x9a, // Ü
      '\u{00df}' => 0xe1, // ß
      other if (other as u32) < 0x80 => other as u8,
      other => (other as u32).min(0xff) as u8,
    })
    .collect()
}
