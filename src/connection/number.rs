//! Rendering a parsed [`crate::capi::PartyNumber`] into the canonical display form.

use crate::capi::PartyNumber;

/// `+`-prefixed for international numbers, `0`-prefixed for national, `-` for empty.
pub fn format_number(number: &PartyNumber) -> String {
  if number.digits.is_empty() {
    return "-".to_string();
  }
  let digits = String::from_utf8_lossy(&number.digits);
  match number.type_plan & 0x70 {
    0x10 => format!("+{}", digits),
    0x20 => format!("0{}", digits),
    _ => digits.into_owned(),
  }
}
