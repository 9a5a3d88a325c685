//! Configuration loader: reads the INI file the core is handed (§6) into a typed
//! [`Config`], validating every numeric key up front so a bad config file fails
//! fast at startup instead of surfacing as a confusing runtime error later.
//!
//! Layout is one `[sectionname]` block per concern: a `[capid]` section carries
//! the controller/log/DDI keys, with `[incoming]` / `[idle]` sections for the two
//! script paths.

use configparser::ini::Ini;
use std::collections::HashMap;

use crate::error::{CapiError, Result};

type RawSection = HashMap<String, Option<String>>;

/// Everything the core reads out of the configuration file at startup.
#[derive(Debug, Clone)]
pub struct Config {
  pub controller_id: u32,
  pub max_logical_connections: u32,
  pub max_b_data_blocks: u32,
  pub max_b_data_block_size: u32,
  pub incoming_script_path: Option<String>,
  pub idle_script_path: Option<String>,
  pub idle_script_interval_seconds: u32,
  pub log_file: Option<String>,
  pub log_level: u8,
  pub error_log_file: Option<String>,
  pub ddi_length: u32,
  pub ddi_base_length: u32,
  pub ddi_stop_numbers: Vec<String>,
  /// Overridden by `-n` on the command line (`CmdLineConfig::fork`).
  pub fork: bool,
}

impl Default for Config {
  fn default() -> Config {
    Config {
      controller_id: 1,
      max_logical_connections: 2,
      max_b_data_blocks: 7,
      max_b_data_block_size: 2048,
      incoming_script_path: None,
      idle_script_path: None,
      idle_script_interval_seconds: 0,
      log_file: None,
      log_level: 1,
      error_log_file: None,
      ddi_length: 0,
      ddi_base_length: 0,
      ddi_stop_numbers: Vec::new(),
      fork: true,
    }
  }
}

impl Config {
  /// Load and validate `path`. An unreadable file or a non-numeric value where a
  /// number is required is a fatal configuration error (§7).
  pub fn load(path: &str) -> Result<Config> {
    let mut ini = Ini::new();
    let sections = ini
      .load(path)
      .map_err(|e| CapiError::Configuration(format!("reading {}: {}", path, e)))?;
    Self::from_sections(&sections)
  }

  fn from_sections(sections: &HashMap<String, RawSection>) -> Result<Config> {
    let mut cfg = Config::default();
    let empty = HashMap::new();
    let capid = sections.get("capid").unwrap_or(&empty);
    let incoming = sections.get("incoming").unwrap_or(&empty);
    let idle = sections.get("idle").unwrap_or(&empty);

    if let Some(v) = string_opt(capid, "controller") {
      cfg.controller_id = parse_u32("controller", &v)?;
    }
    if let Some(v) = string_opt(capid, "max_logical_connections") {
      cfg.max_logical_connections = parse_u32("max_logical_connections", &v)?;
    }
    if let Some(v) = string_opt(capid, "max_b_data_blocks") {
      cfg.max_b_data_blocks = parse_u32("max_b_data_blocks", &v)?;
    }
    if let Some(v) = string_opt(capid, "max_b_data_block_size") {
      cfg.max_b_data_block_size = parse_u32("max_b_data_block_size", &v)?;
    }
    cfg.log_file = string_opt(capid, "log_file");
    cfg.error_log_file = string_opt(capid, "error_log_file");
    if let Some(v) = string_opt(capid, "log_level") {
      let level = parse_u32("log_level", &v)?;
      if level > 3 {
        return Err(CapiError::Configuration("log_level must be 0..=3".to_string()));
      }
      cfg.log_level = level as u8;
    }
    if let Some(v) = string_opt(capid, "ddi_length") {
      cfg.ddi_length = parse_u32("ddi_length", &v)?;
    }
    if let Some(v) = string_opt(capid, "ddi_base_length") {
      cfg.ddi_base_length = parse_u32("ddi_base_length", &v)?;
    }
    if let Some(v) = string_opt(capid, "ddi_stop_numbers") {
      cfg.ddi_stop_numbers = v
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    }

    cfg.incoming_script_path = string_opt(incoming, "incoming_script_path").or_else(|| string_opt(incoming, "path"));
    cfg.idle_script_path = string_opt(idle, "idle_script_path").or_else(|| string_opt(idle, "path"));
    if let Some(v) = string_opt(idle, "idle_script_interval_seconds").or_else(|| string_opt(idle, "interval")) {
      cfg.idle_script_interval_seconds = parse_u32("idle_script_interval_seconds", &v)?;
    }

    Ok(cfg)
  }

  /// `Some(DdiConfig)` when `ddi_length > 0`, matching "point-to-point configurations"
  /// being opt-in (§3, §4.2).
  pub fn ddi_config(&self) -> Option<crate::connection::DdiConfig> {
    if self.ddi_length == 0 {
      return None;
    }
    Some(crate::connection::DdiConfig {
      length: self.ddi_length as usize,
      base_length: self.ddi_base_length as usize,
      stop_numbers: self.ddi_stop_numbers.clone(),
    })
  }
}

fn string_opt(section: &RawSection, key: &str) -> Option<String> {
  section.get(key).and_then(|v| v.clone()).filter(|v| !v.is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
  value
    .parse::<u32>()
    .map_err(|_| CapiError::Configuration(format!("{} must be a decimal non-negative number, got {:?}", key, value)))
}
