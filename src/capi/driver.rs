//! Adapter over the Linux kernel CAPI subsystem (`/dev/capi20`).
//!
//! All interaction with the kernel driver goes through this trait so the rest of the
//! engine (and its tests) can run against an in-memory fake instead of a real ISDN
//! controller. Production code talks to the character device with `nix`'s ioctl and
//! poll wrappers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

use crate::error::{CapiError, Result};

const CAPI_DEVICE: &str = "/dev/capi20";

// ioctl numbers from <linux/capi.h>, magic 'C' (0x43).
const CAPI_IOC_MAGIC: u8 = b'C';

nix::ioctl_read!(capi_get_manufacturer, CAPI_IOC_MAGIC, 1, [u8; 64]);
nix::ioctl_read!(capi_get_version, CAPI_IOC_MAGIC, 2, [u32; 4]);
nix::ioctl_read!(capi_get_serial, CAPI_IOC_MAGIC, 3, [u8; 8]);
nix::ioctl_read!(capi_get_profile, CAPI_IOC_MAGIC, 4, [u8; 64]);
nix::ioctl_readwrite!(capi_manufacturer_cmd, CAPI_IOC_MAGIC, 5, [u8; 512]);
nix::ioctl_read!(capi_get_errcode, CAPI_IOC_MAGIC, 6, u16);
nix::ioctl_read!(capi_installed, CAPI_IOC_MAGIC, 7, u32);
nix::ioctl_readwrite!(capi_register, CAPI_IOC_MAGIC, 8, CapiRegisterParams);

/// Mirrors `struct capi_register_params` from `<linux/capi.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CapiRegisterParams {
  pub level3cnt: u32,
  pub datablkcnt: u32,
  pub datablklen: u32,
}

/// A controller's hardware profile, as reported by `CAPI_GET_PROFILE`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Profile {
  pub num_controllers: u16,
  pub num_b_channels: u16,
  pub global_options: u32,
  pub b1_protocols: u32,
  pub b2_protocols: u32,
  pub b3_protocols: u32,
}

/// Everything the controller and connection engine need from the kernel CAPI layer.
pub trait CapiDriver: Send + Sync {
  /// True if the CAPI subsystem has at least one registered controller.
  fn is_installed(&self) -> Result<bool>;
  /// Register this application, requesting buffering for up to `max_logical_connections`
  /// simultaneous NCCIs of at most `max_b_data_block_size` bytes, `max_b_data_blocks` deep.
  fn register(&mut self, max_logical_connections: u32, max_b_data_blocks: u32, max_b_data_block_size: u32) -> Result<()>;
  fn get_profile(&self, controller: u32) -> Result<Profile>;
  /// Block up to `timeout` for a message to become readable; `None` means no message arrived.
  fn wait_for_message(&self, timeout: Duration) -> Result<bool>;
  /// Read one complete message (blocking). Only call after `wait_for_message` returns true.
  fn get_message(&mut self) -> Result<Vec<u8>>;
  /// Send one complete, already-encoded message to the driver.
  fn put_message(&mut self, bytes: &[u8]) -> Result<()>;
}

/// Production driver, talking to the real kernel character device.
pub struct LinuxCapiDriver {
  file: File,
}

impl LinuxCapiDriver {
  pub fn open() -> Result<LinuxCapiDriver> {
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .open(CAPI_DEVICE)
      .map_err(|e| CapiError::Configuration(format!("opening {}: {}", CAPI_DEVICE, e)))?;
    Ok(LinuxCapiDriver { file })
  }
}

impl CapiDriver for LinuxCapiDriver {
  fn is_installed(&self) -> Result<bool> {
    let mut installed: u32 = 0;
    unsafe { capi_installed(self.file.as_raw_fd(), &mut installed) }
      .map_err(|e| CapiError::Driver(e as i32 as u16))?;
    Ok(installed != 0)
  }

  fn register(&mut self, max_logical_connections: u32, max_b_data_blocks: u32, max_b_data_block_size: u32) -> Result<()> {
    let mut params = CapiRegisterParams {
      level3cnt: max_logical_connections,
      datablkcnt: max_b_data_blocks,
      datablklen: max_b_data_block_size,
    };
    unsafe { capi_register(self.file.as_raw_fd(), &mut params) }
      .map_err(|e| CapiError::Driver(e as i32 as u16))?;
    Ok(())
  }

  fn get_profile(&self, controller: u32) -> Result<Profile> {
    let mut raw = [0u8; 64];
    raw[0..2].copy_from_slice(&(controller as u16).to_le_bytes());
    unsafe { capi_get_profile(self.file.as_raw_fd(), &mut raw) }
      .map_err(|e| CapiError::Driver(e as i32 as u16))?;
    Ok(Profile {
      num_controllers: u16::from_le_bytes([raw[0], raw[1]]),
      num_b_channels: u16::from_le_bytes([raw[2], raw[3]]),
      global_options: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
      b1_protocols: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
      b2_protocols: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
      b3_protocols: u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]),
    })
  }

  fn wait_for_message(&self, timeout: Duration) -> Result<bool> {
    let mut fds = [PollFd::new(&self.file, PollFlags::POLLIN)];
    let millis: i32 = timeout.as_millis().try_into().unwrap_or(i32::MAX);
    let n = poll(&mut fds, millis).map_err(|e| CapiError::Driver(e as i32 as u16))?;
    Ok(n > 0)
  }

  fn get_message(&mut self) -> Result<Vec<u8>> {
    let mut header = [0u8; 2];
    self.file.read_exact(&mut header).map_err(|e| CapiError::Driver(io_err_code(&e)))?;
    let total_len = u16::from_le_bytes(header) as usize;
    if total_len < 2 {
      return Err(CapiError::Protocol("message shorter than its own header".to_string()));
    }
    let mut rest = vec![0u8; total_len - 2];
    self.file.read_exact(&mut rest).map_err(|e| CapiError::Driver(io_err_code(&e)))?;
    let mut full = Vec::with_capacity(total_len);
    full.extend_from_slice(&header);
    full.extend_from_slice(&rest);
    Ok(full)
  }

  fn put_message(&mut self, bytes: &[u8]) -> Result<()> {
    self.file.write_all(bytes).map_err(|e| CapiError::Driver(io_err_code(&e)))
  }
}

fn io_err_code(e: &std::io::Error) -> u16 {
  e.raw_os_error().unwrap_or(0) as u16
}

#[cfg(test)]
pub mod fake {
  use super::*;
  use std::collections::VecDeque;

  /// In-memory driver for tests: `inbox` feeds `get_message`, `outbox` records what
  /// the engine sent.
  #[derive(Default)]
  pub struct FakeDriver {
    pub inbox: VecDeque<Vec<u8>>,
    pub outbox: Vec<Vec<u8>>,
    pub installed: bool,
    pub profile: Profile,
  }

  impl CapiDriver for FakeDriver {
    fn is_installed(&self) -> Result<bool> {
      Ok(self.installed)
    }
    fn register(&mut self, _: u32, _: u32, _: u32) -> Result<()> {
      Ok(())
    }
    fn get_profile(&self, _controller: u32) -> Result<Profile> {
      Ok(self.profile)
    }
    fn wait_for_message(&self, _timeout: Duration) -> Result<bool> {
      Ok(!self.inbox.is_empty())
    }
    fn get_message(&mut self) -> Result<Vec<u8>> {
      self.inbox.pop_front().ok_or_else(|| CapiError::Protocol("no message queued".to_string()))
    }
    fn put_message(&mut self, bytes: &[u8]) -> Result<()> {
      self.outbox.push(bytes.to_vec());
      Ok(())
    }
  }
}
