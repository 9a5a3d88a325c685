//! capid: a CAPI 2.0 protocol engine server mediating between ISDN hardware and
//! call-handling logic. Process bootstrap, daemonizing, and signal handling live
//! here; the protocol engine itself is in `controller`/`connection`/`modules`.

mod capi;
mod config;
mod connection;
mod controller;
mod error;
mod modules;
mod observer;
mod scripting;
mod silence;

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Local;
use fork::Fork;
use log::{error, info, warn, LevelFilter};
use nix::libc::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::capi::driver::LinuxCapiDriver;
use crate::config::Config;
use crate::connection::{Connection, DisconnectMode, FaxParams, Service};
use crate::controller::{Controller, ControllerConfig};
use crate::scripting::{IdleTimer, IdleTimerHandler, ScriptDispatcher};

/// PID file path.
const PID_FILE: &str = "/var/run/capid.pid";

/// Command line arguments.
#[derive(Debug)]
struct CmdLineConfig {
  /// Configuration file to use, default is /etc/capid.conf
  config_file: String,
  /// fork() yes/no. Default: yes
  fork: bool,
}

impl CmdLineConfig {
  /// Parses command line arguments.
  /// -? -> help text, abort
  /// -n -> no fork()
  /// -f configfile -> configuration file to use
  fn parse_cmd_line(mut args: impl Iterator<Item = String>) -> Result<CmdLineConfig, String> {
    args.next(); // own path
    let mut cmd_line_config = CmdLineConfig { config_file: format!("/etc/{}.conf", env!("CARGO_PKG_NAME")), fork: true };
    loop {
      match args.next() {
        Some(val) => match val.as_str() {
          "-?" => return Err(String::new()),
          "-n" => cmd_line_config.fork = false,
          "-f" => {
            cmd_line_config.config_file = match args.next() {
              Some(v) => v,
              None => return Err("-f requires a configuration file argument".to_string()),
            }
          }
          _ => return Err(format!("unknown argument {val}")),
        },
        None => break,
      }
    }
    Ok(cmd_line_config)
  }
}

fn main() {
  let cmd_line_config = match CmdLineConfig::parse_cmd_line(env::args()) {
    Ok(v) => v,
    Err(message) => {
      println!("usage: {} [-n] [-f configfile]", env!("CARGO_PKG_NAME"));
      println!("  -n              do not fork() into the background");
      println!("  -f configfile   configuration file to use");
      if !message.is_empty() {
        println!("{message}");
      }
      return;
    }
  };

  let config = match Config::load(&cmd_line_config.config_file) {
    Ok(c) => c,
    Err(e) => {
      eprintln!("configuration error: {e}");
      process::exit(1);
    }
  };

  init_logging(&config);

  if let Err(e) = run(cmd_line_config, config) {
    error!("start error: {e}");
    process::exit(1);
  }
}

fn init_logging(config: &Config) {
  let level = match config.log_level {
    0 => LevelFilter::Error,
    1 => LevelFilter::Warn,
    2 => LevelFilter::Info,
    _ => LevelFilter::Debug,
  };
  env_logger::Builder::new().filter_level(level).format_timestamp_millis().init();
}

fn write_pidfile(pid: i32) {
  if fs::write(PID_FILE, pid.to_string()).is_err() {
    warn!("could not write PID file {PID_FILE}");
  }
}

fn del_pidfile() {
  fs::remove_file(PID_FILE).unwrap_or(());
}

fn run(cmd_line_config: CmdLineConfig, config: Config) -> Result<(), String> {
  println!("{} v{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"), env!("CARGO_PKG_HOMEPAGE"));

  if cmd_line_config.fork && config.fork {
    info!("fork()");
    match fork::fork() {
      Ok(Fork::Parent(child_pid)) => {
        write_pidfile(child_pid);
        return Ok(());
      }
      Ok(Fork::Child) => {}
      Err(_) => return Err("fork() failed".to_string()),
    }
  }

  let driver = LinuxCapiDriver::open().map_err(|e| e.to_string())?;
  let controller_config = ControllerConfig {
    controller_id: config.controller_id,
    max_logical_connections: config.max_logical_connections,
    max_b_data_blocks: config.max_b_data_blocks,
    max_b_data_block_size: config.max_b_data_block_size,
    ddi: config.ddi_config(),
  };
  let controller = Arc::new(Controller::new(Box::new(driver), controller_config).map_err(|e| e.to_string())?);

  if controller.listen_voice().is_err() {
    warn!("controller profile has no transparent capability; voice calls will not be accepted");
  }
  if controller.listen_fax().is_err() {
    warn!("controller profile has no fax-G3 capability; fax calls will not be accepted");
  }

  if config.incoming_script_path.is_some() {
    warn!("incoming_script_path is configured but no external script interpreter is built in; using the built-in answering-machine handler instead");
  }
  let incoming = Arc::new(AnsweringMachineHandler { recordings_dir: env::temp_dir() });
  controller.set_incoming_handler(Arc::new(ScriptDispatcher::new(incoming)));

  let idle_timer = Mutex::new(start_idle_timer(&config));
  let stop = Arc::new(AtomicBool::new(false));
  let stop_for_signals = stop.clone();
  let config_path = cmd_line_config.config_file.clone();

  thread::Builder::new()
    .name("capid-signals".to_string())
    .spawn(move || {
      let mut signals = match Signals::new(&[SIGTERM, SIGINT, SIGQUIT, SIGHUP]) {
        Ok(s) => s,
        Err(e) => {
          error!("failed to install signal handlers: {e}");
          return;
        }
      };
      for signal in signals.forever() {
        if signal == SIGHUP {
          info!("SIGHUP: reloading configuration from {config_path}");
          match Config::load(&config_path) {
            Ok(new_config) => *idle_timer.lock().unwrap() = start_idle_timer(&new_config),
            Err(e) => error!("reload failed, keeping previous configuration: {e}"),
          }
        } else {
          info!("received signal {signal}, shutting down");
          stop_for_signals.store(true, Ordering::SeqCst);
          break;
        }
      }
    })
    .map_err(|e| e.to_string())?;

  // Single blocking reader task (§5): everything else runs on call/idle threads.
  controller.run_reader(|| stop.load(Ordering::SeqCst));

  del_pidfile();
  Ok(())
}

fn start_idle_timer(config: &Config) -> Option<IdleTimer> {
  if config.idle_script_interval_seconds == 0 {
    return None;
  }
  if config.idle_script_path.is_some() {
    warn!("idle_script_path is configured but no external script interpreter is built in; ticking a no-op handler instead");
  }
  Some(IdleTimer::start(Arc::new(LoggingIdleHandler), Duration::from_secs(config.idle_script_interval_seconds as u64)))
}

struct LoggingIdleHandler;
impl IdleTimerHandler for LoggingIdleHandler {
  fn handle_idle_tick(&self) {
    info!("idle tick");
  }
}

/// Default call handler: answers as a plain voice mailbox, recording to a file
/// named after the caller and the time of the call. Stands in for the external
/// script interpreter the core deliberately leaves unimplemented.
struct AnsweringMachineHandler {
  recordings_dir: PathBuf,
}

impl scripting::IncomingCallHandler for AnsweringMachineHandler {
  fn handle_call(&self, connection: Arc<Connection>) {
    info!("incoming call {} -> {}", connection.caller_number(), connection.callee_number());
    if let Err(e) = modules::accept::execute(&connection, Service::Voice, &FaxParams::default(), Duration::from_secs(30)) {
      warn!("accept failed: {e}");
      return;
    }
    let filename = format!("{}-{}.al", connection.caller_number(), Local::now().format("%Y%m%d%H%M%S"));
    let path = self.recordings_dir.join(filename);
    match modules::audio_receive::execute(&connection, &path, 5, false, Duration::from_secs(180)) {
      Ok(result) => info!("recorded {} bytes to {} ({:?})", result.bytes_written, path.display(), result.reason),
      Err(e) => warn!("receive failed: {e}"),
    }
    let _ = modules::reject_disconnect::execute(&connection, 0, DisconnectMode::All, Duration::from_secs(5));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_cmd_line_defaults() {
    let cmd_line_config = CmdLineConfig::parse_cmd_line(vec!["".to_string()].into_iter()).expect("no arguments is valid");
    assert!(cmd_line_config.fork);
    assert_eq!(cmd_line_config.config_file, format!("/etc/{}.conf", env!("CARGO_PKG_NAME")));
  }

  #[test]
  fn parse_cmd_line_help_flag() {
    let msg = CmdLineConfig::parse_cmd_line(vec!["".to_string(), "-?".to_string()].into_iter())
      .expect_err("-? must produce an empty Err");
    assert_eq!(msg, "");
  }

  #[test]
  fn parse_cmd_line_rejects_unknown_argument() {
    let msg = CmdLineConfig::parse_cmd_line(vec!["".to_string(), "-blabla".to_string()].into_iter())
      .expect_err("unknown argument must produce Err");
    assert_eq!(msg, "unknown argument -blabla");
  }

  #[test]
  fn parse_cmd_line_f_without_file_is_an_error() {
    let msg = CmdLineConfig::parse_cmd_line(vec!["".to_string(), "-f".to_string()].into_iter())
      .expect_err("-f without a file must produce Err");
    assert_eq!(msg, "-f requires a configuration file argument");
  }

  #[test]
  fn parse_cmd_line_n_and_f_combine() {
    let cmd_line_config = CmdLineConfig::parse_cmd_line(
      vec!["".to_string(), "-n".to_string(), "-f".to_string(), "configfilename".to_string()].into_iter(),
    )
    .expect("valid arguments");
    assert!(!cmd_line_config.fork);
    assert_eq!(cmd_line_config.config_file, "configfilename");
  }
}
