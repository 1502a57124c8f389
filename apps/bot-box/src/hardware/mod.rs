//! Robot-side command and telemetry transports.
//!
//! Every transport looks the same from the outside: a [`CommandSink`] that
//! accepts addressed commands and a stream of raw telemetry lines. Whatever
//! happens on the wire (a serial line dropping, the robot process restarting)
//! is handled inside the transport task with a fixed backoff.

use std::time::Duration;

use arena_proto::HardwareCommand;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::HardwareSettings;

pub mod console;
pub mod ipc;
#[cfg(unix)]
pub mod serial;

pub(crate) const TARGET: &str = "bot_box::hardware";
pub(crate) const COMMAND_CAPACITY: usize = 128;
pub(crate) const TELEMETRY_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[cfg(unix)]
    #[error("failed to configure {path}: {source}")]
    Termios { path: String, source: nix::Error },
    #[error("unsupported baud rate {0}")]
    UnsupportedBaud(u32),
    #[error("failed to bind the ipc socket on port {port}: {source}")]
    Bind {
        port: u16,
        source: zeromq::ZmqError,
    },
    #[error("serial hardware is not available on this platform")]
    Unsupported,
}

/// Cloneable handle for queuing commands to the robot.
#[derive(Clone, Debug)]
pub struct CommandSink {
    tx: mpsc::Sender<String>,
}

impl CommandSink {
    /// A sink plus the raw line receiver behind it.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queues a command without waiting. Returns `false` if it was dropped.
    pub fn send(&self, command: &HardwareCommand) -> bool {
        let line = match command.to_line() {
            Ok(line) => line,
            Err(err) => {
                warn!(target: TARGET, error = %err, "failed to encode hardware command");
                return false;
            }
        };
        match self.tx.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: TARGET, address = command.address, "command queue full; dropping command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(target: TARGET, address = command.address, "hardware transport stopped; dropping command");
                false
            }
        }
    }
}

pub struct HardwareLink {
    pub commands: CommandSink,
    pub telemetry: mpsc::Receiver<String>,
}

/// Opens the configured transport. Only startup failures are reported; later
/// I/O errors are retried inside the transport.
pub async fn spawn(
    settings: &HardwareSettings,
    backoff: Duration,
) -> Result<HardwareLink, HardwareError> {
    match settings {
        HardwareSettings::Serial {
            port_name,
            baud_rate,
        } => open_serial(port_name, *baud_rate, backoff),
        HardwareSettings::Ipc {
            listen_port,
            robot_addr,
        } => {
            let (link, _) = ipc::bind(*listen_port, robot_addr.clone(), backoff).await?;
            Ok(link)
        }
        HardwareSettings::Console => Ok(console::spawn()),
    }
}

#[cfg(unix)]
fn open_serial(path: &str, baud: u32, backoff: Duration) -> Result<HardwareLink, HardwareError> {
    serial::spawn(path, baud, backoff)
}

#[cfg(not(unix))]
fn open_serial(_path: &str, _baud: u32, _backoff: Duration) -> Result<HardwareLink, HardwareError> {
    Err(HardwareError::Unsupported)
}

/// Drops whatever was queued while the transport was down.
pub(crate) fn discard_pending(commands: &mut mpsc::Receiver<String>) -> usize {
    let mut dropped = 0;
    while commands.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_encodes_commands_as_lines() {
        let (sink, mut rx) = CommandSink::channel(1);
        assert!(sink.send(&HardwareCommand::stop(3)));
        assert_eq!(
            rx.try_recv().unwrap(),
            r#"{"address":3,"controls":{"stop":true}}"#
        );
    }

    #[test]
    fn sink_drops_when_full_or_closed() {
        let (sink, mut rx) = CommandSink::channel(1);
        assert!(sink.send(&HardwareCommand::start(0)));
        assert!(!sink.send(&HardwareCommand::start(1)));
        assert_eq!(discard_pending(&mut rx), 1);
        drop(rx);
        assert!(!sink.send(&HardwareCommand::start(2)));
    }
}
