//! Newline-framed serial link to the robot's microcontroller.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::termios::{self, BaudRate, SetArg};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{
    discard_pending, CommandSink, HardwareError, HardwareLink, COMMAND_CAPACITY, TARGET,
    TELEMETRY_CAPACITY,
};

/// Opens the device now so a bad path fails startup, then keeps it alive in the background.
pub fn spawn(path: &str, baud: u32, backoff: Duration) -> Result<HardwareLink, HardwareError> {
    let rate = baud_rate(baud)?;
    let port = open(path, rate)?;
    info!(target: TARGET, path, baud, "serial port open");

    let (commands, command_rx) = CommandSink::channel(COMMAND_CAPACITY);
    let (telemetry_tx, telemetry) = mpsc::channel(TELEMETRY_CAPACITY);
    tokio::spawn(run(
        path.to_owned(),
        rate,
        backoff,
        port,
        command_rx,
        telemetry_tx,
    ));
    Ok(HardwareLink {
        commands,
        telemetry,
    })
}

struct Port {
    reader: File,
    writer: File,
}

fn open(path: &str, rate: BaudRate) -> Result<Port, HardwareError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(path)
        .map_err(|source| HardwareError::Open {
            path: path.to_owned(),
            source,
        })?;

    let termios_err = |source| HardwareError::Termios {
        path: path.to_owned(),
        source,
    };
    let mut settings = termios::tcgetattr(&file).map_err(termios_err)?;
    termios::cfmakeraw(&mut settings);
    termios::cfsetspeed(&mut settings, rate).map_err(termios_err)?;
    termios::tcsetattr(&file, SetArg::TCSANOW, &settings).map_err(termios_err)?;

    // Separate handles so a pending read never holds up a write.
    let reader = file.try_clone().map_err(|source| HardwareError::Open {
        path: path.to_owned(),
        source,
    })?;
    Ok(Port {
        reader: File::from_std(reader),
        writer: File::from_std(file),
    })
}

enum PumpEnd {
    Closed,
    Failed(String),
}

async fn run(
    path: String,
    rate: BaudRate,
    backoff: Duration,
    mut port: Port,
    mut commands: mpsc::Receiver<String>,
    telemetry: mpsc::Sender<String>,
) {
    loop {
        match pump(port, &mut commands, &telemetry).await {
            PumpEnd::Closed => {
                debug!(target: TARGET, path = %path, "serial transport stopped");
                return;
            }
            PumpEnd::Failed(reason) => {
                warn!(target: TARGET, path = %path, %reason, "serial link lost");
            }
        }
        port = loop {
            sleep(backoff).await;
            match open(&path, rate) {
                Ok(port) => {
                    let dropped = discard_pending(&mut commands);
                    info!(target: TARGET, path = %path, dropped, "serial port reopened");
                    break port;
                }
                Err(err) => debug!(target: TARGET, error = %err, "serial reopen failed"),
            }
        };
    }
}

async fn pump(
    port: Port,
    commands: &mut mpsc::Receiver<String>,
    telemetry: &mpsc::Sender<String>,
) -> PumpEnd {
    let Port { reader, mut writer } = port;
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if telemetry.send(line).await.is_err() {
                        return PumpEnd::Closed;
                    }
                }
                Ok(None) => return PumpEnd::Failed("device closed".into()),
                Err(err) => return PumpEnd::Failed(err.to_string()),
            },
            command = commands.recv() => {
                let Some(mut line) = command else {
                    return PumpEnd::Closed;
                };
                line.push('\n');
                if let Err(err) = writer.write_all(line.as_bytes()).await {
                    return PumpEnd::Failed(err.to_string());
                }
                if let Err(err) = writer.flush().await {
                    return PumpEnd::Failed(err.to_string());
                }
            }
        }
    }
}

fn baud_rate(baud: u32) -> Result<BaudRate, HardwareError> {
    let rate = match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        460800 => BaudRate::B460800,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        921600 => BaudRate::B921600,
        other => return Err(HardwareError::UnsupportedBaud(other)),
    };
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_standard_baud_rates() {
        assert_eq!(baud_rate(9600).unwrap(), BaudRate::B9600);
        assert_eq!(baud_rate(115200).unwrap(), BaudRate::B115200);
        assert!(matches!(
            baud_rate(12345),
            Err(HardwareError::UnsupportedBaud(12345))
        ));
    }

    #[tokio::test]
    async fn missing_device_fails_at_startup() {
        let result = spawn("/dev/bot-box-does-not-exist", 9600, Duration::from_millis(10));
        assert!(matches!(result, Err(HardwareError::Open { .. })));
    }
}
