//! Log-only transport for running without a robot attached.

use tokio::sync::mpsc;
use tracing::info;

use super::{CommandSink, HardwareLink, COMMAND_CAPACITY, TARGET, TELEMETRY_CAPACITY};

pub fn spawn() -> HardwareLink {
    let (commands, rx) = CommandSink::channel(COMMAND_CAPACITY);
    let (telemetry_tx, telemetry) = mpsc::channel(TELEMETRY_CAPACITY);
    tokio::spawn(run(rx, telemetry_tx));
    HardwareLink {
        commands,
        telemetry,
    }
}

// Holds the telemetry sender so the stream stays open, and silent, while commands flow.
async fn run(mut commands: mpsc::Receiver<String>, _telemetry: mpsc::Sender<String>) {
    while let Some(line) = commands.recv().await {
        info!(target: TARGET, command = %line, "console command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_proto::HardwareCommand;

    #[tokio::test]
    async fn consumes_commands_and_never_produces_telemetry() {
        let HardwareLink {
            commands,
            mut telemetry,
        } = spawn();
        assert!(commands.send(&HardwareCommand::start(0)));
        assert!(commands.send(&HardwareCommand::stop(0)));
        drop(commands);
        assert_eq!(telemetry.recv().await, None);
    }
}
