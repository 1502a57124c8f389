//! ZeroMQ bridge to a robot control process.
//!
//! The robot's DEALER connects to our ROUTER and sends one telemetry record
//! per message. Commands leave through our DEALER, connected to the robot's
//! socket and redialed after the backoff whenever a send fails.

use std::pin::pin;
use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use zeromq::{
    DealerSocket, Endpoint, RouterSocket, Socket, SocketRecv, SocketSend, ZmqError, ZmqMessage,
};

use super::{
    discard_pending, CommandSink, HardwareError, HardwareLink, COMMAND_CAPACITY, TARGET,
    TELEMETRY_CAPACITY,
};

/// Binds the ROUTER and starts both directions. Returns the bound port.
pub async fn bind(
    listen_port: u16,
    robot_addr: String,
    backoff: Duration,
) -> Result<(HardwareLink, u16), HardwareError> {
    let mut router = RouterSocket::new();
    let endpoint = router
        .bind(&format!("tcp://0.0.0.0:{listen_port}"))
        .await
        .map_err(|source| HardwareError::Bind {
            port: listen_port,
            source,
        })?;
    let port = match endpoint {
        Endpoint::Tcp(_, port) => port,
        _ => listen_port,
    };
    info!(target: TARGET, port, robot = %robot_addr, "ipc bridge listening");

    let (commands, command_rx) = CommandSink::channel(COMMAND_CAPACITY);
    let (telemetry_tx, telemetry) = mpsc::channel(TELEMETRY_CAPACITY);
    let frames = stream::unfold(router, |mut router| async move {
        let frame = router.recv().await;
        Some((frame, router))
    });
    tokio::spawn(receive_telemetry(frames, telemetry_tx, backoff));
    tokio::spawn(deliver_commands(robot_addr, backoff, command_rx));

    Ok((
        HardwareLink {
            commands,
            telemetry,
        },
        port,
    ))
}

/// Payload of a ROUTER message: frame 0 is the sender's identity.
fn payload(message: &ZmqMessage) -> Option<String> {
    let frame = message.get(1)?;
    std::str::from_utf8(frame).ok().map(str::to_owned)
}

async fn receive_telemetry<S>(frames: S, telemetry: mpsc::Sender<String>, backoff: Duration)
where
    S: Stream<Item = Result<ZmqMessage, ZmqError>>,
{
    let mut frames = pin!(frames);
    loop {
        let next = tokio::select! {
            _ = telemetry.closed() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(message)) => {
                let Some(line) = payload(&message) else {
                    debug!(target: TARGET, frames = message.len(), "dropping telemetry without a text payload");
                    continue;
                };
                if telemetry.send(line).await.is_err() {
                    break;
                }
            }
            Some(Err(err)) => {
                warn!(target: TARGET, error = %err, "telemetry receive failed");
                sleep(backoff).await;
            }
            None => break,
        }
    }
    debug!(target: TARGET, "telemetry receiver stopped");
}

async fn deliver_commands(robot_addr: String, backoff: Duration, mut commands: mpsc::Receiver<String>) {
    let endpoint = format!("tcp://{robot_addr}");
    loop {
        let mut dealer = DealerSocket::new();
        if let Err(err) = dealer.connect(&endpoint).await {
            debug!(target: TARGET, robot = %robot_addr, error = %err, "robot command socket unavailable");
            sleep(backoff).await;
            continue;
        }
        let dropped = discard_pending(&mut commands);
        info!(target: TARGET, robot = %robot_addr, dropped, "connected to robot command socket");

        loop {
            let Some(line) = commands.recv().await else {
                return;
            };
            if let Err(err) = dealer.send(ZmqMessage::from(line)).await {
                warn!(target: TARGET, robot = %robot_addr, error = %err, "command send failed");
                break;
            }
        }
        sleep(backoff).await;
    }
}
