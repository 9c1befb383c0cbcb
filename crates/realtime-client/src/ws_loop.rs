//! The WebSocket reconnect loop: connect, SETUP, `rpc:init`, resubscribe,
//! then pump frames until the socket drops, and try again with backoff.

use std::sync::atomic::Ordering;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{info, warn};
use wire_protocol::Frame;

use crate::backoff::reconnect_delay;
use crate::client::Client;
use crate::errors::ClientError;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) async fn run(client: Client) {
    loop {
        if client.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        match connect_and_pump(&client).await {
            Ok(()) => {}
            Err(e) => warn!(error = %e, "websocket session ended"),
        }

        *client.inner.ws_tx.lock().await = None;
        client.inner.initialized.store(false, Ordering::SeqCst);
        client.inner.inflight.fail_all(ClientError::Disconnected);

        if client.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let attempt = client.inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = reconnect_delay(attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = client.inner.shutdown.notified() => return,
        }
    }
}

/// Connects, sends SETUP, then spawns the writer (drains queued outgoing
/// frames) and reader (decodes incoming frames, completing in-flight
/// calls) as independent tasks before running `rpc:init`/resubscribe —
/// both of those are calls that only resolve once the reader task
/// observes their response, so the reader must already be pumping.
async fn connect_and_pump(client: &Client) -> Result<(), ClientError> {
    let (ws_stream, _resp) = tokio_tungstenite::connect_async(&client.inner.config.ws_url)
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;
    let (mut write, read) = ws_stream.split();

    let setup = Frame::Setup { uuid: client.inner.config.client_uuid.clone() };
    write
        .send(Message::Text(String::from_utf8(wire_protocol::encode(&setup)).unwrap()))
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;

    let (tx, rx) = mpsc::unbounded_channel::<Frame>();
    *client.inner.ws_tx.lock().await = Some(tx);
    client.inner.reconnect_attempts.store(0, Ordering::SeqCst);
    info!(uuid = %client.inner.config.client_uuid, "websocket connected");

    let mut writer = tokio::spawn(run_writer(write, rx));
    let mut reader = tokio::spawn(run_reader(client.clone(), read));

    let result = tokio::select! {
        outcome = &mut writer => join_outcome(outcome),
        outcome = &mut reader => join_outcome(outcome),
        _ = client.inner.shutdown.notified() => Ok(()),
        result = async {
            client.authenticate().await?;
            client.resubscribe_all_channels().await;
            std::future::pending::<Result<(), ClientError>>().await
        } => result,
    };
    // Whichever branch above resolved first, the other task (and the
    // shutdown/authenticate branches never touch these at all) may still be
    // running against a connection this function is about to abandon.
    writer.abort();
    reader.abort();
    result
}

fn join_outcome(outcome: Result<Result<(), ClientError>, tokio::task::JoinError>) -> Result<(), ClientError> {
    match outcome {
        Ok(result) => result,
        Err(e) => Err(ClientError::Transport(e.to_string())),
    }
}

async fn run_writer(
    mut write: futures_util::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) -> Result<(), ClientError> {
    while let Some(frame) = rx.recv().await {
        let text = String::from_utf8(wire_protocol::encode(&frame)).unwrap();
        write.send(Message::Text(text)).await.map_err(|e| ClientError::Transport(e.to_string()))?;
    }
    Ok(())
}

/// Decodes incoming frames, echoing back `HEARTBEAT` and resetting the
/// missed-heartbeat clock; if a full `keep_alive_interval` passes with no
/// heartbeat at all, the connection is treated as dead and torn down so
/// the outer loop in [`run`] reconnects.
async fn run_reader(client: Client, mut read: futures_util::stream::SplitStream<WsStream>) -> Result<(), ClientError> {
    let interval = client.inner.config.keep_alive_interval;
    let mut missed_deadline = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    let mut last_heartbeat = tokio::time::Instant::now();

    loop {
        tokio::select! {
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match wire_protocol::decode(text.as_bytes()) {
                        Ok(Frame::Heartbeat) => {
                            last_heartbeat = tokio::time::Instant::now();
                            let _ = client.send_ws(Frame::Heartbeat).await;
                        }
                        Ok(frame) => client.dispatch_incoming(frame),
                        Err(e) => warn!(error = %e, "dropping malformed frame"),
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ClientError::Transport(e.to_string())),
                }
            }
            _ = missed_deadline.tick() => {
                if last_heartbeat.elapsed() > interval {
                    warn!("missed server heartbeat, forcing reconnect");
                    return Err(ClientError::Transport("missed heartbeat".into()));
                }
            }
        }
    }
}
