//! A scriptable mock WebSocket server for testing client-side behavior
//! (reconnect, backoff, resubscribe) against misbehaving or deliberately
//! dropped connections, independent of the real dispatcher.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use wire_protocol::{decode, encode, Frame};

/// One accepted connection, exposed to the test as a pair of channels: frames
/// received from the client arrive on `inbound`, frames pushed to `outbound`
/// are written to the socket. Dropping `outbound` closes the connection.
pub struct MockConnection {
    pub inbound: mpsc::UnboundedReceiver<Frame>,
    pub outbound: mpsc::UnboundedSender<Frame>,
}

pub struct MockWsServer {
    addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<MockConnection>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockWsServer {
    /// Starts listening on a random local port. Each accepted connection is
    /// handed to the test via [`Self::next_connection`].
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let conn_tx = conn_tx.clone();
                        tokio::spawn(async move {
                            let _ = Self::handle_connection(stream, conn_tx).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections: conn_rx,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Waits for the next client to connect and returns its channel pair.
    pub async fn next_connection(&mut self) -> Option<MockConnection> {
        self.connections.recv().await
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        conn_tx: mpsc::UnboundedSender<MockConnection>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

        if conn_tx
            .send(MockConnection {
                inbound: inbound_rx,
                outbound: outbound_tx,
            })
            .is_err()
        {
            return Ok(());
        }

        loop {
            tokio::select! {
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(frame) = decode(text.as_bytes()) {
                                if inbound_tx.send(frame).is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(_)) => break,
                        _ => {}
                    }
                }
                outgoing = outbound_rx.recv() => {
                    match outgoing {
                        Some(frame) => {
                            let text = String::from_utf8(encode(&frame)).expect("frame encodes to valid utf8");
                            if write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
