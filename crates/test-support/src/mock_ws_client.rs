use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;
use wire_protocol::{decode, encode, Frame};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A minimal WebSocket client speaking the [`Frame`] wire protocol, for
/// integration tests exercising a real or mock server over a socket.
pub struct MockWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl MockWsClient {
    /// Connects and immediately sends the `SETUP` frame every server in
    /// this system requires as the first message.
    pub async fn connect(url: &str, uuid: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        let mut client = Self { write, read };
        client
            .send_frame(&Frame::Setup { uuid: uuid.to_owned() })
            .await?;
        Ok(client)
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let text = String::from_utf8(encode(frame))?;
        self.write.send(Message::Text(text)).await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<Frame, Box<dyn std::error::Error + Send + Sync>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(decode(text.as_bytes())?),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
