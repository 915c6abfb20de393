//! Socket transport behind the signaling channel.
//!
//! The channel actor only sees a pair of frame queues. [`TungsteniteConnector`]
//! backs them with a real WebSocket; tests plug in an in-memory connector.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use gage_common::CallResult;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Close code for a normal, intentional closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code for a close frame that carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported when the socket dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

/// An open socket. Dropping `outbound` closes the connection; `inbound`
/// ending without a [`Frame::Close`] means the peer vanished.
pub struct SocketPair {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> CallResult<SocketPair>;
}

#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> CallResult<SocketPair> {
        let (ws, _) = connect_async(url).await?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(64);

        // Writer: drains outbound frames until a close is sent or the
        // channel drops its sender.
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let result = match frame {
                    Frame::Text(text) => sink.send(Message::Text(text.into())).await,
                    Frame::Close { code, reason } => {
                        let close = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    tracing::debug!("Signaling socket write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: forwards text frames; a missing close frame is reported by
        // simply ending the stream.
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
                    Ok(Message::Close(close)) => {
                        let (code, reason) = close
                            .map(|c| (u16::from(c.code), c.reason.as_str().to_owned()))
                            .unwrap_or((CLOSE_NO_STATUS, String::new()));
                        let _ = in_tx.send(Frame::Close { code, reason }).await;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!("Signaling socket read failed: {e}");
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(SocketPair {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
