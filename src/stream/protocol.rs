//! Wire framing for the streaming channel.
//!
//! Client → server messages are JSON objects (see [`ParameterUpdate`]).
//! Server → client messages are binary, prefixed with a 4-byte ASCII tag:
//!
//! ```text
//! "0000" + JPEG bytes          current tone-mapped frame
//! "0001" + u32 big-endian      cumulative samples per pixel
//! ```
//!
//! [`ParameterUpdate`]: crate::render::ParameterUpdate

use std::future::Future;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::util::{Error, Result};

pub const TAG_FRAME: &[u8; 4] = b"0000";
pub const TAG_SAMPLE_COUNT: &[u8; 4] = b"0001";

/// One outbound binary message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Compressed frame bytes.
    Frame(Vec<u8>),
    /// Cumulative samples per pixel after the tick.
    SampleCount(u32),
}

impl ServerMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Frame(bytes) => {
                let mut out = Vec::with_capacity(4 + bytes.len());
                out.extend_from_slice(TAG_FRAME);
                out.extend_from_slice(bytes);
                out
            }
            Self::SampleCount(count) => {
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(TAG_SAMPLE_COUNT);
                // writing into a Vec cannot fail
                let _ = out.write_u32::<BigEndian>(*count);
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::MalformedMessage(format!("{} byte message has no tag", bytes.len())));
        }
        let (tag, payload) = bytes.split_at(4);
        match tag {
            t if t == TAG_FRAME => Ok(Self::Frame(payload.to_vec())),
            t if t == TAG_SAMPLE_COUNT => {
                let count = Cursor::new(payload)
                    .read_u32::<BigEndian>()
                    .map_err(|_| Error::MalformedMessage("truncated sample count".into()))?;
                Ok(Self::SampleCount(count))
            }
            other => Err(Error::MalformedMessage(format!(
                "unknown tag {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Outbound binary channel of one connection.
///
/// `send_binary` completes only once the message has been handed to the
/// transport, which is what gives the render loop its back-pressure.
pub trait FrameSink: Send {
    fn send_binary(&mut self, bytes: Vec<u8>) -> impl Future<Output = Result<()>> + Send;
}

impl<S> FrameSink for SplitSink<WebSocketStream<S>, Message>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.send(Message::binary(bytes)).await?;
        Ok(())
    }
}

impl FrameSink for tokio::sync::mpsc::Sender<Vec<u8>> {
    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.send(bytes)
            .await
            .map_err(|_| Error::other("frame receiver closed"))
    }
}
