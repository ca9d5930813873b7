//! Frame sources and sinks: the part of a session that knows which transport
//! it runs on. Byte streams go through a [`FrameProtocol`]; WebSocket
//! messages already are frames.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};

use crate::{
    error::SessionError,
    frame::{FrameProtocol, Framing},
};

const READ_CHUNK: usize = 8 * 1024;

pub(crate) enum Inbound {
    Frame(Vec<u8>),
    Pong,
}

#[async_trait]
pub(crate) trait FrameSource: Send {
    /// Next complete frame; `None` once the peer closed its side.
    async fn next_frame(&mut self) -> Result<Option<Inbound>, SessionError>;
}

#[async_trait]
pub(crate) trait FrameSink: Send {
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), SessionError>;

    /// Liveness probe. Byte streams have none.
    async fn ping(&mut self) -> Result<(), SessionError> {
        Ok(())
    }

    /// Flushes and closes the outbound direction. Errors are irrelevant here.
    async fn shutdown(&mut self);
}

pub(crate) struct Wire {
    pub source: Box<dyn FrameSource>,
    pub sink: Box<dyn FrameSink>,
    pub websocket: bool,
}

/// Wire over the two halves of a byte stream.
pub(crate) fn stream<R, W>(reader: R, writer: W, framing: Framing, max_frame: usize) -> Wire
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    Wire {
        source: Box::new(StreamSource {
            reader,
            protocol: FrameProtocol::with_limit(framing, max_frame),
            ready: VecDeque::new(),
            buf: vec![0u8; READ_CHUNK],
        }),
        sink: Box::new(StreamSink {
            writer,
            protocol: FrameProtocol::with_limit(framing, max_frame),
        }),
        websocket: false,
    }
}

/// Wire over an established WebSocket, client or server side.
pub(crate) fn websocket<S>(ws: WebSocketStream<S>) -> Wire
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Wire {
        source: Box::new(WsSource { stream }),
        sink: Box::new(WsSink { sink }),
        websocket: true,
    }
}

// -----------------------------------------------------------------------------
// Byte streams (Unix / TCP)
// -----------------------------------------------------------------------------

struct StreamSource<R> {
    reader: R,
    protocol: FrameProtocol,
    ready: VecDeque<Vec<u8>>,
    buf: Vec<u8>,
}

#[async_trait]
impl<R> FrameSource for StreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_frame(&mut self) -> Result<Option<Inbound>, SessionError> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Ok(Some(Inbound::Frame(frame)));
            }
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                // half-close from the peer
                return Ok(None);
            }
            let frames = self
                .protocol
                .feed(&self.buf[..n])
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            self.ready.extend(frames);
        }
    }
}

struct StreamSink<W> {
    writer: W,
    protocol: FrameProtocol,
}

#[async_trait]
impl<W> FrameSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), SessionError> {
        let bytes = self
            .protocol
            .encode(&payload)
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.writer.flush().await;
        let _ = self.writer.shutdown().await;
    }
}

// -----------------------------------------------------------------------------
// WebSocket
// -----------------------------------------------------------------------------

struct WsSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_frame(&mut self) -> Result<Option<Inbound>, SessionError> {
        while let Some(msg) = self.stream.next().await {
            match msg {
                Ok(Message::Binary(bytes)) => return Ok(Some(Inbound::Frame(bytes.to_vec()))),
                Ok(Message::Text(text)) => {
                    return Ok(Some(Inbound::Frame(text.as_str().as_bytes().to_vec())));
                }
                Ok(Message::Pong(_)) => return Ok(Some(Inbound::Pong)),
                Ok(Message::Close(_)) => return Ok(None),
                // pings are answered by tungstenite itself
                Ok(Message::Ping(_)) | Ok(Message::Frame(_)) => continue,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

struct WsSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, payload: Vec<u8>) -> Result<(), SessionError> {
        self.sink.send(Message::binary(payload)).await?;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), SessionError> {
        self.sink.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}
