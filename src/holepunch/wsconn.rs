//! Byte-stream view of a message-oriented WebSocket connection.
//!
//! Each `poll_write` becomes one binary message. Reads concatenate binary
//! message payloads in arrival order; running out of bytes in the current
//! message just moves on to the next one, so frame boundaries never look like
//! EOF. A close message is EOF.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What the adapter needs to know about an incoming message.
#[derive(Debug)]
pub enum Frame {
    Binary(Bytes),
    Text,
    /// Ping/pong; answered by the WebSocket layer itself.
    Control,
    Close,
}

/// A WebSocket message type the adapter can carry bytes in.
pub trait WsMessage: Sized {
    fn binary(data: Bytes) -> Self;
    fn into_frame(self) -> Frame;
}

impl WsMessage for axum::extract::ws::Message {
    fn binary(data: Bytes) -> Self {
        Self::Binary(data)
    }

    fn into_frame(self) -> Frame {
        match self {
            Self::Binary(b) => Frame::Binary(b),
            Self::Text(_) => Frame::Text,
            Self::Ping(_) | Self::Pong(_) => Frame::Control,
            Self::Close(_) => Frame::Close,
        }
    }
}

pin_project! {
    pub struct WsConnAdapter<S> {
        #[pin]
        inner: S,
        current: Option<Bytes>,
        eof: bool,
    }
}

impl<S> WsConnAdapter<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            current: None,
            eof: false,
        }
    }
}

impl<S, M, E> AsyncRead for WsConnAdapter<S>
where
    S: Stream<Item = Result<M, E>>,
    M: WsMessage,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();

        loop {
            if *this.eof {
                return Poll::Ready(Ok(()));
            }

            if let Some(cur) = this.current.as_mut() {
                if cur.has_remaining() {
                    let n = cur.remaining().min(buf.remaining());
                    buf.put_slice(&cur[..n]);
                    cur.advance(n);
                    if !cur.has_remaining() {
                        *this.current = None;
                    }
                    return Poll::Ready(Ok(()));
                }
                *this.current = None;
            }

            match ready!(this.inner.as_mut().poll_next(cx)) {
                None => {
                    *this.eof = true;
                }
                Some(Err(err)) => {
                    return Poll::Ready(Err(io::Error::other(err)));
                }
                Some(Ok(msg)) => match msg.into_frame() {
                    Frame::Binary(data) => {
                        // Empty messages carry nothing; skipping them keeps a
                        // zero-length read from being mistaken for EOF.
                        if !data.is_empty() {
                            *this.current = Some(data);
                        }
                    }
                    Frame::Close => {
                        *this.eof = true;
                    }
                    Frame::Control => {}
                    Frame::Text => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "unexpected websocket message type",
                        )));
                    }
                },
            }
        }
    }
}

impl<S, M, E> AsyncWrite for WsConnAdapter<S>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E>,
    M: WsMessage,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        ready!(this.inner.as_mut().poll_ready(cx)).map_err(io::Error::other)?;
        this.inner
            .as_mut()
            .start_send(M::binary(Bytes::copy_from_slice(data)))
            .map_err(io::Error::other)?;

        // Push the message out now if the sink allows it; a pending flush is
        // finished by the next write or by poll_flush.
        if let Poll::Ready(Err(err)) = this.inner.as_mut().poll_flush(cx) {
            return Poll::Ready(Err(io::Error::other(err)));
        }

        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx).map_err(io::Error::other)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_close(cx).map_err(io::Error::other)
    }
}
