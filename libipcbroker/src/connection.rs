//! Sending and receiving messages over connection between client and broker.

use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::debug;

use crate::{Error, Message, Result};

/// Connection that can be used to send [crate::Message]
#[derive(Debug)]
pub struct Connection {
    reader: Reader,
    writer: Writer,
}

/// Receiving half of a [Connection]
pub struct Reader {
    stream: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    /// Frame read by `poll` but not yet handed out by `recv`
    peeked: Option<Option<std::io::Result<Message>>>,
}

/// Sending half of a [Connection]
pub struct Writer {
    stream: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

/// Identifier for connections attached to a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl Connection {
    /// Returns a new [Connection] over given unix stream
    pub fn new(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Connection {
            reader: Reader {
                stream: FramedRead::new(read, LengthDelimitedCodec::new()),
                peeked: None,
            },
            writer: Writer {
                stream: FramedWrite::new(write, LengthDelimitedCodec::new()),
            },
        }
    }

    /// Returns a pair of [Connection] connected to one another
    pub fn pair() -> tokio::io::Result<(Connection, Connection)> {
        let (local, remote) = tokio::net::UnixStream::pair()?;
        Ok((Connection::new(local), Connection::new(remote)))
    }

    /// Connect to a socket at given path
    pub async fn connect(path: impl AsRef<Path>) -> tokio::io::Result<Connection> {
        Ok(Connection::new(UnixStream::connect(path).await?))
    }

    /// Split into halves that can be used independently, e.g. to send while another task is
    /// blocked receiving
    pub fn split(self) -> (Reader, Writer) {
        (self.reader, self.writer)
    }

    /// Send a message
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.writer.send(msg).await
    }

    /// See [Reader::poll]
    pub async fn poll(&mut self, timeout: Duration) -> bool {
        self.reader.poll(timeout).await
    }

    /// Receive a message
    pub async fn recv(&mut self) -> Result<Message> {
        self.reader.recv().await
    }

    /// See [Reader::recv_reply]
    pub async fn recv_reply<F>(
        &mut self,
        request: &Message,
        timeout: Option<Duration>,
        refile: F,
    ) -> Result<Message>
    where
        F: FnMut(Message),
    {
        self.reader.recv_reply(request, timeout, refile).await
    }

    /// Shutdown the connection
    pub async fn shutdown(self) -> Result<()> {
        self.writer.shutdown().await
    }
}

impl Reader {
    /// Wait up to `timeout` for something to receive. Returns true if a message, end of stream,
    /// or a read failure is ready for [Reader::recv].
    pub async fn poll(&mut self, timeout: Duration) -> bool {
        if self.peeked.is_some() {
            return true;
        }
        match tokio::time::timeout(timeout, self.next_frame()).await {
            Ok(next) => {
                self.peeked = Some(next);
                true
            }
            Err(_) => false,
        }
    }

    /// Receive a message
    pub async fn recv(&mut self) -> Result<Message> {
        let next = match self.peeked.take() {
            Some(next) => next,
            None => self.next_frame().await,
        };
        match next {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => Err(Error::IO(e)),
            None => Err(Error::Disconnected),
        }
    }

    /// Receive until the reply to `request` arrives. Every other message is handed to `refile`.
    /// With a `timeout`, gives up once no message arrives for that long.
    pub async fn recv_reply<F>(
        &mut self,
        request: &Message,
        timeout: Option<Duration>,
        mut refile: F,
    ) -> Result<Message>
    where
        F: FnMut(Message),
    {
        loop {
            if let Some(timeout) = timeout {
                if !self.poll(timeout).await {
                    return Err(Error::NoResponse);
                }
            }
            let msg = self.recv().await?;
            if msg.is_reply_to(request) {
                return Ok(msg);
            }
            debug!(
                "refile msg={} while waiting for {}",
                msg,
                request.correlation_id()
            );
            refile(msg);
        }
    }

    async fn next_frame(&mut self) -> Option<std::io::Result<Message>> {
        let bytes = match self.stream.next().await? {
            Ok(bytes) => bytes,
            Err(e) => return Some(Err(e)),
        };

        let msg = serde_json::from_slice::<Message>(&bytes).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unable to decode to json - {}", e),
            )
        });
        if let Ok(msg) = &msg {
            debug!("recv msg={}", msg);
        }
        Some(msg)
    }
}

impl Writer {
    /// Send a message
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        debug!("send msg={}", msg);
        let mut buf = BytesMut::new();
        let data = serde_json::to_string(msg)?;
        buf.put(data.as_bytes());
        Ok(self.stream.send(buf.freeze()).await?)
    }

    /// Shutdown the sending side. Peer sees end of stream.
    pub async fn shutdown(self) -> Result<()> {
        debug!("shutdown {:?}", self);
        Ok(self.stream.into_inner().shutdown().await?)
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fd = AsRef::<UnixStream>::as_ref(self.stream.get_ref()).as_raw_fd();
        write!(f, "Reader {{ fd: {} }}", fd)
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fd = AsRef::<UnixStream>::as_ref(self.stream.get_ref()).as_raw_fd();
        write!(f, "Writer {{ fd: {} }}", fd)
    }
}

impl From<u64> for ConnId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
