// ABOUTME: Provides buffered TCP transport for the manager-interface protocol
// ABOUTME: Splits a socket into a framed message reader and a buffered message writer

use crate::client::error::{AmiError, AmiResult};
use crate::codec::{self, CodecError, Message};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Split a connected socket into its read and write sides.
///
/// The read side is owned by the client's dispatch loop for the lifetime of
/// the session. The write side is shared by every caller issuing actions.
pub fn split(socket: TcpStream) -> (ConnectionReader<OwnedReadHalf>, ConnectionWriter<OwnedWriteHalf>) {
    let (read, write) = socket.into_split();
    (ConnectionReader::new(read), ConnectionWriter::new(write))
}

/// Read side of a manager-interface session.
///
/// ## Session shape
///
/// ```text
/// <greeting line>\r\n
/// Key: Value\r\n ... \r\n\r\n      (one message, repeated)
/// ```
///
/// The greeting is a single unterminated-by-blank-line identification string
/// sent once by the peer on accept. Every later unit is a message.
#[derive(Debug)]
pub struct ConnectionReader<R> {
    stream: R,

    // The buffer for reading messages.
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            // CLI output from a full SIM listing can run to several KB, so start
            // larger than a typical event.
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read the one-line greeting the peer sends on connect.
    pub async fn read_banner(&mut self) -> AmiResult<String> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line);
                return Ok(text.trim_end().to_string());
            }

            if self.buffer.len() > codec::MAX_MESSAGE_SIZE {
                return Err(AmiError::InvalidResponse("greeting line too long".to_string()));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Err(AmiError::ConnectionClosed);
            }
        }
    }

    /// Read a single message from the underlying stream.
    ///
    /// Waits until a full message is buffered. Returns `Ok(None)` when the peer
    /// closes the stream cleanly between messages.
    ///
    /// A message that is framed correctly but cannot be decoded is consumed
    /// and reported as `Err(AmiError::Codec(_))` with a recoverable codec
    /// error; the next call continues with the following message.
    pub async fn read_message(&mut self) -> AmiResult<Option<Message>> {
        loop {
            if let Some(message) = self.parse_message()? {
                return Ok(Some(message));
            }

            // `0` indicates "end of stream".
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                let leftover = codec::leading_blank_len(&self.buffer);
                self.buffer.advance(leftover);
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    // The peer closed the socket in the middle of a message.
                    Err(AmiError::Connection(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "connection reset by peer",
                    )))
                };
            }
        }
    }

    /// Try to take one message off the front of the buffer.
    fn parse_message(&mut self) -> AmiResult<Option<Message>> {
        let blank = codec::leading_blank_len(&self.buffer);
        self.buffer.advance(blank);

        match codec::check(&self.buffer) {
            Ok(len) => {
                let raw = self.buffer.split_to(len);
                codec::parse(&raw).map(Some).map_err(AmiError::Codec)
            }
            // Not enough data yet; this is an expected runtime condition.
            Err(CodecError::Incomplete) => Ok(None),
            Err(e) => Err(AmiError::Codec(e)),
        }
    }
}

/// Write side of a manager-interface session
#[derive(Debug)]
pub struct ConnectionWriter<W: AsyncWrite> {
    stream: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> ConnectionWriter<W> {
    pub fn new(stream: W) -> Self {
        Self {
            stream: BufWriter::new(stream),
        }
    }

    /// Encode and write one message, then flush it to the socket.
    ///
    /// Encoding happens before anything is written, so a message refused by
    /// the codec leaves the stream untouched.
    pub async fn write_message(&mut self, message: &Message) -> AmiResult<()> {
        let bytes = message.to_bytes()?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush and close the write direction.
    pub async fn shutdown(&mut self) -> AmiResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
