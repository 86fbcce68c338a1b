//! Transfer channel over one connected stream: a lazy sequence of received
//! messages and a write path. Both directions report failures as `TransferError`.

use bluechat_core::wire::{decode_message, encode_chat, FrameBuffer};
use bluechat_core::{FrameDecodeError, FrameEncodeError, FrameFormat, Message};
use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("stream closed by peer")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("cannot encode message: {0}")]
    Encode(#[from] FrameEncodeError),
}

/// One live stream. Split it once into its single reader and single writer.
pub struct TransferChannel<S> {
    stream: S,
    format: FrameFormat,
    read_buffer_size: usize,
}

impl<S> TransferChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S, format: FrameFormat, read_buffer_size: usize) -> Self {
        Self {
            stream,
            format,
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    pub fn split(self) -> (TransferReader<ReadHalf<S>>, TransferWriter<WriteHalf<S>>) {
        let (r, w) = tokio::io::split(self.stream);
        (
            TransferReader::new(r, self.format, self.read_buffer_size),
            TransferWriter::new(w, self.format),
        )
    }
}

pub struct TransferReader<R> {
    reader: R,
    format: FrameFormat,
    buf: Vec<u8>,
    frames: FrameBuffer,
    finished: bool,
}

impl<R: AsyncRead + Unpin> TransferReader<R> {
    pub fn new(reader: R, format: FrameFormat, read_buffer_size: usize) -> Self {
        Self {
            reader,
            format,
            buf: vec![0u8; read_buffer_size.max(1)],
            frames: FrameBuffer::new(),
            finished: false,
        }
    }

    /// Next received message. `Ok(None)` once the sequence has ended; the read
    /// that ends it (zero bytes or an I/O error) is returned as an error, never retried.
    ///
    /// Delimited frames: every read is decoded on its own, so a message longer than
    /// the read buffer arrives as several malformed messages.
    pub async fn next_message(&mut self) -> Result<Option<Message>, TransferError> {
        if self.finished {
            return Ok(None);
        }
        loop {
            if self.format == FrameFormat::LengthPrefixed {
                match self.frames.next_message(false) {
                    Ok(Some(msg)) => return Ok(Some(msg)),
                    Ok(None) => {}
                    Err(e) => {
                        self.finished = true;
                        return Err(e.into());
                    }
                }
            }
            let n = match self.reader.read(&mut self.buf).await {
                Ok(0) => {
                    self.finished = true;
                    return Err(TransferError::Closed);
                }
                Ok(n) => n,
                Err(e) => {
                    self.finished = true;
                    return Err(e.into());
                }
            };
            match self.format {
                FrameFormat::Delimited => return Ok(Some(decode_message(&self.buf[..n], false))),
                FrameFormat::LengthPrefixed => self.frames.extend(&self.buf[..n]),
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Lazy, unbounded sequence of messages. Ends after the first error.
    pub fn receive_messages(self) -> impl Stream<Item = Result<Message, TransferError>> {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.next_message().await {
                Ok(Some(msg)) => Some((Ok(msg), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
    }
}

pub struct TransferWriter<W> {
    writer: W,
    format: FrameFormat,
}

impl<W: AsyncWrite + Unpin> TransferWriter<W> {
    pub fn new(writer: W, format: FrameFormat) -> Self {
        Self { writer, format }
    }

    /// Blocking write of raw frame bytes.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_message(&mut self, msg: &Message) -> Result<(), TransferError> {
        let frame = encode_chat(self.format, msg)?;
        self.send(&frame).await
    }
}
