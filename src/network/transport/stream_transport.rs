/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::{DnsError, Result};
use crate::network::transport::QueryCodec;
use bytes::{Bytes, BytesMut};
use std::marker::PhantomData;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf, split};

/// Encode a message into one complete length-prefixed frame
///
/// Encoding happens on the caller side so a frame is either queued whole or
/// not at all; the writer task never sees a partial message.
pub fn encode_frame<C: QueryCodec>(message: &C::Message) -> Result<Bytes> {
    let body = C::encode(message)?;
    if body.len() > u16::MAX as usize {
        return Err(DnsError::protocol(format!(
            "DNS message too large: {} bytes (max 65535)",
            body.len()
        )));
    }

    // Merge length prefix and body into a single frame for one write
    let mut frame = BytesMut::with_capacity(2 + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_split<C: QueryCodec>(self) -> (StreamTransportReader<S, C>, StreamTransportWriter<S>) {
        let (reader, writer) = split(self.stream);
        (
            StreamTransportReader {
                reader,
                buf: BytesMut::with_capacity(8192),
                _codec: PhantomData,
            },
            StreamTransportWriter { writer },
        )
    }
}

pub struct StreamTransportWriter<S> {
    writer: WriteHalf<S>,
}

impl<S> StreamTransportWriter<S>
where
    S: AsyncWrite,
{
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.writer
            .write_all(frame)
            .await
            .map_err(|e| DnsError::connection_closed(format!("write request: {}", e)))?;
        self.writer
            .flush()
            .await
            .map_err(|e| DnsError::connection_closed(format!("write request: {}", e)))
    }

    /// Best-effort half close (sends TLS close_notify / TCP FIN)
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

pub struct StreamTransportReader<S, C> {
    reader: ReadHalf<S>,
    buf: BytesMut,
    _codec: PhantomData<C>,
}

impl<S, C> StreamTransportReader<S, C>
where
    S: AsyncRead,
    C: QueryCodec,
{
    /// Read exactly one framed message
    ///
    /// A short or undecodable frame is a protocol error: the framing state of
    /// the stream can no longer be trusted, so the caller is expected to drop
    /// the connection.
    pub async fn read_message(&mut self) -> Result<C::Message> {
        loop {
            // Try parse from accumulated buffer first (may contain multiple messages)
            if self.buf.len() >= 2 {
                let msg_len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;

                if msg_len < C::MIN_MESSAGE_LEN {
                    return Err(DnsError::protocol(format!(
                        "short response frame: {} bytes (min {})",
                        msg_len,
                        C::MIN_MESSAGE_LEN
                    )));
                }

                if self.buf.len() >= 2 + msg_len {
                    let frame = self.buf.split_to(2 + msg_len);
                    return C::decode(&frame[2..]);
                }
            }

            // Need more bytes; read from stream directly into buffer
            self.buf.reserve(4096);
            let n = self
                .reader
                .read_buf(&mut self.buf)
                .await
                .map_err(|e| DnsError::connection_closed(format!("read response: {}", e)))?;

            if n == 0 {
                return Err(DnsError::connection_closed("read response: EOF"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::test_codec::{EchoCodec, EchoMessage};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_frames_survive_split_reads() {
        let (client, mut server) = duplex(64);
        let (mut reader, _writer) = StreamTransport::new(client).into_split::<EchoCodec>();

        let first = encode_frame::<EchoCodec>(&EchoMessage::new(1, b"abc")).unwrap();
        let second = encode_frame::<EchoCodec>(&EchoMessage::new(2, b"defgh")).unwrap();
        let mut wire = first.to_vec();
        wire.extend_from_slice(&second);

        // Deliver the two frames in awkward chunk boundaries
        tokio::spawn(async move {
            for chunk in wire.chunks(3) {
                server.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            // keep the pipe open until the reader is done
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });

        assert_eq!(reader.read_message().await.unwrap(), EchoMessage::new(1, b"abc"));
        assert_eq!(reader.read_message().await.unwrap(), EchoMessage::new(2, b"defgh"));
    }

    #[tokio::test]
    async fn test_short_frame_is_protocol_error() {
        let (client, mut server) = duplex(64);
        let (mut reader, _writer) = StreamTransport::new(client).into_split::<EchoCodec>();
        server.write_all(&[0, 1, 9]).await.unwrap();

        assert!(matches!(
            reader.read_message().await,
            Err(DnsError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (client, server) = duplex(64);
        let (mut reader, _writer) = StreamTransport::new(client).into_split::<EchoCodec>();
        drop(server);

        assert!(matches!(
            reader.read_message().await,
            Err(DnsError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let message = EchoMessage::new(1, &vec![0u8; u16::MAX as usize]);
        assert!(matches!(
            encode_frame::<EchoCodec>(&message),
            Err(DnsError::Protocol(_))
        ));
    }
}
