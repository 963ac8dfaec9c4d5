/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Query/response codec contract and stream framing.
//!
//! The pooled transport never looks inside a message beyond its 16-bit
//! correlation identifier; everything protocol specific lives behind
//! [`QueryCodec`]. Framing on the stream is always a 2-byte big-endian
//! length prefix followed by the encoded message (RFC 1035 §4.2.2 / RFC 7858).

use crate::core::error::{DnsError, Result};
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod stream_transport;

/// Any bidirectional byte stream a dialer can hand out (TCP, TLS over TCP, test pipes)
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased stream produced by a dialer
pub type BoxedStream = Box<dyn AsyncStream>;

/// Serialization contract for request/response messages correlated by a 16-bit ID
pub trait QueryCodec: Send + Sync + Debug + 'static {
    /// Message type used for both queries and responses
    type Message: Clone + Send + Debug + 'static;

    /// Frames shorter than this are rejected before decoding
    const MIN_MESSAGE_LEN: usize;

    /// Correlation identifier carried by the message
    fn message_id(message: &Self::Message) -> u16;

    /// Overwrite the correlation identifier
    fn set_message_id(message: &mut Self::Message, id: u16);

    /// Encode the message body (without the length prefix)
    fn encode(message: &Self::Message) -> Result<Vec<u8>>;

    /// Decode one message body (without the length prefix)
    fn decode(buf: &[u8]) -> Result<Self::Message>;
}

/// DNS wire format codec backed by hickory `Message`
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsCodec;

impl QueryCodec for DnsCodec {
    type Message = Message;

    /// Full DNS header; a shorter frame cannot hold ID, flags and the four counts
    const MIN_MESSAGE_LEN: usize = 12;

    #[inline]
    fn message_id(message: &Message) -> u16 {
        message.id()
    }

    #[inline]
    fn set_message_id(message: &mut Message, id: u16) {
        message.set_id(id);
    }

    fn encode(message: &Message) -> Result<Vec<u8>> {
        message
            .to_bytes()
            .map_err(|e| DnsError::protocol(format!("Failed to serialize DNS message: {}", e)))
    }

    fn decode(buf: &[u8]) -> Result<Message> {
        Message::from_bytes(buf)
            .map_err(|e| DnsError::protocol(format!("Invalid DNS message: {}", e)))
    }
}
