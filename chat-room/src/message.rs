use std::fmt;

use axum::extract::ws;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, future};

/// Opaque payload relayed by the room. The hub never looks inside it.
#[derive(Clone, PartialEq, Eq)]
pub struct Message(Bytes);

impl Message {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => f.debug_tuple("Message").field(&text).finish(),
            Err(_) => f.debug_tuple("Message").field(&self.0).finish(),
        }
    }
}

impl From<&'static str> for Message {
    fn from(text: &'static str) -> Self {
        Self(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self(Bytes::from(text))
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self(Bytes::from(data))
    }
}

/// Converts an inbound WebSocket frame into a relay payload.
///
/// Control frames yield `None`; axum answers pings on its own.
pub fn from_frame(frame: ws::Message) -> Option<Message> {
    match frame {
        ws::Message::Text(text) => Some(Message::from(text)),
        ws::Message::Binary(data) => Some(Message::from(data)),
        ws::Message::Ping(_) | ws::Message::Pong(_) | ws::Message::Close(_) => None,
    }
}

/// Converts a relay payload into an outbound frame: text when the bytes are
/// valid UTF-8, binary otherwise.
pub fn to_frame(message: Message) -> ws::Message {
    match String::from_utf8(Vec::from(message.into_bytes())) {
        Ok(text) => ws::Message::Text(text),
        Err(err) => ws::Message::Binary(err.into_bytes()),
    }
}

/// Adapts the read half of an upgraded socket into a stream of payloads that
/// ends at the peer's close frame.
pub fn inbound<S>(stream: S) -> impl Stream<Item = Result<Message, axum::Error>>
where
    S: Stream<Item = Result<ws::Message, axum::Error>>,
{
    stream
        .take_while(|frame| future::ready(!matches!(frame, Ok(ws::Message::Close(_)))))
        .filter_map(|frame| future::ready(frame.map(from_frame).transpose()))
}

/// Adapts the write half of an upgraded socket into a sink of payloads.
pub fn outbound<S>(sink: S) -> impl Sink<Message, Error = axum::Error>
where
    S: Sink<ws::Message, Error = axum::Error>,
{
    sink.with(|message: Message| future::ready(Ok::<_, axum::Error>(to_frame(message))))
}
