//! One connected peer: an inbound loop feeding the room and an outbound loop
//! draining the session's outbox to the wire.

use std::fmt;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::{select, sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    message::Message,
    room::{RoomClosed, RoomHandle, SessionId},
};

pub struct Session {
    id: SessionId,
    room: RoomHandle,
    outbox: mpsc::Receiver<Message>,
}

impl Session {
    /// Joins the room. The session is a broadcast target once this returns.
    pub async fn join(room: RoomHandle) -> Result<Self, RoomClosed> {
        let (id, outbox) = room.join().await?;
        Ok(Self { id, room, outbox })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Runs the session until the peer goes away, then leaves the room and
    /// waits for the outbox to be drained.
    ///
    /// The read loop runs on the caller's task; the write loop gets its own.
    /// A failed write ends the session just like a failed read does.
    pub async fn run<R, E, W>(self, inbound: R, outbound: W)
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Debug,
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: fmt::Debug + Send,
    {
        let Session { id, room, outbox } = self;

        let mut writer = tokio::spawn(write_loop(id, outbox, outbound));
        let writer_done = read_loop(id, &room, inbound, &mut writer).await;

        // Sole leave for this session; the hub closes the outbox in response.
        if room.leave(id).await.is_err() {
            debug!(session = %id, "room closed before leave");
        }

        if !writer_done {
            if let Err(err) = writer.await {
                warn!(session = %id, error = ?err, "writer task failed");
            }
        }
        debug!(session = %id, "session finished");
    }
}

/// Forwards inbound messages to the room. Returns `true` when it stopped
/// because the writer task had already finished.
async fn read_loop<R, E>(
    id: SessionId,
    room: &RoomHandle,
    mut inbound: R,
    writer: &mut JoinHandle<()>,
) -> bool
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Debug,
{
    loop {
        select! {
            frame = inbound.next() => match frame {
                Some(Ok(message)) => {
                    if room.broadcast(message).await.is_err() {
                        debug!(session = %id, "room closed, ending session");
                        return false;
                    }
                }
                Some(Err(err)) => {
                    debug!(session = %id, error = ?err, "read failed");
                    return false;
                }
                None => {
                    debug!(session = %id, "peer closed the connection");
                    return false;
                }
            },
            result = &mut *writer => {
                if let Err(err) = result {
                    warn!(session = %id, error = ?err, "writer task failed");
                }
                debug!(session = %id, "writer stopped, ending session");
                return true;
            }
        }
    }
}

async fn write_loop<W>(id: SessionId, mut outbox: mpsc::Receiver<Message>, mut sink: W)
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Debug,
{
    // `recv` keeps yielding buffered messages after the hub closes the outbox.
    while let Some(message) = outbox.recv().await {
        if let Err(err) = sink.send(message).await {
            debug!(session = %id, error = ?err, "write failed");
            return;
        }
    }

    if let Err(err) = sink.close().await {
        debug!(session = %id, error = ?err, "failed to close connection");
    }
}
