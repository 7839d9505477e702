//! The room hub: one task that owns membership and fans messages out.
//!
//! Sessions never touch the membership map. They post join, leave and
//! broadcast events through a [`RoomHandle`], and [`Room::run`] services one
//! ready event per iteration. Each member's outbox sender lives only inside
//! the map, so removing a member is also what closes its outbox.

use std::{collections::HashMap, fmt};

use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::message::Message;

/// Default capacity of a session's outbound queue.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the hub does when a member's outbox is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Wait for room in the outbox. A stalled client stalls the whole room.
    #[default]
    Block,
    /// Drop the message for that member only and count the loss.
    DropNewest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomConfig {
    pub outbox_capacity: usize,
    pub policy: DeliveryPolicy,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            policy: DeliveryPolicy::default(),
        }
    }
}

/// The hub task is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("room is closed")]
pub struct RoomClosed;

struct JoinRequest {
    outbox: mpsc::Sender<Message>,
    respond_to: oneshot::Sender<SessionId>,
}

struct Member {
    outbox: mpsc::Sender<Message>,
    dropped: u64,
}

/// Cloneable entry point to a running [`Room`].
#[derive(Clone)]
pub struct RoomHandle {
    join: mpsc::Sender<JoinRequest>,
    leave: mpsc::Sender<SessionId>,
    forward: mpsc::Sender<Message>,
    outbox_capacity: usize,
}

impl RoomHandle {
    /// Registers a new session and returns its id together with the receiving
    /// end of its outbox. Returns once the hub has admitted the session, so
    /// every later broadcast reaches it.
    pub async fn join(&self) -> Result<(SessionId, mpsc::Receiver<Message>), RoomClosed> {
        let (outbox, inbox) = mpsc::channel(self.outbox_capacity);
        let (respond_to, response) = oneshot::channel();
        self.join
            .send(JoinRequest { outbox, respond_to })
            .await
            .map_err(|_| RoomClosed)?;
        let id = response.await.map_err(|_| RoomClosed)?;
        Ok((id, inbox))
    }

    /// Asks the hub to remove a session and close its outbox.
    pub async fn leave(&self, id: SessionId) -> Result<(), RoomClosed> {
        self.leave.send(id).await.map_err(|_| RoomClosed)
    }

    /// Hands a message to the hub for delivery to every member.
    pub async fn broadcast(&self, message: Message) -> Result<(), RoomClosed> {
        self.forward.send(message).await.map_err(|_| RoomClosed)
    }
}

pub struct Room {
    join: mpsc::Receiver<JoinRequest>,
    leave: mpsc::Receiver<SessionId>,
    forward: mpsc::Receiver<Message>,
    members: HashMap<SessionId, Member>,
    policy: DeliveryPolicy,
    next_id: u64,
}

impl Room {
    pub fn new(config: RoomConfig) -> (Self, RoomHandle) {
        let (join_tx, join) = mpsc::channel(EVENT_BUFFER);
        let (leave_tx, leave) = mpsc::channel(EVENT_BUFFER);
        let (forward_tx, forward) = mpsc::channel(EVENT_BUFFER);

        let room = Self {
            join,
            leave,
            forward,
            members: HashMap::new(),
            policy: config.policy,
            next_id: 1,
        };
        let handle = RoomHandle {
            join: join_tx,
            leave: leave_tx,
            forward: forward_tx,
            outbox_capacity: config.outbox_capacity.max(1),
        };
        (room, handle)
    }

    /// Spawns the hub on the current runtime.
    pub fn spawn(config: RoomConfig) -> RoomHandle {
        let (room, handle) = Self::new(config);
        tokio::spawn(room.run());
        handle
    }

    /// Event loop. Returns only after every [`RoomHandle`] has been dropped.
    pub async fn run(mut self) {
        info!(policy = ?self.policy, "room running");
        loop {
            select! {
                Some(request) = self.join.recv() => self.handle_join(request),
                Some(id) = self.leave.recv() => self.handle_leave(id),
                Some(message) = self.forward.recv() => self.handle_broadcast(message).await,
                else => break,
            }
        }
        info!(members = self.members.len(), "room stopped");
    }

    fn handle_join(&mut self, request: JoinRequest) {
        let id = SessionId(self.next_id);
        self.next_id += 1;

        let JoinRequest { outbox, respond_to } = request;
        self.members.insert(
            id,
            Member {
                outbox,
                dropped: 0,
            },
        );
        info!(session = %id, members = self.members.len(), "client joined");

        if respond_to.send(id).is_err() {
            // The joiner gave up before admission; it will never run a session.
            self.members.remove(&id);
            debug!(session = %id, "joiner went away before admission");
        }
    }

    fn handle_leave(&mut self, id: SessionId) {
        match self.members.remove(&id) {
            // Dropping the member drops the only outbox sender.
            Some(member) => {
                info!(
                    session = %id,
                    members = self.members.len(),
                    dropped = member.dropped,
                    "client left"
                );
            }
            None => debug!(session = %id, "leave for a session that is not a member"),
        }
    }

    async fn handle_broadcast(&mut self, message: Message) {
        debug!(
            bytes = message.len(),
            members = self.members.len(),
            "message received"
        );
        match self.policy {
            DeliveryPolicy::Block => self.deliver_blocking(&message).await,
            DeliveryPolicy::DropNewest => self.deliver_or_drop(&message),
        }
    }

    async fn deliver_blocking(&self, message: &Message) {
        for (id, member) in &self.members {
            if member.outbox.send(message.clone()).await.is_err() {
                // Writer already gone; its session will post a leave shortly.
                debug!(session = %id, "outbox closed by reader, skipping");
            }
        }
    }

    fn deliver_or_drop(&mut self, message: &Message) {
        for (id, member) in &mut self.members {
            match member.outbox.try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    member.dropped += 1;
                    warn!(
                        session = %id,
                        total_dropped = member.dropped,
                        "outbox full, message dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session = %id, "outbox closed by reader, skipping");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    fn spawn_room(outbox_capacity: usize, policy: DeliveryPolicy) -> RoomHandle {
        Room::spawn(RoomConfig {
            outbox_capacity,
            policy,
        })
    }

    async fn recv(inbox: &mut mpsc::Receiver<Message>) -> Option<Message> {
        timeout(WAIT, inbox.recv())
            .await
            .expect("timed out waiting for outbox")
    }

    async fn drain(inbox: &mut mpsc::Receiver<Message>) -> Vec<Message> {
        let mut received = Vec::new();
        while let Some(message) = recv(inbox).await {
            received.push(message);
        }
        received
    }

    #[tokio::test]
    async fn joined_sessions_get_distinct_ids() {
        let room = spawn_room(8, DeliveryPolicy::Block);
        let (a, _a_inbox) = room.join().await.expect("join a");
        let (b, _b_inbox) = room.join().await.expect("join b");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "#1");
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_including_sender() {
        let room = spawn_room(8, DeliveryPolicy::Block);
        let (_a, mut a_inbox) = room.join().await.expect("join a");
        let (_b, mut b_inbox) = room.join().await.expect("join b");

        room.broadcast(Message::from("hello")).await.expect("broadcast");
        // Without handles the hub works off its queue, stops and closes every outbox.
        drop(room);

        assert_eq!(drain(&mut b_inbox).await, vec![Message::from("hello")]);
        assert_eq!(drain(&mut a_inbox).await, vec![Message::from("hello")]);
    }

    #[tokio::test]
    async fn departed_session_misses_later_messages() {
        let room = spawn_room(8, DeliveryPolicy::Block);
        let (a, mut a_inbox) = room.join().await.expect("join a");
        let (_b, mut b_inbox) = room.join().await.expect("join b");
        let (_c, mut c_inbox) = room.join().await.expect("join c");

        room.leave(a).await.expect("leave a");
        // Closed by the hub, so the leave has been processed.
        assert_eq!(recv(&mut a_inbox).await, None);

        room.broadcast(Message::from("from c")).await.expect("broadcast");

        assert_eq!(recv(&mut b_inbox).await, Some(Message::from("from c")));
        assert_eq!(recv(&mut c_inbox).await, Some(Message::from("from c")));
        assert_eq!(recv(&mut a_inbox).await, None);
    }

    #[tokio::test]
    async fn leave_closes_outbox_after_buffered_messages() {
        let room = spawn_room(8, DeliveryPolicy::Block);
        let (a, mut a_inbox) = room.join().await.expect("join a");
        let (_witness, mut witness_inbox) = room.join().await.expect("join witness");

        room.broadcast(Message::from("first")).await.expect("broadcast");
        // The hub finishes a fan-out before it looks at the next event.
        assert_eq!(recv(&mut witness_inbox).await, Some(Message::from("first")));
        room.leave(a).await.expect("leave a");

        assert_eq!(recv(&mut a_inbox).await, Some(Message::from("first")));
        assert_eq!(recv(&mut a_inbox).await, None);
    }

    #[tokio::test]
    async fn second_leave_is_a_no_op() {
        let room = spawn_room(8, DeliveryPolicy::Block);
        let (a, mut a_inbox) = room.join().await.expect("join a");
        let (_b, mut b_inbox) = room.join().await.expect("join b");

        room.leave(a).await.expect("first leave");
        room.leave(a).await.expect("second leave");
        assert_eq!(recv(&mut a_inbox).await, None);

        room.broadcast(Message::from("still here")).await.expect("broadcast");
        assert_eq!(recv(&mut b_inbox).await, Some(Message::from("still here")));

        let (c, _c_inbox) = room.join().await.expect("hub still running");
        assert_ne!(c, a);
    }

    #[tokio::test]
    async fn every_member_sees_the_same_order() {
        let room = spawn_room(64, DeliveryPolicy::Block);
        let (_a, mut a_inbox) = room.join().await.expect("join a");
        let (_b, mut b_inbox) = room.join().await.expect("join b");

        for n in 0..20 {
            room.broadcast(Message::from(format!("m{n}")))
                .await
                .expect("broadcast");
        }
        drop(room);

        let expected: Vec<Message> = (0..20).map(|n| Message::from(format!("m{n}"))).collect();
        assert_eq!(drain(&mut a_inbox).await, expected);
        assert_eq!(drain(&mut b_inbox).await, expected);
    }

    #[tokio::test]
    async fn full_outbox_stalls_the_room_when_blocking() {
        let room = spawn_room(1, DeliveryPolicy::Block);
        let (_slow, mut slow_inbox) = room.join().await.expect("join slow");
        let (_fast, mut fast_inbox) = room.join().await.expect("join fast");

        room.broadcast(Message::from("one")).await.expect("broadcast");
        assert_eq!(recv(&mut fast_inbox).await, Some(Message::from("one")));

        // `slow` leaves "one" undrained, so the hub parks on its outbox while
        // delivering "two" and cannot get to "three".
        room.broadcast(Message::from("two")).await.expect("broadcast");
        room.broadcast(Message::from("three")).await.expect("broadcast");

        let mut seen = Vec::new();
        while let Ok(Some(message)) =
            timeout(Duration::from_millis(200), fast_inbox.recv()).await
        {
            seen.push(message);
        }
        assert!(!seen.contains(&Message::from("three")));

        for expected in ["one", "two", "three"] {
            assert_eq!(recv(&mut slow_inbox).await, Some(Message::from(expected)));
        }
        while seen.len() < 2 {
            seen.push(recv(&mut fast_inbox).await.expect("fast outbox open"));
        }
        assert_eq!(seen, vec![Message::from("two"), Message::from("three")]);
    }

    #[tokio::test]
    async fn blocked_hub_defers_joins_until_drained() {
        let room = spawn_room(1, DeliveryPolicy::Block);
        let (_slow, mut slow_inbox) = room.join().await.expect("join slow");

        room.broadcast(Message::from("one")).await.expect("broadcast");
        room.broadcast(Message::from("two")).await.expect("broadcast");
        // Let the hub take "two" and park on the full outbox.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let pending = room.clone();
        let late = tokio::spawn(async move { pending.join().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!late.is_finished(), "join admitted while hub was blocked");

        assert_eq!(recv(&mut slow_inbox).await, Some(Message::from("one")));
        assert_eq!(recv(&mut slow_inbox).await, Some(Message::from("two")));

        let joined = timeout(WAIT, late)
            .await
            .expect("join should complete once drained")
            .expect("join task");
        assert!(joined.is_ok());
    }

    #[tokio::test]
    async fn full_outbox_drops_for_that_member_only() {
        let room = spawn_room(1, DeliveryPolicy::DropNewest);
        let (_slow, mut slow_inbox) = room.join().await.expect("join slow");
        let (_fast, mut fast_inbox) = room.join().await.expect("join fast");

        room.broadcast(Message::from("one")).await.expect("broadcast");
        assert_eq!(recv(&mut fast_inbox).await, Some(Message::from("one")));
        room.broadcast(Message::from("two")).await.expect("broadcast");
        assert_eq!(recv(&mut fast_inbox).await, Some(Message::from("two")));
        room.broadcast(Message::from("three")).await.expect("broadcast");
        drop(room);

        assert_eq!(drain(&mut fast_inbox).await, vec![Message::from("three")]);
        assert_eq!(drain(&mut slow_inbox).await, vec![Message::from("one")]);
    }

    #[tokio::test]
    async fn dropped_outbox_receiver_does_not_stall_the_room() {
        let room = spawn_room(1, DeliveryPolicy::Block);
        let (_gone, gone_inbox) = room.join().await.expect("join gone");
        let (_b, mut b_inbox) = room.join().await.expect("join b");
        drop(gone_inbox);

        room.broadcast(Message::from("one")).await.expect("broadcast");
        room.broadcast(Message::from("two")).await.expect("broadcast");

        assert_eq!(recv(&mut b_inbox).await, Some(Message::from("one")));
        assert_eq!(recv(&mut b_inbox).await, Some(Message::from("two")));
    }

    #[tokio::test]
    async fn hub_stops_when_all_handles_are_dropped() {
        let (room, handle) = Room::new(RoomConfig::default());
        let task = tokio::spawn(room.run());
        drop(handle);
        timeout(WAIT, task)
            .await
            .expect("hub should stop")
            .expect("hub task");
    }

    #[tokio::test]
    async fn handle_reports_closed_room() {
        let (room, handle) = Room::new(RoomConfig::default());
        drop(room);
        assert_eq!(handle.join().await.err(), Some(RoomClosed));
        assert_eq!(handle.broadcast(Message::from("x")).await, Err(RoomClosed));
    }
}
