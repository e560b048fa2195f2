//! Session registry — the id→session map, the room index, and the bounded
//! per-session outbound queues.
//!
//! Every mutation of the map or the room index goes through one lock. The
//! lock is synchronous and is never held across a suspension point; callers
//! get back ids, snapshots, or cloned queue handles, never references into
//! the registry. Per-room broadcast sequence numbers are assigned under the
//! same lock as the membership snapshot they pair with.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use cmdchat_core::envelope::Envelope;

// ── Outbound queue ────────────────────────────────────────────────────────────

/// Result of a non-blocking enqueue.
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// The queue was full; the oldest non-system envelope was dropped to
    /// make room and a backpressure notice was injected.
    DroppedOldest,
    /// The queue is full of undroppable envelopes. The owning session must
    /// be terminated.
    Refused,
    /// The session is already terminating. Skipped silently by broadcasters.
    Closed,
}

/// Bounded outbound queue for one session. Producers are other sessions'
/// reader tasks (broadcasts) and the session's own reader and heartbeat;
/// the single consumer is the session's writer task.
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    bound: usize,
    closed: AtomicBool,
}

struct QueueInner {
    items: VecDeque<Envelope>,
}

impl OutboundQueue {
    pub fn new(bound: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(bound.min(64)),
            }),
            notify: Notify::new(),
            bound,
            closed: AtomicBool::new(false),
        })
    }

    /// Non-blocking enqueue with the overflow policy: drop the oldest
    /// non-system envelope, note the backpressure, and only refuse when
    /// nothing is droppable.
    pub fn push(&self, envelope: Envelope) -> Enqueue {
        if self.closed.load(Ordering::Acquire) {
            return Enqueue::Closed;
        }
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.items.len() < self.bound {
            inner.items.push_back(envelope);
            drop(inner);
            self.notify.notify_one();
            return Enqueue::Queued;
        }

        if !drop_oldest_droppable(&mut inner.items) {
            return Enqueue::Refused;
        }
        let already_noted = inner
            .items
            .iter()
            .any(|e| matches!(e, Envelope::System { text } if text == "backpressure"));
        if !already_noted {
            inner.items.push_back(Envelope::System { text: "backpressure".to_string() });
            if !drop_oldest_droppable(&mut inner.items) {
                return Enqueue::Refused;
            }
        }
        inner.items.push_back(envelope);
        drop(inner);
        self.notify.notify_one();
        Enqueue::DroppedOldest
    }

    /// Await the next envelope. Returns `None` once the queue is closed and
    /// drained, which is the writer task's signal to finish.
    pub async fn pop(&self) -> Option<Envelope> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(envelope) = inner.items.pop_front() {
                    return Some(envelope);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking pop, used by the termination drain.
    pub fn try_pop(&self) -> Option<Envelope> {
        self.inner.lock().expect("queue lock poisoned").items.pop_front()
    }

    /// Mark the queue closed and wake the writer. Queued envelopes remain
    /// poppable for the drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn drop_oldest_droppable(items: &mut VecDeque<Envelope>) -> bool {
    match items.iter().position(|e| !matches!(e, Envelope::System { .. })) {
        Some(pos) => {
            items.remove(pos);
            true
        }
        None => false,
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// A registered session as seen by the registry: display state plus the
/// handle broadcasts enqueue into.
#[derive(Clone)]
pub struct SessionEntry {
    pub name: String,
    pub room: String,
    pub queue: Arc<OutboundQueue>,
}

struct Room {
    members: BTreeSet<u64>,
    next_seq: u64,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<u64, SessionEntry>,
    rooms: HashMap<String, Room>,
}

/// The shared registry. One per server, passed by reference.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and add it to its room, creating the room if
    /// needed.
    pub fn insert(&self, client_id: u64, name: &str, room: &str, queue: Arc<OutboundQueue>) {
        let mut inner = self.lock();
        inner.sessions.insert(
            client_id,
            SessionEntry {
                name: name.to_string(),
                room: room.to_string(),
                queue,
            },
        );
        inner
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| Room { members: BTreeSet::new(), next_seq: 0 })
            .members
            .insert(client_id);
    }

    /// Remove a session from the id map and its room. Empty rooms are
    /// destroyed. Returns the removed entry so the caller can announce the
    /// departure.
    pub fn remove(&self, client_id: u64) -> Option<SessionEntry> {
        let mut inner = self.lock();
        let entry = inner.sessions.remove(&client_id)?;
        remove_from_room(&mut inner, &entry.room, client_id);
        Some(entry)
    }

    /// Atomically move a session to a new room. Returns the old room name,
    /// or `None` for an unknown session.
    pub fn rename_room(&self, client_id: u64, new_room: &str) -> Option<String> {
        let mut inner = self.lock();
        let old_room = {
            let entry = inner.sessions.get_mut(&client_id)?;
            std::mem::replace(&mut entry.room, new_room.to_string())
        };
        remove_from_room(&mut inner, &old_room, client_id);
        inner
            .rooms
            .entry(new_room.to_string())
            .or_insert_with(|| Room { members: BTreeSet::new(), next_seq: 0 })
            .members
            .insert(client_id);
        Some(old_room)
    }

    /// Update a session's display name. Returns the previous name.
    pub fn set_name(&self, client_id: u64, name: &str) -> Option<String> {
        let mut inner = self.lock();
        let entry = inner.sessions.get_mut(&client_id)?;
        Some(std::mem::replace(&mut entry.name, name.to_string()))
    }

    /// Point-in-time member list of a room.
    pub fn by_room(&self, room: &str) -> Vec<u64> {
        let inner = self.lock();
        inner
            .rooms
            .get(room)
            .map(|r| r.members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Member snapshot plus the next broadcast sequence number for `room`,
    /// taken under one lock acquisition so every recipient set pairs with
    /// exactly one position in the room's order.
    pub fn room_snapshot(&self, room: &str) -> (Vec<u64>, u64) {
        let mut inner = self.lock();
        match inner.rooms.get_mut(room) {
            Some(r) => {
                let seq = r.next_seq;
                r.next_seq += 1;
                (r.members.iter().copied().collect(), seq)
            }
            None => (Vec::new(), 0),
        }
    }

    /// Look up a session's queue handle.
    pub fn queue(&self, client_id: u64) -> Option<Arc<OutboundQueue>> {
        self.lock().sessions.get(&client_id).map(|e| e.queue.clone())
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    /// Ids of every live session. Used at shutdown.
    pub fn all_ids(&self) -> Vec<u64> {
        self.lock().sessions.keys().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().expect("registry lock poisoned")
    }

    #[cfg(test)]
    fn rooms_containing(&self, client_id: u64) -> Vec<String> {
        let inner = self.lock();
        inner
            .rooms
            .iter()
            .filter(|(_, r)| r.members.contains(&client_id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    #[cfg(test)]
    fn room_member_union(&self) -> BTreeSet<u64> {
        let inner = self.lock();
        inner.rooms.values().flat_map(|r| r.members.iter().copied()).collect()
    }
}

fn remove_from_room(inner: &mut RegistryInner, room: &str, client_id: u64) {
    if let Some(r) = inner.rooms.get_mut(room) {
        r.members.remove(&client_id);
        if r.members.is_empty() {
            inner.rooms.remove(room);
        }
    }
}
