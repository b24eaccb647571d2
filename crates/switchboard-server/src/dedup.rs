//! Bounded per-room dedup caches.
//!
//! Two buckets racing to relay the same network event converge here:
//! the first writer's bridged id wins, later arrivals adopt it instead
//! of creating duplicates. Both caches are capped FIFOs per room; the
//! message cache keeps its hash queue and id mapping in lockstep, so
//! evicting the oldest hash always drops its mapping in the same step.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use switchboard_core::{BridgedId, Command, CommandRegistry, HandlerError, Reply, Response};

/// Per-room cap on remembered event hashes.
pub const CACHE_QUEUE_LENGTH: usize = 20;

#[derive(Default)]
struct RoomMessages {
    queue: VecDeque<String>,
    ids: HashMap<String, Option<BridgedId>>,
}

/// Action and message dedup tables, keyed by room id.
pub struct DedupCache {
    actions: Mutex<HashMap<String, VecDeque<String>>>,
    messages: Mutex<HashMap<String, RoomMessages>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self {
            actions: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
        }
    }

    /// Install the CHECK_ACTION / CHECK_MESSAGE / UPDATE_MESSAGE handlers.
    pub fn register(self: Arc<Self>, registry: &mut CommandRegistry) {
        let cache = Arc::clone(&self);
        registry.register_fn(Command::CheckAction, move |_conn, payload| {
            let cache = Arc::clone(&cache);
            async move { cache.check_action(&payload) }
        });
        let cache = Arc::clone(&self);
        registry.register_fn(Command::CheckMessage, move |_conn, payload| {
            let cache = Arc::clone(&cache);
            async move { cache.check_message(&payload) }
        });
        let cache = self;
        registry.register_fn(Command::UpdateMessage, move |_conn, payload| {
            let cache = Arc::clone(&cache);
            async move { cache.update_message(&payload) }
        });
    }

    /// `"room;hash"` — membership test with insert-on-miss.
    pub fn check_action(&self, payload: &Bytes) -> Result<Reply, HandlerError> {
        let [room, hash] = match parse_fields::<2>(payload) {
            Ok(fields) => fields,
            Err(reply) => return Ok(reply),
        };
        let mut rooms = self.actions.lock();
        let queue = rooms.entry(room).or_default();
        if queue.iter().any(|h| h == &hash) {
            return Ok(Reply::from(Response::Found));
        }
        queue.push_back(hash);
        if queue.len() > CACHE_QUEUE_LENGTH {
            queue.pop_front();
        }
        Ok(Reply::from(Response::NotFound))
    }

    /// `"room;hash;candidate_id"` — first writer wins: a known hash
    /// answers FOUND with the stored id, an unknown one stores the
    /// candidate and admits the hash.
    pub fn check_message(&self, payload: &Bytes) -> Result<Reply, HandlerError> {
        let [room, hash, candidate] = match parse_fields::<3>(payload) {
            Ok(fields) => fields,
            Err(reply) => return Ok(reply),
        };
        let candidate = match BridgedId::parse(&candidate) {
            Ok(id) => id,
            Err(_) => return Ok(Reply::error("invalid bridged id")),
        };

        let mut rooms = self.messages.lock();
        let cache = rooms.entry(room).or_default();
        if cache.queue.iter().any(|h| h == &hash) {
            let stored = cache.ids.get(&hash).cloned().flatten();
            return Ok(Reply::new(
                Response::Found,
                BridgedId::wire_or_none(stored.as_ref()),
            ));
        }

        cache.ids.insert(hash.clone(), candidate);
        cache.queue.push_back(hash);
        if cache.queue.len() > CACHE_QUEUE_LENGTH {
            if let Some(evicted) = cache.queue.pop_front() {
                cache.ids.remove(&evicted);
            }
        }
        Ok(Reply::from(Response::NotFound))
    }

    /// `"room;hash;new_id;expected_id"` — compare-and-swap: replaces
    /// the stored id only when it still equals `expected_id`, else
    /// answers FOUND with whatever is actually stored so a late
    /// arrival learns it lost the race.
    pub fn update_message(&self, payload: &Bytes) -> Result<Reply, HandlerError> {
        let [room, hash, new_id, expected] = match parse_fields::<4>(payload) {
            Ok(fields) => fields,
            Err(reply) => return Ok(reply),
        };
        let (new_id, expected) = match (BridgedId::parse(&new_id), BridgedId::parse(&expected)) {
            (Ok(n), Ok(e)) => (n, e),
            _ => return Ok(Reply::error("invalid bridged id")),
        };

        let mut rooms = self.messages.lock();
        let cache = rooms.entry(room).or_default();
        let stored = match cache.ids.get(&hash) {
            Some(stored) => stored.clone(),
            None => {
                return Ok(Reply::new(Response::Found, BridgedId::NONE_WIRE));
            }
        };
        if stored != expected {
            return Ok(Reply::new(
                Response::Found,
                BridgedId::wire_or_none(stored.as_ref()),
            ));
        }
        cache.ids.insert(hash, new_id);
        Ok(Reply::from(Response::NotFound))
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_fields<const N: usize>(payload: &Bytes) -> Result<[String; N], Reply> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Reply::error("invalid dedup payload: not utf-8"))?;
    let parts: Vec<&str> = text.split(';').collect();
    if parts.len() != N {
        return Err(Reply::error("invalid dedup payload: wrong field count"));
    }
    Ok(std::array::from_fn(|i| parts[i].to_string()))
}
