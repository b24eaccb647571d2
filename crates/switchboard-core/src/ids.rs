//! Identifier types shared between server and workers.

/// The `(bridged-event-id, remote-message-id)` pair stored per event
/// hash in the message dedup cache.
///
/// Wire form is `"{event_id}:{remote_id}"`; the event id may itself
/// contain colons, so parsing splits on the last one. A missing pair
/// is written as [`BridgedId::NONE_WIRE`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgedId {
    pub event_id: String,
    pub remote_id: i64,
}

impl BridgedId {
    /// Wire sentinel for "no id stored".
    pub const NONE_WIRE: &'static str = "None:0";

    pub fn new(event_id: impl Into<String>, remote_id: i64) -> Self {
        Self {
            event_id: event_id.into(),
            remote_id,
        }
    }

    /// Parse the wire form. Empty input means "no id".
    pub fn parse(s: &str) -> Result<Option<Self>, BridgedIdError> {
        if s.is_empty() {
            return Ok(None);
        }
        let (event_id, remote) = s.rsplit_once(':').ok_or(BridgedIdError)?;
        let remote_id = remote.parse().map_err(|_| BridgedIdError)?;
        Ok(Some(Self {
            event_id: event_id.to_string(),
            remote_id,
        }))
    }

    pub fn to_wire(&self) -> String {
        format!("{}:{}", self.event_id, self.remote_id)
    }

    /// Wire form of an optional pair, using the sentinel when absent.
    pub fn wire_or_none(id: Option<&Self>) -> String {
        match id {
            Some(id) => id.to_wire(),
            None => Self::NONE_WIRE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed bridged id")]
pub struct BridgedIdError;
