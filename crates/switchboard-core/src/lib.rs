//! Shared core of the switchboard coordination layer: wire protocol,
//! connection handling, and the command registry used by both the
//! central server and the per-worker client.

pub mod conn;
pub mod error;
pub mod ids;
pub mod proto;
pub mod registry;

pub use conn::{CallOptions, ConnInfo, ConnectionHandler, Role, DEFAULT_CALL_TIMEOUT};
pub use error::{CallError, HandlerError, ProtoError, RemoteError};
pub use ids::BridgedId;
pub use proto::{Action, BroadcastEntry, BroadcastReply, Command, Frame, Response};
pub use registry::{CommandHandler, CommandRegistry, Reply};
