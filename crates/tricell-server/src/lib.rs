//! Session orchestration and the WebSocket control surface for tricell.
//!
//! One authoritative run per logical client: the orchestrator owns a map of
//! sessions keyed by client identity, advances each run on a timer or on
//! demand, and streams frames to whatever transport is currently attached.
//! All engine semantics live in `tricell-core`; this crate only decides when
//! to call it and who to tell about the result.

pub mod protocol;
pub mod session;
pub mod ws;

pub use protocol::{ClientMessage, FrameMessage, FramePayload, ServerMessage, StateMessage};
pub use session::{Connection, SessionEvent, SessionManager, Transport};
