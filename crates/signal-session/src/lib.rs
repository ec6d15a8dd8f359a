//! Client side of peer signaling.
//!
//! A [`NegotiationSession`] drives offer/answer and ICE candidate exchange for
//! one connected client. It talks to the relay through a [`SignalSink`] and to
//! the media stack through a [`PeerEngine`]; a [`SessionDriver`] feeds it the
//! events coming back from both.

pub mod driver;
pub mod engine;
pub mod error;
pub mod mock;
pub mod session;
pub mod transport;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_engine;

pub use driver::SessionDriver;
pub use engine::{EngineError, EngineEvent, EngineEventSender, IceConnectionState, PeerEngine, SdpRole};
pub use error::{NegotiationError, TransportError};
pub use session::{NegotiationPhase, NegotiationSession, SessionOptions, SessionSnapshot};
pub use transport::{relay_websocket_url, RelayClient, RelayEvent, SignalSink};
