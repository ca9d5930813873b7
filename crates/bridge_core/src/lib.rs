pub mod converter;
pub mod dispatch;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod handle;
pub mod message;
pub mod packet;
pub mod session;
pub mod transport;
mod wire;

pub use converter::{Converter, UnifiedConverter};
pub use dispatch::{
    BaseContext, Callback, CallbackId, CommandConfig, CommandInvocation, Dispatcher, EventFilter,
    PluginScope, Registration, Stage, handler_fn,
};
pub use encoder::{Encoder, EncoderPrefs, EncoderRegistry, Negotiated, negotiate, negotiate_all};
pub use error::{EncodeError, FrameError, HandshakeFailure, SessionError};
pub use frame::{FrameProtocol, Framing};
pub use handle::{HandleMap, Handler, handle_fn};
pub use message::{EventKind, Participant, Scene, Segment, UnifiedEvent};
pub use packet::{HandshakeMeta, Packet, RemoteError};
pub use session::{Client, CloseReason, Endpoint, Heartbeat, Role, SessionOptions, SessionState};
pub use transport::{BoundAddr, Listen, Server, ServerOptions};
