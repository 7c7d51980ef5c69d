//! # Sonic Realtime
//!
//! Client-side plumbing for the Sonic bidirectional speech/text streaming
//! protocol: the JSON event codec, the duplex stream transport (WebSocket and
//! in-memory), and bearer credential providers.

pub mod codec;
pub mod credentials;
pub mod mock;
pub mod transport;

pub use codec::{DecodeError, Frame, OutboundEvent, Role};
pub use credentials::{
    CredentialError, CredentialProvider, EnvCredentialProvider, StaticCredentialProvider,
};
pub use transport::{
    DuplexStream, FrameSink, FrameSource, StreamConnector, StreamError, WebSocketConnector,
};
