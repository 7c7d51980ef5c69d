//! # Sonic Core
//!
//! The real-time translation session manager. It drives the session protocol
//! over a duplex stream, multiplexes audio and text input, demultiplexes model
//! output into typed queues, and restarts the stream transparently when the
//! service ends it for exceeding its maximum length.

pub mod audio;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod pcm;
pub mod session;
pub mod supervisor;

pub use config::{ConfigError, Provider, TranslatorConfig};
pub use dispatcher::TextChunk;
pub use error::SessionError;
pub use session::{InputMode, SessionConfig};
pub use supervisor::{SessionStatus, Translator, TranslatorHandle, TurnResult, TurnTimeouts};
