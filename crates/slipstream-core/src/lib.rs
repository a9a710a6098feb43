//! slipstream-core — wire format, packet generations, tokens, and the
//! per-session route state machine. All other Slipstream crates depend on
//! this one.

pub mod config;
pub mod crypto;
pub mod packets4;
pub mod packets5;
pub mod route;
pub mod session_data;
pub mod stream;
pub mod token;
pub mod wire;

pub use config::{BackendKeys, ConfigError, SlipstreamConfig};
pub use session_data::SessionData;
pub use stream::{ReadStream, Stream, WireError, WriteStream};
pub use wire::{Packet, RouteType, SdkVersion};
