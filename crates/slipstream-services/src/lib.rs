//! slipstream-services — the state the daemon routes with.
//!
//! Sharded session/server/relay maps, the route matrix and directory
//! snapshots, the per-slice decision engine, token assembly, billing,
//! and the post-session fan-out. Everything here is I/O-free except the
//! snapshot loaders; sockets and the packet loop live in slipstreamd.

pub mod billing;
pub mod database;
pub mod decision;
pub mod locate;
pub mod maps;
pub mod matrix;
pub mod metrics;
pub mod postsession;
pub mod tokens;
pub mod trackers;
pub mod veto;

pub use billing::{Biller, BillingEntry, LogBiller, NoOpBiller};
pub use database::{Directory, DirectoryHolder};
pub use locate::{IpLocator, Location, NullIsland};
pub use maps::{RelayEntry, ServerEntry, SessionEntry, ShardedMap};
pub use matrix::{MatrixHolder, RouteMatrix};
pub use metrics::Metrics;
pub use postsession::{PortalData, PostSessionHandler, Publisher, SessionCounts, UserSessionMap};
pub use veto::{VetoMap, VetoSnapshots};
