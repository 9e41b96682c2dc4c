//! Replication Module
//!
//! Role lifecycle, in-sync replica membership, and confirm-offset tracking
//! for a replicated commit log. The supervisor drives role changes; channel
//! I/O tasks feed follower acknowledgements in.

mod connection;
mod notifier;
mod runtime;
mod service;
mod sync_state;

pub use connection::{ConnectionRegistry, FollowerChannel, UpstreamClient, UpstreamFactory};
pub use notifier::{SyncSetListener, SyncSetNotifier};
pub use runtime::{ClientRuntimeInfo, ConnectionRuntimeInfo, HaRuntimeInfo};
pub use service::HaService;
pub use sync_state::SyncStateSet;
