//! Peer discovery across both transports

pub mod aggregator;
pub mod roster;

pub use aggregator::{DiscoveryAggregator, DiscoveryEvent};
pub use roster::{Roster, Upsert};
