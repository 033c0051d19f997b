//! Gossip based cluster membership.
//!
//! Every node keeps a registry of the members it believes alive and of the
//! ones it declared dead. Once per gossip interval a node bumps its own
//! heartbeat and pushes its alive set to one random peer; whatever it receives
//! is merged into its own registry, newest heartbeat wins. A member whose
//! heartbeat has not advanced within the cleanup timeout is moved to the dead
//! set, and comes back as soon as a fresher heartbeat shows up.
use std::time::Duration;

pub mod codec;
pub mod error;
pub mod failure_detector;
pub mod gossip;
pub mod member;
pub mod network;
pub mod node;
pub mod registry;

pub use codec::GossipMessage;
pub use error::{CodecError, GossipError, StartupError, TransportError};
pub use member::{Member, MemberRecord, Snapshot};
pub use network::{InMemoryNetwork, Transport, UdpTransport};
pub use node::Node;
pub use registry::{MemberRegistry, MergeSummary};

#[derive(Debug, Clone, PartialEq)]
pub struct GossipConfig {
    /// How often a node gossips its membership list.
    pub gossip_interval: Duration,
    /// How long a member may go without a fresher heartbeat before it is declared dead.
    pub cleanup_timeout: Duration,
    /// Chance of dropping an outgoing gossip message, used to exercise the
    /// protocol under packet loss.
    pub loss_probability: f64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            gossip_interval: Duration::from_millis(5_000),
            cleanup_timeout: Duration::from_millis(10_000),
            loss_probability: 0.25,
        }
    }
}

impl GossipConfig {
    pub fn with_gossip_interval(mut self, gossip_interval: Duration) -> Self {
        self.gossip_interval = gossip_interval;
        self
    }

    pub fn with_cleanup_timeout(mut self, cleanup_timeout: Duration) -> Self {
        self.cleanup_timeout = cleanup_timeout;
        self
    }

    pub fn with_loss_probability(mut self, loss_probability: f64) -> Self {
        self.loss_probability = loss_probability;
        self
    }

    pub fn validate(&self) -> Result<(), StartupError> {
        if self.gossip_interval.is_zero() {
            return Err(StartupError::InvalidConfig("gossip interval must be positive".to_owned()));
        }
        if self.cleanup_timeout.is_zero() {
            return Err(StartupError::InvalidConfig("cleanup timeout must be positive".to_owned()));
        }
        if !(0.0..=1.0).contains(&self.loss_probability) {
            return Err(StartupError::InvalidConfig(
                format!("loss probability {} is outside [0, 1]", self.loss_probability)));
        }
        Ok(())
    }
}
