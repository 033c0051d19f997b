use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::StartupError;
use crate::failure_detector::{FailureDetector, TimerCommands, TimerHandle};
use crate::gossip::{Disseminator, Receiver};
use crate::member::port_of;
use crate::network::{Transport, UdpTransport};
use crate::registry::MemberRegistry;
use crate::GossipConfig;

/// One cluster member: its registry plus the tasks that keep it current.
///
/// A started node runs three tasks until [`Node::shutdown`]: the gossip
/// loop, the receive loop and the failure detector.
pub struct Node {
    config: GossipConfig,
    registry: Arc<MemberRegistry>,
    transport: Arc<dyn Transport>,
    timer_commands: Option<TimerCommands>,
    cancellation_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Creates a node gossiping over UDP on the port of `local_address`.
    pub async fn bind<S: AsRef<str>>(config: GossipConfig, local_address: &str, peers: &[S]) -> Result<Node, StartupError> {
        config.validate()?;
        let port = find_self(local_address, peers)?;
        let bind_address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let transport = UdpTransport::bind(local_address, bind_address).await
            .map_err(|source| StartupError::Bind { address: bind_address.to_string(), source })?;
        Node::with_transport(config, local_address, peers, Arc::new(transport))
    }

    pub fn with_transport<S: AsRef<str>>(config: GossipConfig,
                                         local_address: &str,
                                         peers: &[S],
                                         transport: Arc<dyn Transport>) -> Result<Node, StartupError> {
        config.validate()?;
        find_self(local_address, peers)?;

        let (timers, timer_commands) = TimerHandle::channel();
        let registry = MemberRegistry::bootstrap(local_address, peers.iter().map(|peer| peer.as_ref()), timers);
        log::info!("I am {}. My members are: {}", local_address, registry.snapshot());

        Ok(Node {
            config,
            registry: Arc::new(registry),
            transport,
            timer_commands: Some(timer_commands),
            cancellation_token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn local_address(&self) -> &str {
        self.registry.local_address()
    }

    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    /// The node's own token, not a child: cancelling it stops every task of
    /// the node just like [`Node::shutdown`], minus joining them.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Spawns the failure detector, the gossip loop and the receive loop.
    pub fn start(&mut self) {
        let timer_commands = match self.timer_commands.take() {
            Some(timer_commands) => timer_commands,
            None => {
                log::warn!("{} is already started", self.local_address());
                return;
            }
        };

        let registry = self.registry.clone();
        let detector = FailureDetector::new(self.config.cleanup_timeout, timer_commands);
        self.tasks.push(tokio::spawn(detector.run(self.cancellation_token.clone(), move |address, epoch| {
            registry.expire(address, epoch);
        })));

        let disseminator = Disseminator::new(self.registry.clone(),
                                             self.transport.clone(),
                                             self.config.gossip_interval,
                                             self.config.loss_probability);
        self.tasks.push(tokio::spawn(disseminator.run(self.cancellation_token.clone())));

        let receiver = Receiver::new(self.registry.clone(), self.transport.clone());
        let local = self.local_address().to_owned();
        let token = self.cancellation_token.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(err) = receiver.run(token).await {
                log::error!("{} no longer receives gossip: {}", local, err);
            }
        }));
    }

    /// Stops every task and drops all outstanding failure timers.
    pub async fn shutdown(mut self) {
        self.cancellation_token.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                log::error!("{} task failed during shutdown: {}", self.local_address(), err);
            }
        }
        log::info!("{}: Goodbye my friends...", self.local_address());
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Checks that `local_address` is one of `peers` and returns its port.
fn find_self<S: AsRef<str>>(local_address: &str, peers: &[S]) -> Result<u16, StartupError> {
    if !peers.iter().any(|peer| peer.as_ref() == local_address) {
        return Err(StartupError::SelfNotFound(local_address.to_owned()));
    }
    port_of(local_address).ok_or_else(|| StartupError::InvalidAddress(local_address.to_owned()))
}
