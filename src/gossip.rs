use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::codec::{self, GossipMessage};
use crate::error::{GossipError, TransportError};
use crate::network::Transport;
use crate::registry::MemberRegistry;

/// What happened in one active gossip round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// No alive peer other than self.
    NoPeers,
    /// Snapshot built for `target` but dropped by the virtual packet loss.
    Suppressed { target: String },
    Sent { target: String },
    Failed { target: String },
}

/// Active cycle: periodically pushes this node's alive set to a random peer.
pub struct Disseminator {
    registry: Arc<MemberRegistry>,
    transport: Arc<dyn Transport>,
    gossip_interval: Duration,
    loss_probability: f64,
    rng: StdRng,
}

impl Disseminator {
    pub fn new(registry: Arc<MemberRegistry>,
               transport: Arc<dyn Transport>,
               gossip_interval: Duration,
               loss_probability: f64) -> Disseminator {
        Disseminator {
            registry,
            transport,
            gossip_interval,
            loss_probability: if loss_probability.is_nan() { 0.0 } else { loss_probability.clamp(0.0, 1.0) },
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Disseminator {
        self.rng = rng;
        self
    }

    pub async fn run(mut self, cancellation_token: CancellationToken) {
        let mut interval = time::interval_at(Instant::now() + self.gossip_interval, self.gossip_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    log::debug!("Gossip loop of {} will be stopped", self.registry.local_address());
                    break;
                }
                _ = interval.tick() => {
                    self.round().await;
                }
            }
        }
    }

    /// Runs a single gossip round.
    pub async fn round(&mut self) -> RoundOutcome {
        let heartbeat = self.registry.increment_local_heartbeat();
        let target = match self.registry.random_peer(&mut self.rng) {
            None => {
                log::debug!("{} has no members to gossip, will try again in {:?}",
                    self.registry.local_address(), self.gossip_interval);
                return RoundOutcome::NoPeers;
            }
            Some(target) => target,
        };
        let snapshot = self.registry.snapshot();
        let payload = match codec::encode_snapshot(&snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                log::error!("Wasn't able to encode membership list: {}", err);
                return RoundOutcome::Failed { target };
            }
        };
        log::debug!("{} (heartbeat {}) gossiping with {}: {}",
            self.registry.local_address(), heartbeat, target, snapshot);

        if self.loss_probability > 0.0 && self.rng.gen_bool(self.loss_probability) {
            log::debug!("Dropping gossip to {} to simulate packet loss", target);
            return RoundOutcome::Suppressed { target };
        }
        match self.transport.send_to(payload, &target).await {
            Ok(()) => RoundOutcome::Sent { target },
            Err(err) => {
                log::warn!("Wasn't able to gossip with {}: {}", target, err);
                RoundOutcome::Failed { target }
            }
        }
    }
}

/// Pause between receive attempts after an I/O error.
pub const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);
/// I/O errors in a row after which the socket is considered broken.
pub const MAX_CONSECUTIVE_RECEIVE_ERRORS: u32 = 10;

/// Passive cycle: merges every snapshot that arrives into the registry.
pub struct Receiver {
    registry: Arc<MemberRegistry>,
    transport: Arc<dyn Transport>,
    retry_delay: Duration,
    max_consecutive_errors: u32,
}

impl Receiver {
    pub fn new(registry: Arc<MemberRegistry>, transport: Arc<dyn Transport>) -> Receiver {
        Receiver {
            registry,
            transport,
            retry_delay: RECEIVE_RETRY_DELAY,
            max_consecutive_errors: MAX_CONSECUTIVE_RECEIVE_ERRORS,
        }
    }

    pub fn with_retry_policy(mut self, retry_delay: Duration, max_consecutive_errors: u32) -> Receiver {
        self.retry_delay = retry_delay;
        self.max_consecutive_errors = max_consecutive_errors.max(1);
        self
    }

    /// Receives until cancelled or told to stop by a shutdown message.
    ///
    /// An I/O error is retried after `retry_delay`; `max_consecutive_errors`
    /// of them in a row end the loop. A malformed payload or a closed
    /// transport ends the loop at once.
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<(), GossipError> {
        let local = self.registry.local_address().to_owned();
        let mut consecutive_errors = 0;
        loop {
            let datagram = tokio::select! {
                _ = cancellation_token.cancelled() => {
                    log::debug!("Receive loop of {} will be stopped", local);
                    return Ok(());
                }
                result = self.transport.recv() => result,
            };
            let datagram = match datagram {
                Ok(datagram) => {
                    consecutive_errors = 0;
                    datagram
                }
                Err(TransportError::Io(err)) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.max_consecutive_errors {
                        log::error!("{} stops receiving after {} failed attempts: {}", local, consecutive_errors, err);
                        return Err(TransportError::Io(err).into());
                    }
                    log::warn!("{} failed to receive ({}/{}), retrying in {:?}: {}",
                        local, consecutive_errors, self.max_consecutive_errors, self.retry_delay, err);
                    tokio::select! {
                        _ = cancellation_token.cancelled() => {
                            log::debug!("Receive loop of {} will be stopped", local);
                            return Ok(());
                        }
                        _ = time::sleep(self.retry_delay) => continue,
                    }
                }
                Err(err) => {
                    log::error!("{} stops receiving: {}", local, err);
                    return Err(err.into());
                }
            };
            match codec::decode(datagram.payload) {
                Ok(GossipMessage::Snapshot(snapshot)) => {
                    log::debug!("{} received the following members from {}: {}", local, datagram.sender, snapshot);
                    let summary = self.registry.merge(&snapshot);
                    if summary.changed() {
                        log::debug!("{} merged {:?}", local, summary);
                    }
                }
                Ok(GossipMessage::Shutdown) => {
                    log::info!("{} was asked by {} to stop receiving", local, datagram.sender);
                    return Ok(());
                }
                Err(err) => {
                    log::error!("{} received a malformed payload from {}, stops receiving: {}",
                        local, datagram.sender, err);
                    return Err(err.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::error::CodecError;
    use crate::failure_detector::{TimerCommands, TimerHandle};
    use crate::member::{MemberRecord, Snapshot};
    use crate::network::{Datagram, InMemoryNetwork, InMemoryTransport};

    const ME: &str = "ironman:2222";
    const PEER: &str = "hulk:2223";

    fn setup(network: &InMemoryNetwork, peers: &[&str]) -> (Arc<MemberRegistry>, Arc<InMemoryTransport>, TimerCommands) {
        let (timers, commands) = TimerHandle::channel();
        let registry = Arc::new(MemberRegistry::bootstrap(ME, peers.iter().copied(), timers));
        (registry, Arc::new(network.bind(ME)), commands)
    }

    fn decode_snapshot(payload: Bytes) -> Snapshot {
        match codec::decode(payload).unwrap() {
            GossipMessage::Snapshot(snapshot) => snapshot,
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn round_sends_snapshot_with_fresh_heartbeat() {
        let network = InMemoryNetwork::new();
        let peer = network.bind(PEER);
        let (registry, transport, _commands) = setup(&network, &[ME, PEER]);
        let mut disseminator = Disseminator::new(registry.clone(), transport, Duration::from_secs(5), 0.0);

        assert_eq!(RoundOutcome::Sent { target: PEER.to_owned() }, disseminator.round().await);

        let datagram = peer.recv().await.unwrap();
        assert_eq!(ME, datagram.sender);
        let snapshot = decode_snapshot(datagram.payload);
        assert_eq!(Some(1), snapshot.heartbeat_of(ME));
        assert_eq!(Some(0), snapshot.heartbeat_of(PEER));
    }

    #[tokio::test]
    async fn round_without_peers_is_skipped() {
        let network = InMemoryNetwork::new();
        let (registry, transport, _commands) = setup(&network, &[ME]);
        let mut disseminator = Disseminator::new(registry.clone(), transport, Duration::from_secs(5), 0.0);

        assert_eq!(RoundOutcome::NoPeers, disseminator.round().await);
        assert_eq!(1, registry.local_heartbeat());
    }

    #[tokio::test]
    async fn full_loss_suppresses_send_but_heartbeat_advances() {
        let network = InMemoryNetwork::new();
        let peer = network.bind(PEER);
        let (registry, transport, _commands) = setup(&network, &[ME, PEER]);
        let mut disseminator = Disseminator::new(registry.clone(), transport, Duration::from_secs(5), 1.0)
            .with_rng(StdRng::seed_from_u64(3));

        for _ in 0..10 {
            assert_eq!(RoundOutcome::Suppressed { target: PEER.to_owned() }, disseminator.round().await);
        }
        assert_eq!(10, registry.local_heartbeat());

        network.disconnect(PEER);
        assert!(matches!(peer.recv().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn unreachable_peer_does_not_stop_the_round() {
        let network = InMemoryNetwork::new();
        let (registry, transport, _commands) = setup(&network, &[ME, PEER]);
        let mut disseminator = Disseminator::new(registry.clone(), transport, Duration::from_secs(5), 0.0);

        assert_eq!(RoundOutcome::Failed { target: PEER.to_owned() }, disseminator.round().await);
        assert_eq!(1, registry.local_heartbeat());
    }

    #[tokio::test(start_paused = true)]
    async fn run_gossips_once_per_interval() {
        let network = InMemoryNetwork::new();
        let peer = network.bind(PEER);
        let (registry, transport, _commands) = setup(&network, &[ME, PEER]);
        let token = CancellationToken::new();
        let task = tokio::spawn(Disseminator::new(registry.clone(), transport, Duration::from_secs(5), 0.0)
            .run(token.clone()));

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(0, registry.local_heartbeat());
        tokio::time::sleep(Duration::from_millis(10_200)).await;
        assert_eq!(3, registry.local_heartbeat());

        token.cancel();
        task.await.unwrap();
        let mut received = 0;
        while let Ok(Ok(_)) = tokio::time::timeout(Duration::from_millis(1), peer.recv()).await {
            received += 1;
        }
        assert_eq!(3, received);
    }

    #[tokio::test]
    async fn receiver_merges_snapshots_until_shutdown() {
        let network = InMemoryNetwork::new();
        let sender = network.bind(PEER);
        let (registry, transport, _commands) = setup(&network, &[ME, PEER]);
        let task = tokio::spawn(Receiver::new(registry.clone(), transport).run(CancellationToken::new()));

        let snapshot = Snapshot::new(vec![MemberRecord::new(PEER, 4), MemberRecord::new("thor:2226", 1)]);
        sender.send_to(codec::encode_snapshot(&snapshot).unwrap(), ME).await.unwrap();
        sender.send_to(codec::encode(&GossipMessage::Shutdown).unwrap(), ME).await.unwrap();

        task.await.unwrap().unwrap();
        assert_eq!(Some(4), registry.alive_heartbeat(PEER));
        assert_eq!(Some(1), registry.alive_heartbeat("thor:2226"));
    }

    #[tokio::test]
    async fn receiver_stops_on_malformed_payload() {
        let network = InMemoryNetwork::new();
        let sender = network.bind(PEER);
        let (registry, transport, _commands) = setup(&network, &[ME, PEER]);
        let task = tokio::spawn(Receiver::new(registry.clone(), transport).run(CancellationToken::new()));

        sender.send_to(Bytes::from_static(&[42, 0, 0]), ME).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(GossipError::Decode(CodecError::UnsupportedVersion(42)))));
        assert_eq!(Some(0), registry.alive_heartbeat(PEER));
    }

    #[tokio::test]
    async fn receiver_stops_when_transport_closes() {
        let network = InMemoryNetwork::new();
        let (registry, transport, _commands) = setup(&network, &[ME, PEER]);
        let task = tokio::spawn(Receiver::new(registry, transport).run(CancellationToken::new()));

        network.disconnect(ME);

        assert!(matches!(task.await.unwrap(), Err(GossipError::Transport(TransportError::Closed))));
    }

    /// Transport replaying scripted receive results, then reporting closure.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<Datagram, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<Datagram, TransportError>>) -> ScriptedTransport {
            ScriptedTransport { script: Mutex::new(script.into()), calls: AtomicUsize::new(0) }
        }

        fn failing(times: usize) -> ScriptedTransport {
            ScriptedTransport::new((0..times).map(|_| Err(not_connected())).collect())
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn local_address(&self) -> &str {
            ME
        }

        async fn send_to(&self, _payload: Bytes, target: &str) -> Result<(), TransportError> {
            Err(TransportError::UnknownTarget(target.to_owned()))
        }

        async fn recv(&self) -> Result<Datagram, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script.lock().pop_front().unwrap_or(Err(TransportError::Closed))
        }
    }

    fn not_connected() -> TransportError {
        TransportError::Io(std::io::Error::from(std::io::ErrorKind::NotConnected))
    }

    fn registry_for_scripted() -> (Arc<MemberRegistry>, TimerCommands) {
        let (timers, commands) = TimerHandle::channel();
        (Arc::new(MemberRegistry::bootstrap(ME, [ME, PEER], timers)), commands)
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_retries_after_io_error() {
        let (registry, _commands) = registry_for_scripted();
        let snapshot = Snapshot::new(vec![MemberRecord::new(PEER, 7)]);
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(not_connected()),
            Ok(Datagram { payload: codec::encode_snapshot(&snapshot).unwrap(), sender: PEER.to_owned() }),
            Ok(Datagram { payload: codec::encode(&GossipMessage::Shutdown).unwrap(), sender: PEER.to_owned() }),
        ]));

        let started = Instant::now();
        Receiver::new(registry.clone(), transport.clone()).run(CancellationToken::new()).await.unwrap();

        assert_eq!(Some(7), registry.alive_heartbeat(PEER));
        assert_eq!(3, transport.calls.load(Ordering::SeqCst));
        assert!(started.elapsed() >= RECEIVE_RETRY_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_gives_up_on_persistent_io_errors() {
        let (registry, _commands) = registry_for_scripted();
        let transport = Arc::new(ScriptedTransport::failing(100));

        let started = Instant::now();
        let result = Receiver::new(registry, transport.clone())
            .with_retry_policy(Duration::from_millis(50), 5)
            .run(CancellationToken::new())
            .await;

        assert!(matches!(result, Err(GossipError::Transport(TransportError::Io(_)))));
        assert_eq!(5, transport.calls.load(Ordering::SeqCst));
        assert_eq!(Duration::from_millis(200), started.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_error_count_resets_after_success() {
        let (registry, _commands) = registry_for_scripted();
        let snapshot = Snapshot::new(vec![MemberRecord::new(PEER, 1)]);
        let good = || Ok(Datagram { payload: codec::encode_snapshot(&snapshot).unwrap(), sender: PEER.to_owned() });
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(not_connected()), Err(not_connected()), good(),
            Err(not_connected()), Err(not_connected()), good(),
        ]));

        let result = Receiver::new(registry, transport.clone())
            .with_retry_policy(Duration::from_millis(10), 3)
            .run(CancellationToken::new())
            .await;

        // script exhausted, the transport then reports closure
        assert!(matches!(result, Err(GossipError::Transport(TransportError::Closed))));
        assert_eq!(7, transport.calls.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_retry_delay() {
        let (registry, _commands) = registry_for_scripted();
        let transport = Arc::new(ScriptedTransport::failing(100));
        let token = CancellationToken::new();
        let task = tokio::spawn(Receiver::new(registry, transport.clone())
            .with_retry_policy(Duration::from_secs(60), 10)
            .run(token.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        assert!(task.await.unwrap().is_ok());
        assert_eq!(1, transport.calls.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn receiver_stops_on_cancellation() {
        let network = InMemoryNetwork::new();
        let (registry, transport, _commands) = setup(&network, &[ME, PEER]);
        let token = CancellationToken::new();
        let task = tokio::spawn(Receiver::new(registry, transport).run(token.clone()));

        token.cancel();

        assert!(task.await.unwrap().is_ok());
    }
}
