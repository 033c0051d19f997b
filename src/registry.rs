use std::collections::BTreeMap;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::failure_detector::TimerHandle;
use crate::member::{Member, Snapshot};

/// What a single merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub updated: usize,
    pub resurrected: usize,
    pub added: usize,
    pub ignored: usize,
}

impl MergeSummary {
    pub fn changed(&self) -> bool {
        self.updated + self.resurrected + self.added > 0
    }
}

#[derive(Debug)]
struct Members {
    alive: BTreeMap<String, Member>,
    dead: BTreeMap<String, Member>,
    next_epoch: u64,
}

impl Members {
    fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

/// Alive and dead members of the cluster as seen by this node.
///
/// Both sets sit behind one lock, so merge, eviction and snapshots observe
/// and leave them in a consistent state. An address is in at most one of
/// them, and every alive member except self has an armed failure timer.
#[derive(Debug)]
pub struct MemberRegistry {
    local_address: String,
    members: Mutex<Members>,
    timers: TimerHandle,
}

impl MemberRegistry {
    /// Registry holding only self.
    pub fn new(local_address: impl Into<String>, timers: TimerHandle) -> MemberRegistry {
        let local_address = local_address.into();
        let mut alive = BTreeMap::new();
        alive.insert(local_address.clone(), Member::untimed(local_address.clone(), 0));
        MemberRegistry {
            local_address,
            members: Mutex::new(Members { alive, dead: BTreeMap::new(), next_epoch: 0 }),
            timers,
        }
    }

    /// Registry with every peer alive at heartbeat 0 and its timer armed.
    pub fn bootstrap<'a, I>(local_address: impl Into<String>, peers: I, timers: TimerHandle) -> MemberRegistry
        where I: IntoIterator<Item = &'a str>,
    {
        let registry = MemberRegistry::new(local_address, timers);
        {
            let mut members = registry.members.lock();
            for peer in peers {
                if peer == registry.local_address || members.alive.contains_key(peer) {
                    continue;
                }
                let epoch = members.next_epoch();
                members.alive.insert(peer.to_owned(), Member::timed(peer, 0, epoch));
                registry.timers.arm(peer, epoch);
            }
        }
        registry
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    pub fn snapshot(&self) -> Snapshot {
        let members = self.members.lock();
        members.alive.values().map(Member::record).collect()
    }

    /// Reconciles a remote view with the local one.
    ///
    /// A remote record only changes local state when its heartbeat is
    /// strictly greater than what is known locally, so merging is idempotent
    /// and insensitive to delivery order. Records about self are ignored.
    pub fn merge(&self, remote: &Snapshot) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let mut members = self.members.lock();
        for record in remote.members() {
            if record.address == self.local_address {
                summary.ignored += 1;
                continue;
            }

            if let Some(local) = members.alive.get(&record.address) {
                if local.heartbeat() < record.heartbeat {
                    let epoch = members.next_epoch();
                    if let Some(local) = members.alive.get_mut(&record.address) {
                        local.set_heartbeat(record.heartbeat);
                        local.rearm(epoch);
                    }
                    self.timers.arm(&record.address, epoch);
                    summary.updated += 1;
                } else {
                    summary.ignored += 1;
                }
                continue;
            }

            match members.dead.get(&record.address).map(Member::heartbeat) {
                Some(dead_heartbeat) if dead_heartbeat >= record.heartbeat => {
                    summary.ignored += 1;
                }
                Some(dead_heartbeat) => {
                    members.dead.remove(&record.address);
                    let epoch = members.next_epoch();
                    members.alive.insert(record.address.clone(),
                                         Member::timed(record.address.clone(), record.heartbeat, epoch));
                    self.timers.arm(&record.address, epoch);
                    log::info!("{} is back from the dead, heartbeat {} -> {}",
                        record.address, dead_heartbeat, record.heartbeat);
                    summary.resurrected += 1;
                }
                None => {
                    let epoch = members.next_epoch();
                    members.alive.insert(record.address.clone(),
                                         Member::timed(record.address.clone(), record.heartbeat, epoch));
                    self.timers.arm(&record.address, epoch);
                    log::info!("{} learned about new member {}", self.local_address, record.address);
                    summary.added += 1;
                }
            }
        }
        summary
    }

    /// Moves an alive member to the dead set, keeping its last heartbeat.
    ///
    /// Returns false when the address is not alive or is self.
    pub fn evict(&self, address: &str) -> bool {
        let mut members = self.members.lock();
        if self.move_to_dead(&mut members, address) {
            self.timers.disarm(address);
            return true;
        }
        false
    }

    /// Eviction requested by an expired failure timer.
    ///
    /// Ignored unless `epoch` is the member's current timer, which discards
    /// expiries that raced a reset or a resurrection.
    pub(crate) fn expire(&self, address: &str, epoch: u64) -> bool {
        let mut members = self.members.lock();
        let current = members.alive.get(address).and_then(Member::timer_epoch);
        if current != Some(epoch) {
            log::debug!("Ignoring stale expiry of {} (epoch {}, current {:?})", address, epoch, current);
            return false;
        }
        self.move_to_dead(&mut members, address)
    }

    fn move_to_dead(&self, members: &mut Members, address: &str) -> bool {
        if address == self.local_address {
            return false;
        }
        match members.alive.remove(address) {
            Some(member) => {
                log::info!("Dead member detected: {}", member);
                members.dead.insert(address.to_owned(), member.into_dead());
                true
            }
            None => false,
        }
    }

    /// Advances self's heartbeat by one and returns the new value.
    pub fn increment_local_heartbeat(&self) -> u64 {
        let mut members = self.members.lock();
        match members.alive.get_mut(&self.local_address) {
            Some(me) => {
                let heartbeat = me.heartbeat() + 1;
                me.set_heartbeat(heartbeat);
                heartbeat
            }
            None => 0,
        }
    }

    /// Uniformly random alive member other than self.
    pub fn random_peer<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<String> {
        let members = self.members.lock();
        let peers: Vec<&String> = members.alive.keys()
            .filter(|address| **address != self.local_address)
            .collect();
        peers.choose(rng).map(|address| (*address).clone())
    }

    pub fn local_heartbeat(&self) -> u64 {
        self.alive_heartbeat(&self.local_address).unwrap_or_default()
    }

    pub fn alive_heartbeat(&self, address: &str) -> Option<u64> {
        self.members.lock().alive.get(address).map(Member::heartbeat)
    }

    pub fn dead_heartbeat(&self, address: &str) -> Option<u64> {
        self.members.lock().dead.get(address).map(Member::heartbeat)
    }

    pub fn is_alive(&self, address: &str) -> bool {
        self.members.lock().alive.contains_key(address)
    }

    pub fn is_dead(&self, address: &str) -> bool {
        self.members.lock().dead.contains_key(address)
    }

    pub fn alive_addresses(&self) -> Vec<String> {
        self.members.lock().alive.keys().cloned().collect()
    }

    pub fn dead_addresses(&self) -> Vec<String> {
        self.members.lock().dead.keys().cloned().collect()
    }

    /// Number of alive members other than self.
    pub fn peer_count(&self) -> usize {
        self.members.lock().alive.len().saturating_sub(1)
    }

    #[cfg(test)]
    fn timer_epoch(&self, address: &str) -> Option<u64> {
        let members = self.members.lock();
        members.alive.get(address)
            .or_else(|| members.dead.get(address))
            .and_then(Member::timer_epoch)
    }
}
