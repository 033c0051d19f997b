use std::fmt;
use std::hash::{Hash, Hasher};

/// A member as the local registry tracks it.
///
/// Identity is the address alone; the heartbeat and timer epoch are mutable
/// state attached to it.
#[derive(Debug, Clone)]
pub struct Member {
    address: String,
    heartbeat: u64,
    // epoch of the armed failure timer, None for self and for dead members
    timer: Option<u64>,
}

impl Member {
    pub(crate) fn untimed(address: impl Into<String>, heartbeat: u64) -> Member {
        return Member { address: address.into(), heartbeat, timer: None };
    }

    pub(crate) fn timed(address: impl Into<String>, heartbeat: u64, epoch: u64) -> Member {
        return Member { address: address.into(), heartbeat, timer: Some(epoch) };
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn heartbeat(&self) -> u64 {
        self.heartbeat
    }

    pub(crate) fn timer_epoch(&self) -> Option<u64> {
        self.timer
    }

    pub(crate) fn set_heartbeat(&mut self, heartbeat: u64) {
        self.heartbeat = heartbeat;
    }

    pub(crate) fn rearm(&mut self, epoch: u64) {
        self.timer = Some(epoch);
    }

    pub(crate) fn into_dead(self) -> Member {
        return Member { timer: None, ..self };
    }

    pub fn record(&self) -> MemberRecord {
        return MemberRecord { address: self.address.clone(), heartbeat: self.heartbeat };
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Member {}

impl Hash for Member {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[address={}, heartbeat={}]", self.address, self.heartbeat)
    }
}

/// The transmitted form of a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub address: String,
    pub heartbeat: u64,
}

impl MemberRecord {
    pub fn new(address: impl Into<String>, heartbeat: u64) -> MemberRecord {
        return MemberRecord { address: address.into(), heartbeat };
    }
}

/// Point in time copy of an alive set, ordered by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    members: Vec<MemberRecord>,
}

impl Snapshot {
    pub fn new(mut members: Vec<MemberRecord>) -> Snapshot {
        members.sort_by(|a, b| a.address.cmp(&b.address));
        return Snapshot { members };
    }

    pub fn members(&self) -> &[MemberRecord] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn heartbeat_of(&self, address: &str) -> Option<u64> {
        self.members.iter().find(|m| m.address == address).map(|m| m.heartbeat)
    }
}

impl FromIterator<MemberRecord> for Snapshot {
    fn from_iter<T: IntoIterator<Item = MemberRecord>>(iter: T) -> Self {
        Snapshot::new(iter.into_iter().collect())
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for member in &self.members {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "[address={}, heartbeat={}]", member.address, member.heartbeat)?;
        }
        Ok(())
    }
}

/// Port component of a `host:port` address.
pub fn port_of(address: &str) -> Option<u16> {
    let (_, port) = address.rsplit_once(':')?;
    return port.parse().ok();
}

#[test]
fn members_are_equal_by_address_only() {
    use std::collections::HashSet;

    let a = Member::untimed("127.0.0.1:2222", 3);
    let b = Member::timed("127.0.0.1:2222", 9, 1);
    assert_eq!(a, b);
    //when
    let set: HashSet<Member> = [a, b].into_iter().collect();
    //then
    assert_eq!(1, set.len());
}

#[test]
fn snapshot_is_ordered_by_address() {
    let snapshot: Snapshot = vec![
        MemberRecord::new("c:3", 1),
        MemberRecord::new("a:1", 2),
        MemberRecord::new("b:2", 3),
    ].into_iter().collect();
    let addresses: Vec<&str> = snapshot.members().iter().map(|m| m.address.as_str()).collect();
    assert_eq!(vec!["a:1", "b:2", "c:3"], addresses);
    assert_eq!(Some(3), snapshot.heartbeat_of("b:2"));
    assert_eq!(None, snapshot.heartbeat_of("d:4"));
}

#[test]
fn port_is_taken_after_last_colon() {
    assert_eq!(Some(2222), port_of("ironman:2222"));
    assert_eq!(Some(8080), port_of("::1:8080"));
    assert_eq!(None, port_of("no-port"));
    assert_eq!(None, port_of("host:99999"));
}

#[test]
fn dead_member_drops_timer() {
    //when
    let member = Member::timed("a:1", 5, 7).into_dead();
    //then
    assert_eq!(None, member.timer_epoch());
    assert_eq!(5, member.heartbeat());
}
