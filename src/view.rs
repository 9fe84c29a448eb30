//! In-memory view of seen peers.
//!
//! Owned exclusively by the reconciler task. Freshness is measured in ticks
//! of this node's own loop, not wall time, so a slow store or a paused
//! process cannot make live peers look stale.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::store::Member;

#[derive(Debug)]
struct SeenPeer {
    member: Member,
    last_heartbeat: i64,
    missed: u32,
}

#[derive(Debug)]
pub struct SupervisorView {
    max_missed: u32,
    peers: HashMap<String, SeenPeer>,
}

impl SupervisorView {
    pub fn new(max_missed: u32) -> Self {
        SupervisorView {
            max_missed,
            peers: HashMap::new(),
        }
    }

    /// Every tracked peer misses one more beat until proven otherwise.
    pub fn begin_tick(&mut self) {
        for peer in self.peers.values_mut() {
            peer.missed += 1;
        }
    }

    /// Fold a fresh `members()` result into the view. New uuids start with a
    /// clean slate; known peers get their snapshot replaced and their missed
    /// counter reset only when the heartbeat actually moved.
    pub fn observe(&mut self, members: Vec<Member>) {
        for member in members {
            match self.peers.entry(member.uuid.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(SeenPeer {
                        last_heartbeat: member.heartbeat,
                        missed: 0,
                        member,
                    });
                }
                Entry::Occupied(mut slot) => {
                    let peer = slot.get_mut();
                    if peer.last_heartbeat != member.heartbeat {
                        peer.missed = 0;
                        peer.last_heartbeat = member.heartbeat;
                    }
                    peer.member = member;
                }
            }
        }
    }

    /// Uuids that have exhausted their missed-beat budget.
    pub fn expired(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, p)| p.missed >= self.max_missed)
            .map(|(uuid, _)| uuid.clone())
            .collect()
    }

    pub fn forget(&mut self, uuid: &str) {
        self.peers.remove(uuid);
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.peers.values().map(|p| &p.member)
    }

    pub fn get(&self, uuid: &str) -> Option<&Member> {
        self.peers.get(uuid).map(|p| &p.member)
    }

    /// Slot to member mapping for everyone the leader has placed.
    pub fn assigned_by_index(&self) -> HashMap<i32, Member> {
        self.peers
            .values()
            .filter(|p| p.member.assigned_index > 0)
            .map(|p| (p.member.assigned_index, p.member.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: i64, uuid: &str, heartbeat: i64) -> Member {
        Member {
            id,
            uuid: uuid.to_string(),
            ip: format!("10.0.0.{id}"),
            heartbeat,
            ..Member::default()
        }
    }

    #[test]
    fn tracked_uuids_match_observed_rows() {
        let mut view = SupervisorView::new(2);
        view.begin_tick();
        view.observe(vec![member(1, "a", 0), member(2, "b", 0)]);
        let mut uuids: Vec<_> = view.members().map(|m| m.uuid.clone()).collect();
        uuids.sort();
        assert_eq!(uuids, vec!["a", "b"]);
        assert!(view.expired().is_empty());
    }

    #[test]
    fn stalled_heartbeat_expires_after_max_missed() {
        let mut view = SupervisorView::new(2);
        view.begin_tick();
        view.observe(vec![member(1, "a", 5)]);

        view.begin_tick();
        view.observe(vec![member(1, "a", 5)]);
        assert!(view.expired().is_empty());

        view.begin_tick();
        view.observe(vec![member(1, "a", 5)]);
        assert_eq!(view.expired(), vec!["a".to_string()]);
    }

    #[test]
    fn advancing_heartbeat_resets_missed() {
        let mut view = SupervisorView::new(2);
        view.begin_tick();
        view.observe(vec![member(1, "a", 1)]);
        for hb in 2..6 {
            view.begin_tick();
            view.observe(vec![member(1, "a", hb)]);
            assert!(view.expired().is_empty());
        }
    }

    #[test]
    fn snapshot_is_replaced_even_when_stale() {
        let mut view = SupervisorView::new(2);
        view.begin_tick();
        view.observe(vec![member(1, "a", 3)]);

        let mut updated = member(1, "a", 3);
        updated.assigned_index = 2;
        view.begin_tick();
        view.observe(vec![updated]);
        assert_eq!(view.get("a").unwrap().assigned_index, 2);
        assert_eq!(view.assigned_by_index().len(), 1);
    }

    #[test]
    fn forget_removes_peer() {
        let mut view = SupervisorView::new(2);
        view.observe(vec![member(1, "a", 0)]);
        view.forget("a");
        assert!(view.get("a").is_none());
        assert_eq!(view.members().count(), 0);
    }
}
