//! Leader-only slot assignment.
//!
//! Binds each member to an ordinal slot in 1..=N. Members that already hold
//! a slot are never moved; a member that asked for its previous slot gets it
//! back when the slot is free; remaining members fill the gaps in id order.
//! Running the same membership through twice changes nothing, which is what
//! makes concurrent leaders during partition healing safe.

use std::collections::HashMap;

use log::info;

use crate::store::Member;

pub struct Allocation {
    pub by_index: HashMap<i32, Member>,
    pub changed: bool,
}

pub fn assign<'a, I>(members: I, cluster_size: i32) -> Allocation
where
    I: IntoIterator<Item = &'a Member>,
{
    let mut changed = false;
    let mut by_index: HashMap<i32, Member> = HashMap::new();
    let mut unplaced: Vec<Member> = Vec::new();

    for member in members {
        if member.assigned_index > 0 {
            by_index.insert(member.assigned_index, member.clone());
        } else {
            unplaced.push(member.clone());
        }
    }
    unplaced.sort_by_key(|m| m.id);

    // Request pass: previous slot holders get their slot back when free.
    unplaced.retain(|member| {
        let wanted = member.requested_index;
        if wanted <= 0 || wanted > cluster_size || by_index.contains_key(&wanted) {
            return true;
        }
        info!(
            "assigning {} {} to index {} by request",
            member.uuid, member.ip, wanted
        );
        changed = true;
        by_index.insert(wanted, member.clone());
        false
    });

    // Fill pass: remaining members take empty slots in id order.
    let mut rest = unplaced.into_iter();
    for i in 1..=cluster_size {
        if by_index.contains_key(&i) {
            continue;
        }
        let Some(member) = rest.next() else { break };
        info!("assigning {} {} to index {}", member.uuid, member.ip, i);
        changed = true;
        by_index.insert(i, member);
    }

    Allocation { by_index, changed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn member(id: i64, uuid: &str, requested: i32, assigned: i32) -> Member {
        Member {
            id,
            uuid: uuid.to_string(),
            ip: format!("10.0.0.{id}"),
            requested_index: requested,
            assigned_index: assigned,
            ..Member::default()
        }
    }

    #[test]
    fn fills_in_id_order() {
        let members = vec![
            member(2, "b", 0, 0),
            member(1, "a", 0, 0),
            member(3, "c", 0, 0),
        ];
        let alloc = assign(&members, 3);
        assert!(alloc.changed);
        assert_eq!(alloc.by_index[&1].uuid, "a");
        assert_eq!(alloc.by_index[&2].uuid, "b");
        assert_eq!(alloc.by_index[&3].uuid, "c");
    }

    #[test]
    fn fixed_membership_is_idempotent() {
        let members = vec![member(1, "a", 0, 1), member(2, "b", 0, 2)];
        let alloc = assign(&members, 3);
        assert!(!alloc.changed);
        assert_eq!(alloc.by_index.len(), 2);
    }

    #[test]
    fn requested_slot_wins_over_fill() {
        let members = vec![
            member(1, "a", 0, 1),
            member(2, "b", 0, 2),
            member(4, "c-reborn", 3, 0),
        ];
        let alloc = assign(&members, 3);
        assert!(alloc.changed);
        assert_eq!(alloc.by_index[&3].uuid, "c-reborn");
    }

    #[test]
    fn taken_request_falls_through_to_fill() {
        let members = vec![member(1, "a", 0, 1), member(2, "b", 1, 0)];
        let alloc = assign(&members, 3);
        assert_eq!(alloc.by_index[&1].uuid, "a");
        assert_eq!(alloc.by_index[&2].uuid, "b");
    }

    #[test]
    fn out_of_range_request_is_ignored() {
        let members = vec![member(1, "a", 5, 0)];
        let alloc = assign(&members, 3);
        assert_eq!(alloc.by_index[&1].uuid, "a");
        assert_eq!(alloc.by_index.len(), 1);
    }

    #[test]
    fn lost_member_leaves_slot_empty_without_churn() {
        // Two survivors of a three-node cluster keep their slots.
        let members = vec![member(1, "a", 0, 1), member(2, "b", 0, 2)];
        let alloc = assign(&members, 3);
        assert!(!alloc.changed);
        assert!(!alloc.by_index.contains_key(&3));
    }

    #[test]
    fn leader_change_does_not_reassign() {
        // The old leader at slot 1 is gone; b and c stay where they were and
        // slot 1 stays open for a rejoiner.
        let members = vec![member(2, "b", 0, 2), member(3, "c", 0, 3)];
        let alloc = assign(&members, 3);
        assert!(!alloc.changed);
        assert_eq!(alloc.by_index[&2].uuid, "b");
        assert_eq!(alloc.by_index[&3].uuid, "c");
    }

    proptest! {
        /// Assigned indices stay unique within 1..=N, honored requests keep
        /// their slot, and every slot fills when enough members exist.
        #[test]
        fn assignment_invariants(
            cluster_size in 1i32..8,
            requests in proptest::collection::vec(0i32..10, 0..12),
        ) {
            let members: Vec<Member> = requests
                .iter()
                .enumerate()
                .map(|(i, &req)| member(i as i64 + 1, &format!("m{i}"), req, 0))
                .collect();

            let alloc = assign(&members, cluster_size);

            for index in alloc.by_index.keys() {
                prop_assert!(*index >= 1 && *index <= cluster_size);
            }
            prop_assert_eq!(
                alloc.by_index.len(),
                members.len().min(cluster_size as usize)
            );

            // A fresh run over the resulting assignment changes nothing.
            let assigned: Vec<Member> = alloc
                .by_index
                .iter()
                .map(|(index, m)| {
                    let mut m = m.clone();
                    m.assigned_index = *index;
                    m.requested_index = 0;
                    m
                })
                .collect();
            let again = assign(&assigned, cluster_size);
            prop_assert!(!again.changed);
        }

        /// A requested slot that is free before the request pass is granted.
        #[test]
        fn free_requests_are_honored(slot in 1i32..6) {
            let members = vec![member(7, "wants-slot", slot, 0)];
            let alloc = assign(&members, 6);
            prop_assert_eq!(alloc.by_index[&slot].uuid.as_str(), "wants-slot");
        }
    }
}
