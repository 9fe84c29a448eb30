//! Leader election.
//!
//! The leader is whichever tracked member holds the smallest row id. Ids are
//! assigned by the store's auto-increment column, so ties cannot happen and
//! the verdict is a pure function of the view. There is no lease: two nodes
//! may briefly both believe they lead during partition healing, and the
//! allocator's idempotent writes let them converge.

use crate::store::Member;

pub fn leader<'a, I>(members: I) -> Option<&'a Member>
where
    I: IntoIterator<Item = &'a Member>,
{
    members.into_iter().min_by_key(|m| m.id)
}

/// Whether the member with `uuid` leads the given view. A uuid not present
/// in the view never leads.
pub fn is_leader<'a, I>(members: I, uuid: &str) -> bool
where
    I: IntoIterator<Item = &'a Member>,
{
    leader(members).map(|m| m.uuid == uuid).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: i64, uuid: &str) -> Member {
        Member {
            id,
            uuid: uuid.to_string(),
            ..Member::default()
        }
    }

    #[test]
    fn smallest_id_wins() {
        let members = vec![member(3, "c"), member(1, "a"), member(2, "b")];
        assert_eq!(leader(&members).unwrap().uuid, "a");
        assert!(is_leader(&members, "a"));
        assert!(!is_leader(&members, "b"));
    }

    #[test]
    fn deterministic_over_orderings() {
        let forward = vec![member(1, "a"), member(2, "b"), member(3, "c")];
        let reverse: Vec<_> = forward.iter().rev().cloned().collect();
        assert_eq!(
            leader(&forward).unwrap().uuid,
            leader(&reverse).unwrap().uuid
        );
    }

    #[test]
    fn absent_uuid_never_leads() {
        let members = vec![member(1, "a")];
        assert!(!is_leader(&members, "ghost"));
        assert!(leader(Vec::<Member>::new().iter()).is_none());
    }
}
