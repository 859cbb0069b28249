//! Access predicates derived from a thread's type, sharing mode and
//! whitelist. The initiator passes every check.

use loom_shared::types::{Address, ThreadSharing, ThreadType};
use loom_store::ThreadRecord;

fn is_member(thread: &ThreadRecord, addr: &Address) -> bool {
    thread.whitelist.is_empty() || thread.whitelist.contains(addr)
}

pub fn readable(thread: &ThreadRecord, addr: &Address) -> bool {
    if thread.initiator == *addr {
        return true;
    }
    match thread.thread_type {
        ThreadType::Private => false,
        ThreadType::ReadOnly | ThreadType::Public | ThreadType::Open => is_member(thread, addr),
    }
}

pub fn annotatable(thread: &ThreadRecord, addr: &Address) -> bool {
    if thread.initiator == *addr {
        return true;
    }
    match thread.thread_type {
        ThreadType::Private | ThreadType::ReadOnly => false,
        ThreadType::Public | ThreadType::Open => is_member(thread, addr),
    }
}

pub fn writable(thread: &ThreadRecord, addr: &Address) -> bool {
    if thread.initiator == *addr {
        return true;
    }
    match thread.thread_type {
        ThreadType::Open => is_member(thread, addr),
        _ => false,
    }
}

pub fn shareable(thread: &ThreadRecord, from: &Address, to: &Address) -> bool {
    match thread.sharing {
        ThreadSharing::NotShared => false,
        ThreadSharing::InviteOnly => thread.initiator == *from && is_member(thread, to),
        ThreadSharing::Shared => is_member(thread, from) && is_member(thread, to),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loom_shared::types::ThreadId;

    const OWNER: Address = Address([1u8; 32]);
    const MEMBER: Address = Address([2u8; 32]);
    const OUTSIDER: Address = Address([3u8; 32]);

    fn thread(thread_type: ThreadType, sharing: ThreadSharing, whitelist: Vec<Address>) -> ThreadRecord {
        ThreadRecord {
            id: ThreadId([0u8; 32]),
            key: "k".to_string(),
            secret: [0u8; 32],
            name: "t".to_string(),
            schema: None,
            initiator: OWNER,
            thread_type,
            sharing,
            whitelist,
            head: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_private_is_initiator_only() {
        let t = thread(ThreadType::Private, ThreadSharing::NotShared, vec![]);
        assert!(readable(&t, &OWNER));
        assert!(!readable(&t, &MEMBER));
        assert!(!annotatable(&t, &MEMBER));
        assert!(!writable(&t, &MEMBER));
    }

    #[test]
    fn test_read_only_reads_but_never_annotates() {
        let t = thread(ThreadType::ReadOnly, ThreadSharing::Shared, vec![]);
        assert!(readable(&t, &MEMBER));
        assert!(!annotatable(&t, &MEMBER));
        assert!(!writable(&t, &MEMBER));
        assert!(writable(&t, &OWNER));
    }

    #[test]
    fn test_public_annotates_open_writes() {
        let public = thread(ThreadType::Public, ThreadSharing::Shared, vec![]);
        assert!(annotatable(&public, &MEMBER));
        assert!(!writable(&public, &MEMBER));

        let open = thread(ThreadType::Open, ThreadSharing::Shared, vec![]);
        assert!(writable(&open, &MEMBER));
    }

    #[test]
    fn test_whitelist_limits_membership() {
        let t = thread(ThreadType::Open, ThreadSharing::Shared, vec![MEMBER]);
        assert!(writable(&t, &MEMBER));
        assert!(!readable(&t, &OUTSIDER));
        assert!(!writable(&t, &OUTSIDER));
        assert!(readable(&t, &OWNER));
    }

    #[test]
    fn test_sharing_modes() {
        let none = thread(ThreadType::Open, ThreadSharing::NotShared, vec![]);
        assert!(!shareable(&none, &OWNER, &MEMBER));

        let invite_only = thread(ThreadType::Open, ThreadSharing::InviteOnly, vec![MEMBER]);
        assert!(shareable(&invite_only, &OWNER, &MEMBER));
        assert!(!shareable(&invite_only, &MEMBER, &OWNER));
        assert!(!shareable(&invite_only, &OWNER, &OUTSIDER));

        let shared = thread(ThreadType::Open, ThreadSharing::Shared, vec![MEMBER]);
        assert!(!shareable(&shared, &MEMBER, &OUTSIDER));
        assert!(!shareable(&shared, &OUTSIDER, &MEMBER));
    }
}
