//! Multicast address pool for call media groups.
//!
//! Addresses come from the administratively-scoped 239.192.0.0/16 block,
//! derived from a monotonic counter. A freed triple goes onto a free list and
//! is handed out again before the counter advances; two live calls never
//! share an address. The counter never wraps: once the /16 is exhausted and
//! the free list is empty, allocation fails instead of re-issuing a live
//! address.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};

use crate::domain::roster::MediaAddrs;

/// First two octets of every allocated group address.
const SCOPE_PREFIX: [u8; 2] = [239, 192];

/// Highest usable counter value; index 0 is the subnet base and is skipped.
const MAX_INDEX: u32 = u16::MAX as u32;

#[derive(Debug, Default)]
pub struct MulticastAddrPool {
    next: u32,
    free: VecDeque<MediaAddrs>,
}

impl MulticastAddrPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the audio/video/chat triple for a new call, or `None` when
    /// the scope is exhausted.
    pub fn allocate(&mut self) -> Option<MediaAddrs> {
        if let Some(addrs) = self.free.pop_front() {
            return Some(addrs);
        }
        if self.next + 3 > MAX_INDEX {
            return None;
        }
        let audio = self.next_addr();
        let video = self.next_addr();
        let chat = self.next_addr();
        Some(MediaAddrs { audio, video, chat })
    }

    /// Return a triple to the pool. Called only when its call fully dissolves.
    pub fn release(&mut self, addrs: MediaAddrs) {
        self.free.push_back(addrs);
    }

    fn next_addr(&mut self) -> IpAddr {
        // Counter 0 would yield 239.192.0.0, the subnet base; skip it.
        self.next += 1;
        let [hi, lo] = (self.next as u16).to_be_bytes();
        IpAddr::V4(Ipv4Addr::new(SCOPE_PREFIX[0], SCOPE_PREFIX[1], hi, lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn triples_are_disjoint() {
        let mut pool = MulticastAddrPool::new();
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let a = pool.allocate().unwrap();
            for ip in [a.audio, a.video, a.chat] {
                assert!(seen.insert(ip), "address {ip} allocated twice");
            }
        }
    }

    #[test]
    fn released_triple_is_recycled_first() {
        let mut pool = MulticastAddrPool::new();
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();
        pool.release(first);
        assert_eq!(pool.allocate(), Some(first));
        let third = pool.allocate().unwrap();
        assert_ne!(third, first);
        assert_ne!(third, second);
    }

    #[test]
    fn addresses_stay_in_scope() {
        let mut pool = MulticastAddrPool::new();
        let a = pool.allocate().unwrap();
        for ip in [a.audio, a.video, a.chat] {
            match ip {
                IpAddr::V4(v4) => {
                    assert!(v4.is_multicast());
                    assert_eq!(v4.octets()[..2], SCOPE_PREFIX);
                }
                IpAddr::V6(_) => panic!("pool only hands out IPv4 groups"),
            }
        }
    }

    #[test]
    fn exhausted_scope_fails_instead_of_reissuing() {
        let mut pool = MulticastAddrPool::new();
        let mut seen = HashSet::new();
        let mut last = None;
        while let Some(a) = pool.allocate() {
            for ip in [a.audio, a.video, a.chat] {
                assert!(seen.insert(ip), "address {ip} allocated twice");
            }
            last = Some(a);
        }
        // 65535 usable indexes, three per call.
        assert_eq!(seen.len() / 3, 21845);
        assert_eq!(pool.allocate(), None);

        let freed = last.unwrap();
        pool.release(freed);
        assert_eq!(pool.allocate(), Some(freed));
        assert_eq!(pool.allocate(), None);
    }
}
