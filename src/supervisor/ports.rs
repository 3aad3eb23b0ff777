use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use crate::error::CastorError;

/// Hands out worker ports from a reserved contiguous range.
///
/// A port is only handed out after a successful bind probe, so a foreign
/// process squatting inside the range cannot poison an assignment. Owned by
/// the supervisor actor; all mutation happens on its mailbox.
#[derive(Debug)]
pub struct PortAllocator {
    free: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(low: u16, high: u16) -> Self {
        Self {
            free: (low..=high).collect(),
        }
    }

    /// Pop the smallest free port that currently accepts a bind. Ports that
    /// fail the probe stay in the free set; a foreign squatter may vacate.
    pub fn acquire(&mut self) -> Result<u16, CastorError> {
        let mut busy = Vec::new();
        let result = loop {
            match self.free.pop_first() {
                Some(port) if bind_probe(port) => break Ok(port),
                Some(port) => {
                    tracing::warn!(port, "reserved port is already in use, skipping");
                    busy.push(port);
                }
                None => break Err(CastorError::PortExhausted),
            }
        };
        self.free.extend(busy);
        result
    }

    /// Return a port to the free set. Idempotent; only call after the worker
    /// process is confirmed exited.
    pub fn release(&mut self, port: u16) {
        self.free.insert(port);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

fn bind_probe(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_smallest_free_port() {
        let mut alloc = PortAllocator::new(49400, 49402);
        let first = alloc.acquire().unwrap();
        let second = alloc.acquire().unwrap();
        assert!(first < second);
        assert_eq!(alloc.available(), 1);
    }

    #[test]
    fn exhaustion_fails_with_port_exhausted() {
        let mut alloc = PortAllocator::new(49410, 49411);
        alloc.acquire().unwrap();
        alloc.acquire().unwrap();
        assert!(matches!(alloc.acquire(), Err(CastorError::PortExhausted)));
    }

    #[test]
    fn release_is_idempotent() {
        let mut alloc = PortAllocator::new(49420, 49421);
        let port = alloc.acquire().unwrap();
        alloc.release(port);
        alloc.release(port);
        assert_eq!(alloc.available(), 2);
    }

    #[test]
    fn bound_port_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap().port();
        // Range of exactly one, already-bound port: probe fails, acquire errors,
        // but the port stays in the free set for a later attempt.
        let mut alloc = PortAllocator::new(taken, taken);
        assert!(matches!(alloc.acquire(), Err(CastorError::PortExhausted)));
        assert_eq!(alloc.available(), 1);
        drop(listener);
    }
}
