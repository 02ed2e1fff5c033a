//! Simulated network egress provider

use super::take_one;
use crate::upstream::{EgressAssignment, EgressError, EgressProvider, InterfaceRef};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const LOCATIONS: [&str; 4] = ["Frankfurt, DE", "Amsterdam, NL", "Toronto, CA", "Dallas, US"];

#[derive(Debug, Clone)]
struct Tunnel {
    interface: InterfaceRef,
    assignment: EgressAssignment,
}

#[derive(Debug, Default)]
pub struct SimulatedEgressProvider {
    tunnels: DashMap<String, Tunnel>,
    connect_delay: Mutex<Duration>,
    failing_connects: AtomicU32,
    failing_disconnects: AtomicU32,
    allocations: AtomicU32,
}

impl SimulatedEgressProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self.connect_delay.lock() = delay;
        self
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_disconnects(&self, count: u32) {
        self.failing_disconnects.store(count, Ordering::SeqCst);
    }

    pub fn is_connected(&self, box_id: &str) -> bool {
        self.tunnels.contains_key(box_id)
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Move an established tunnel to a new exit address, as a provider-side reroute would
    pub fn reroute(&self, box_id: &str) -> bool {
        let next = self.allocate();
        match self.tunnels.get_mut(box_id) {
            Some(mut tunnel) => {
                tunnel.assignment = next;
                true
            }
            None => false,
        }
    }

    fn allocate(&self) -> EgressAssignment {
        let n = self.allocations.fetch_add(1, Ordering::SeqCst) + 1;
        EgressAssignment {
            address: format!("10.8.{}.{}", n / 250, n % 250 + 2),
            location: LOCATIONS[n as usize % LOCATIONS.len()].to_string(),
        }
    }
}

#[async_trait]
impl EgressProvider for SimulatedEgressProvider {
    async fn connect(&self, box_id: &str, profile: &str) -> Result<EgressAssignment, EgressError> {
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if take_one(&self.failing_connects) {
            return Err(EgressError::new(format!("profile '{profile}' handshake failed")));
        }

        let assignment = self.allocate();
        let interface = format!("tun{}", self.tunnels.len());
        self.tunnels.insert(
            box_id.to_string(),
            Tunnel {
                interface,
                assignment: assignment.clone(),
            },
        );
        Ok(assignment)
    }

    async fn disconnect(&self, box_id: &str) -> Result<(), EgressError> {
        if take_one(&self.failing_disconnects) {
            return Err(EgressError::new(format!("tunnel for box '{box_id}' did not close")));
        }
        self.tunnels.remove(box_id);
        Ok(())
    }

    async fn lookup(&self, box_id: &str) -> Result<EgressAssignment, EgressError> {
        self.tunnels
            .get(box_id)
            .map(|t| t.assignment.clone())
            .ok_or_else(|| EgressError::new(format!("no tunnel for box '{box_id}'")))
    }

    async fn current_interface(&self, box_id: &str) -> Option<InterfaceRef> {
        self.tunnels.get(box_id).map(|t| t.interface.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_disconnect_cycle() {
        let egress = SimulatedEgressProvider::new();
        let assignment = egress.connect("box-1", "eu-west").await.unwrap();
        assert!(egress.is_connected("box-1"));
        assert_eq!(egress.lookup("box-1").await.unwrap(), assignment);
        assert!(egress.current_interface("box-1").await.is_some());

        egress.disconnect("box-1").await.unwrap();
        assert!(!egress.is_connected("box-1"));
        assert!(egress.current_interface("box-1").await.is_none());
    }

    #[tokio::test]
    async fn test_injected_connect_failure_is_one_shot() {
        let egress = SimulatedEgressProvider::new();
        egress.fail_next_connects(1);
        assert!(egress.connect("box-1", "eu-west").await.is_err());
        assert!(egress.connect("box-1", "eu-west").await.is_ok());
    }

    #[tokio::test]
    async fn test_reroute_changes_lookup() {
        let egress = SimulatedEgressProvider::new();
        let first = egress.connect("box-1", "eu-west").await.unwrap();
        assert!(egress.reroute("box-1"));
        assert_ne!(egress.lookup("box-1").await.unwrap(), first);
    }
}
