//! Host port allocation for backend instances

use crate::error::{Error, Result};
use crate::registry::Registry;
use std::ops::RangeInclusive;
use tracing::debug;

/// Start of the dynamic/private port range
pub const DEFAULT_PORT_RANGE_START: u16 = 49152;
/// End of the dynamic/private port range
pub const DEFAULT_PORT_RANGE_END: u16 = 65535;

/// Hands out host ports from a fixed range.
///
/// A port stays allocated until [`release`](Self::release) is called, which
/// the swap protocol only does once the instance bound to it is torn down.
pub struct PortAllocator {
    start: u16,
    end: u16,
    allocated: Registry<u16, ()>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            allocated: Registry::new("port"),
        }
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }

    /// Claim the lowest free port in the range
    pub fn allocate(&self) -> Result<u16> {
        let port = self
            .allocated
            .claim_first(self.range(), || ())
            .ok_or(Error::Exhausted {
                start: self.start,
                end: self.end,
            })?;
        debug!(port, "Allocated host port");
        Ok(port)
    }

    pub fn release(&self, port: u16) -> Result<()> {
        self.allocated.delete(&port)?;
        debug!(port, "Released host port");
        Ok(())
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    /// Release every port at once (process teardown)
    pub fn release_all(&self) -> Vec<u16> {
        self.allocated.drain().into_iter().map(|(port, _)| port).collect()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE_START, DEFAULT_PORT_RANGE_END)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_allocations_are_distinct_until_exhausted() {
        let ports = PortAllocator::new(40000, 40004);

        let allocated: HashSet<u16> = (0..5).map(|_| ports.allocate().unwrap()).collect();
        assert_eq!(allocated.len(), 5);
        assert!(allocated.iter().all(|p| (40000..=40004).contains(p)));

        let err = ports.allocate().unwrap_err();
        assert!(matches!(err, Error::Exhausted { start: 40000, end: 40004 }));
    }

    #[test]
    fn test_release_makes_port_reusable() {
        let ports = PortAllocator::new(40010, 40011);
        let first = ports.allocate().unwrap();
        let second = ports.allocate().unwrap();
        assert!(ports.allocate().is_err());

        ports.release(first).unwrap();
        assert!(!ports.is_allocated(first));
        assert_eq!(ports.allocate().unwrap(), first);
        assert!(ports.is_allocated(second));
    }

    #[test]
    fn test_release_unknown_port_is_not_found() {
        let ports = PortAllocator::new(40020, 40030);
        assert!(ports.release(40025).unwrap_err().is_not_found());
    }

    #[test]
    fn test_lowest_free_port_first() {
        let ports = PortAllocator::new(40040, 40050);
        assert_eq!(ports.allocate().unwrap(), 40040);
        assert_eq!(ports.allocate().unwrap(), 40041);
        ports.release(40040).unwrap();
        assert_eq!(ports.allocate().unwrap(), 40040);
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        let ports = Arc::new(PortAllocator::new(41000, 41063));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || {
                    (0..8).map(|_| ports.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<u16> = all.iter().copied().collect();
        assert_eq!(all.len(), 64);
        assert_eq!(unique.len(), 64);
        assert_eq!(ports.allocated_count(), 64);
    }

    #[test]
    fn test_release_all() {
        let ports = PortAllocator::new(40100, 40200);
        ports.allocate().unwrap();
        ports.allocate().unwrap();

        let mut released = ports.release_all();
        released.sort();
        assert_eq!(released, vec![40100, 40101]);
        assert_eq!(ports.allocated_count(), 0);
    }
}
