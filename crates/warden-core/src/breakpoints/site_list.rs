//! Address-indexed collection of breakpoint sites.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::site::MAX_TRAP_OPCODE_SIZE;
use super::{BreakpointSite, BreakpointSiteId};
use crate::types::Address;

/// All breakpoint sites of one process
///
/// Holds at most one site per load address. Both the private-state task
/// and client threads touch the list, so every operation takes the internal
/// lock for its own duration only; sites are handed out as `Arc`s.
#[derive(Debug, Default)]
pub struct BreakpointSiteList
{
    next_id: AtomicU64,
    sites: Mutex<BTreeMap<Address, Arc<BreakpointSite>>>,
}

impl BreakpointSiteList
{
    /// Empty list.
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Hand out the next site id.
    pub fn allocate_id(&self) -> BreakpointSiteId
    {
        BreakpointSiteId::from_raw(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Site at `address`, inserting the one `make` builds if there is none.
    ///
    /// Lookup and insert happen under one lock, so concurrent callers at the
    /// same address agree on a single site. The flag is `true` when `make`
    /// ran and its site went in.
    pub fn find_or_insert_with(
        &self,
        address: Address,
        make: impl FnOnce(BreakpointSiteId) -> BreakpointSite,
    ) -> (Arc<BreakpointSite>, bool)
    {
        let mut sites = self.lock();
        if let Some(site) = sites.get(&address) {
            return (Arc::clone(site), false);
        }
        let site = Arc::new(make(self.allocate_id()));
        sites.insert(address, Arc::clone(&site));
        (site, true)
    }

    /// Site by id.
    #[must_use]
    pub fn find_by_id(&self, id: BreakpointSiteId) -> Option<Arc<BreakpointSite>>
    {
        self.lock().values().find(|site| site.id() == id).cloned()
    }

    /// Site trapping exactly `address`.
    #[must_use]
    pub fn find_by_address(&self, address: Address) -> Option<Arc<BreakpointSite>>
    {
        self.lock().get(&address).cloned()
    }

    /// Id of the site trapping exactly `address`.
    #[must_use]
    pub fn find_id_by_address(&self, address: Address) -> Option<BreakpointSiteId>
    {
        self.find_by_address(address).map(|site| site.id())
    }

    /// Sites whose trap bytes overlap `[lower, upper)`, in address order.
    ///
    /// A site starting below `lower` is included when its trap reaches into the range.
    #[must_use]
    pub fn find_in_range(&self, lower: Address, upper: Address) -> Vec<Arc<BreakpointSite>>
    {
        if upper <= lower {
            return Vec::new();
        }
        let size = (upper.value() - lower.value()) as usize;
        self.lock()
            .range(..upper)
            .rev()
            .take_while(|(address, _)| address.value().saturating_add(MAX_TRAP_OPCODE_SIZE as u64) > lower.value())
            .filter(|(_, site)| site.intersects_range(lower, size).is_some())
            .map(|(_, site)| Arc::clone(site))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Remove the site with `id`.
    pub fn remove(&self, id: BreakpointSiteId) -> Option<Arc<BreakpointSite>>
    {
        let mut sites = self.lock();
        let address = sites.iter().find(|(_, site)| site.id() == id).map(|(address, _)| *address)?;
        sites.remove(&address)
    }

    /// Remove the site at `address`.
    pub fn remove_by_address(&self, address: Address) -> Option<Arc<BreakpointSite>>
    {
        self.lock().remove(&address)
    }

    /// Snapshot of every site in address order.
    #[must_use]
    pub fn sites(&self) -> Vec<Arc<BreakpointSite>>
    {
        self.lock().values().cloned().collect()
    }

    /// Number of sites.
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.lock().len()
    }

    /// Whether there are no sites.
    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Address, Arc<BreakpointSite>>>
    {
        self.sites.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::breakpoints::{BreakpointId, BreakpointLocation, LocationId};

    fn site_for(id: BreakpointSiteId, address: Address, breakpoint: u64) -> BreakpointSite
    {
        let owner = Arc::new(BreakpointLocation::new(
            BreakpointId::from_raw(breakpoint),
            LocationId::from_raw(1),
            address,
            false,
        ));
        BreakpointSite::new(id, address, &[0xCC], owner, false)
    }

    #[test]
    fn one_site_per_address()
    {
        let list = BreakpointSiteList::new();
        let address = Address::new(0x1000);

        let (first, created) = list.find_or_insert_with(address, |id| site_for(id, address, 1));
        assert!(created);
        let (second, created) = list.find_or_insert_with(address, |_| unreachable!("site already present"));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn racing_inserts_agree_on_one_site()
    {
        let list = Arc::new(BreakpointSiteList::new());
        let address = Address::new(0x2000);
        let handles: Vec<_> = (1..=8u64)
            .map(|breakpoint| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || list.find_or_insert_with(address, |id| site_for(id, address, breakpoint)))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|handle| handle.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        assert!(results.iter().all(|(site, _)| Arc::ptr_eq(site, &results[0].0)));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn ranges_include_traps_reaching_in_from_below()
    {
        let list = BreakpointSiteList::new();
        for raw in [0x10u64, 0x20, 0x30] {
            let address = Address::new(raw);
            list.find_or_insert_with(address, |id| site_for(id, address, raw));
        }
        let found: Vec<_> = list
            .find_in_range(Address::new(0x10), Address::new(0x21))
            .iter()
            .map(|site| site.load_address())
            .collect();
        assert_eq!(found, vec![Address::new(0x10), Address::new(0x20)]);
        assert!(list.find_in_range(Address::new(0x11), Address::new(0x20)).is_empty());
    }
}
