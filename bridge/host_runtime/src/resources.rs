//! Integer handles for native objects the embedded side refers to.
//!
//! The table only holds weak references. Dropping the last `Arc` makes the
//! handle stale: lookups then fail with `UnknownResourceId` instead of
//! reaching freed memory. Entries still have to be removed explicitly with
//! [`ResourceTable::unregister`] (or swept with [`ResourceTable::prune`]).

use crate::error::{BusError, BusResult};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub type ResourceId = i64;

struct Entry {
    resource: Weak<dyn Any + Send + Sync>,
    addr: usize,
}

pub struct ResourceTable {
    next_id: ResourceId,
    by_id: HashMap<ResourceId, Entry>,
    by_addr: HashMap<usize, ResourceId>,
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self {
            next_id: 1,
            by_id: HashMap::new(),
            by_addr: HashMap::new(),
        }
    }
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing id for `resource`, registering it first if needed.
    pub fn get_resource_id<T: Any + Send + Sync>(&mut self, resource: &Arc<T>) -> ResourceId {
        let addr = address_of(resource);
        // The weak reference pins the allocation, so an address cannot be
        // handed to a different object while its entry exists.
        if let Some(&id) = self.by_addr.get(&addr) {
            return id;
        }

        let id = self.next_id;
        self.next_id += 1;

        let erased: Arc<dyn Any + Send + Sync> = resource.clone();
        self.by_id.insert(
            id,
            Entry {
                resource: Arc::downgrade(&erased),
                addr,
            },
        );
        self.by_addr.insert(addr, id);
        id
    }

    pub fn id_of<T: Any + Send + Sync>(&self, resource: &Arc<T>) -> Option<ResourceId> {
        self.by_addr.get(&address_of(resource)).copied()
    }

    /// Fails when the id was never issued, was unregistered, its object has
    /// been dropped, or the object is not a `T`.
    pub fn resource_for<T: Any + Send + Sync>(&self, id: ResourceId) -> BusResult<Arc<T>> {
        let entry = self.by_id.get(&id).ok_or(BusError::UnknownResourceId(id))?;
        let resource = entry
            .resource
            .upgrade()
            .ok_or(BusError::UnknownResourceId(id))?;
        resource
            .downcast::<T>()
            .map_err(|_| BusError::UnknownResourceId(id))
    }

    pub fn unregister(&mut self, id: ResourceId) -> BusResult<()> {
        let entry = self
            .by_id
            .remove(&id)
            .ok_or(BusError::UnknownResourceId(id))?;
        self.by_addr.remove(&entry.addr);
        Ok(())
    }

    /// Drops entries whose object no longer exists and returns how many.
    pub fn prune(&mut self) -> usize {
        let dead: Vec<ResourceId> = self
            .by_id
            .iter()
            .filter(|(_, entry)| entry.resource.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();

        for id in &dead {
            if let Some(entry) = self.by_id.remove(id) {
                self.by_addr.remove(&entry.addr);
            }
        }
        dead.len()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Forgets every handle; ids keep counting up from where they were.
    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_addr.clear();
    }
}

fn address_of<T>(resource: &Arc<T>) -> usize {
    Arc::as_ptr(resource) as *const () as usize
}
