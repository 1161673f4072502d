use std::sync::Arc;

use dashmap::DashMap;

use crate::group::Group;

/// Concurrent `stream_name -> Group` registry. Lookup is lock-free; insert
/// and delete are serialized by the owning ServerManager, and iteration
/// tolerates concurrent per-group mutation.
pub struct GroupManager {
    groups: DashMap<String, Arc<Group>>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self {
            groups: DashMap::new(),
        }
    }

    pub fn get_group(&self, stream_name: &str) -> Option<Arc<Group>> {
        self.groups
            .get(stream_name)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn get_or_create_group(
        &self,
        stream_name: &str,
        create: impl FnOnce() -> Arc<Group>,
    ) -> Arc<Group> {
        Arc::clone(
            self.groups
                .entry(stream_name.to_string())
                .or_insert_with(create)
                .value(),
        )
    }

    pub fn del_group(&self, stream_name: &str) -> Option<Arc<Group>> {
        self.groups.remove(stream_name).map(|(_, group)| group)
    }

    /// Visits every group until `visit` returns false. The callback must not
    /// touch the registry itself; group-level mutation is fine.
    pub fn iterate<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<Group>) -> bool,
    {
        for entry in self.groups.iter() {
            if !visit(entry.value()) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new()
    }
}
