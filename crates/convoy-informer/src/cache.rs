//! Shared resource cache.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use convoy_state::{EventType, LabelSelector, Resource, ResourceKey};

/// Why a subscriber is being told about a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Added,
    Modified,
    Deleted,
    /// Emitted for every present key after a relist.
    Resynced,
}

/// A cache change delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub resource: Arc<Resource>,
}

#[derive(Default)]
struct Index {
    objects: HashMap<ResourceKey, Arc<Resource>>,
    /// owner key → child keys.
    owned: HashMap<ResourceKey, BTreeSet<ResourceKey>>,
    synced: HashSet<String>,
}

impl Index {
    fn insert(&mut self, resource: Arc<Resource>) -> Option<Arc<Resource>> {
        let key = resource.key();
        let previous = self.objects.insert(key.clone(), resource.clone());
        if let Some(old_owner) = previous.as_ref().and_then(|p| p.owner_key())
            && Some(&old_owner) != resource.owner_key().as_ref()
        {
            self.unlink(&old_owner, &key);
        }
        if let Some(owner) = resource.owner_key() {
            self.owned.entry(owner).or_default().insert(key);
        }
        previous
    }

    fn remove(&mut self, key: &ResourceKey) -> Option<Arc<Resource>> {
        let removed = self.objects.remove(key)?;
        if let Some(owner) = removed.owner_key() {
            self.unlink(&owner, key);
        }
        Some(removed)
    }

    fn unlink(&mut self, owner: &ResourceKey, child: &ResourceKey) {
        if let Some(children) = self.owned.get_mut(owner) {
            children.remove(child);
            if children.is_empty() {
                self.owned.remove(owner);
            }
        }
    }
}

/// Writer handle to the shared cache. Held only by informers.
#[derive(Clone, Default)]
pub struct Cache {
    index: Arc<RwLock<Index>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A read-only view for reconcilers.
    pub fn reader(&self) -> CacheReader {
        CacheReader {
            index: self.index.clone(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply one watch event. Returns `None` when the event is not newer
    /// than what the cache already holds for the key.
    pub(crate) fn apply(
        &self,
        event_type: EventType,
        resource: Arc<Resource>,
    ) -> Option<Notification> {
        let key = resource.key();
        let mut index = self.write();
        let cached_version = index.objects.get(&key).map(|r| r.resource_version);

        match event_type {
            EventType::Deleted => {
                match cached_version {
                    Some(v) if v <= resource.resource_version => {
                        index.remove(&key);
                    }
                    // Unknown key, or the cache already has something newer.
                    _ => return None,
                }
                Some(Notification {
                    kind: NotificationKind::Deleted,
                    resource,
                })
            }
            EventType::Added | EventType::Modified => {
                if cached_version.is_some_and(|v| v >= resource.resource_version) {
                    return None;
                }
                let previous = index.insert(resource.clone());
                let kind = if previous.is_some() {
                    NotificationKind::Modified
                } else {
                    NotificationKind::Added
                };
                Some(Notification { kind, resource })
            }
        }
    }

    /// Replace everything cached for `kind` with a fresh listing.
    ///
    /// Keys missing from the listing produce `Deleted`; every listed key
    /// produces `Resynced` so consumers re-examine it even if the diff
    /// missed nothing.
    pub(crate) fn replace_kind(&self, kind: &str, listed: Vec<Resource>) -> Vec<Notification> {
        let mut index = self.write();
        let listed_keys: HashSet<ResourceKey> = listed.iter().map(|r| r.key()).collect();

        let stale: Vec<ResourceKey> = index
            .objects
            .keys()
            .filter(|k| k.kind == kind && !listed_keys.contains(k))
            .cloned()
            .collect();

        let mut notifications = Vec::with_capacity(stale.len() + listed.len());
        for key in stale {
            if let Some(removed) = index.remove(&key) {
                notifications.push(Notification {
                    kind: NotificationKind::Deleted,
                    resource: removed,
                });
            }
        }
        for resource in listed {
            let resource = Arc::new(resource);
            index.insert(resource.clone());
            notifications.push(Notification {
                kind: NotificationKind::Resynced,
                resource,
            });
        }
        index.synced.insert(kind.to_string());
        notifications
    }
}

/// Read-only view of the shared cache.
#[derive(Clone)]
pub struct CacheReader {
    index: Arc<RwLock<Index>>,
}

impl CacheReader {
    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<Resource>> {
        self.read().objects.get(key).cloned()
    }

    /// Cached resources of `kind`, sorted by key.
    pub fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Vec<Arc<Resource>> {
        let index = self.read();
        let mut out: Vec<Arc<Resource>> = index
            .objects
            .values()
            .filter(|r| r.kind == kind)
            .filter(|r| namespace.is_none_or(|ns| r.namespace == ns))
            .filter(|r| selector.matches(&r.labels))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.namespace.cmp(&b.namespace)));
        out
    }

    /// Cached children of `owner` of the given kind, sorted by name.
    ///
    /// Children are matched by owner key; callers that must not adopt a
    /// predecessor's children should also check `Resource::is_owned_by`.
    pub fn children_of(&self, owner: &ResourceKey, child_kind: &str) -> Vec<Arc<Resource>> {
        let index = self.read();
        let Some(keys) = index.owned.get(owner) else {
            return Vec::new();
        };
        keys.iter()
            .filter(|k| k.kind == child_kind)
            .filter_map(|k| index.objects.get(k).cloned())
            .collect()
    }

    /// Owner keys that have cached children but are themselves absent.
    pub fn orphaned_owners(&self) -> Vec<ResourceKey> {
        let index = self.read();
        index
            .owned
            .keys()
            .filter(|owner| !index.objects.contains_key(owner))
            .cloned()
            .collect()
    }

    /// Whether the initial listing for `kind` has landed.
    pub fn has_synced(&self, kind: &str) -> bool {
        self.read().synced.contains(kind)
    }

    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn versioned(kind: &str, name: &str, version: u64) -> Arc<Resource> {
        let mut r = Resource::new(kind, "default", name, json!({}));
        r.resource_version = version;
        r.uid = format!("uid-{name}");
        Arc::new(r)
    }

    fn child_of(owner: &Resource, name: &str, version: u64) -> Arc<Resource> {
        let mut r = Resource::new("Replica", "default", name, json!({})).with_owner(owner);
        r.resource_version = version;
        Arc::new(r)
    }

    #[test]
    fn stale_events_are_dropped() {
        let cache = Cache::new();
        let reader = cache.reader();

        assert!(cache.apply(EventType::Added, versioned("Deployment", "a", 5)).is_some());
        assert!(cache.apply(EventType::Modified, versioned("Deployment", "a", 4)).is_none());
        assert!(cache.apply(EventType::Modified, versioned("Deployment", "a", 5)).is_none());

        let n = cache.apply(EventType::Modified, versioned("Deployment", "a", 7)).unwrap();
        assert_eq!(n.kind, NotificationKind::Modified);
        assert_eq!(reader.get(&n.resource.key()).unwrap().resource_version, 7);

        // A delete older than the cached object is ignored.
        assert!(cache.apply(EventType::Deleted, versioned("Deployment", "a", 6)).is_none());
        let n = cache.apply(EventType::Deleted, versioned("Deployment", "a", 8)).unwrap();
        assert_eq!(n.kind, NotificationKind::Deleted);
        assert!(reader.is_empty());
    }

    #[test]
    fn owner_index_tracks_children() {
        let cache = Cache::new();
        let reader = cache.reader();
        let owner = versioned("StatefulSet", "db", 1);
        cache.apply(EventType::Added, owner.clone());
        cache.apply(EventType::Added, child_of(&owner, "db-1", 3));
        cache.apply(EventType::Added, child_of(&owner, "db-0", 2));

        let children = reader.children_of(&owner.key(), "Replica");
        let names: Vec<&str> = children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["db-0", "db-1"]);
        assert!(reader.children_of(&owner.key(), "ControllerRevision").is_empty());

        cache.apply(EventType::Deleted, child_of(&owner, "db-1", 4));
        assert_eq!(reader.children_of(&owner.key(), "Replica").len(), 1);
    }

    #[test]
    fn orphaned_owners_are_reported() {
        let cache = Cache::new();
        let reader = cache.reader();
        let owner = versioned("Deployment", "web", 1);
        cache.apply(EventType::Added, child_of(&owner, "web-0", 2));

        assert_eq!(reader.orphaned_owners(), vec![owner.key()]);
        cache.apply(EventType::Added, owner.clone());
        assert!(reader.orphaned_owners().is_empty());
    }

    #[test]
    fn replace_kind_diffs_and_resyncs() {
        let cache = Cache::new();
        let reader = cache.reader();
        cache.apply(EventType::Added, versioned("Deployment", "keep", 1));
        cache.apply(EventType::Added, versioned("Deployment", "gone", 2));
        cache.apply(EventType::Added, versioned("Replica", "other-kind", 3));

        let listed = vec![
            (*versioned("Deployment", "keep", 4)).clone(),
            (*versioned("Deployment", "new", 5)).clone(),
        ];
        let notes = cache.replace_kind("Deployment", listed);

        let deleted: Vec<&str> = notes
            .iter()
            .filter(|n| n.kind == NotificationKind::Deleted)
            .map(|n| n.resource.name.as_str())
            .collect();
        assert_eq!(deleted, vec!["gone"]);
        assert_eq!(
            notes
                .iter()
                .filter(|n| n.kind == NotificationKind::Resynced)
                .count(),
            2
        );
        assert!(reader.has_synced("Deployment"));
        assert!(!reader.has_synced("Replica"));
        // Other kinds are untouched.
        assert_eq!(reader.len(), 3);
    }

    #[test]
    fn list_filters_and_sorts() {
        let cache = Cache::new();
        let reader = cache.reader();
        let mut labelled = (*versioned("Replica", "b", 1)).clone();
        labelled.labels.insert("app".to_string(), "web".to_string());
        cache.apply(EventType::Added, Arc::new(labelled));
        cache.apply(EventType::Added, versioned("Replica", "a", 2));

        let all = reader.list("Replica", None, &LabelSelector::everything());
        assert_eq!(all[0].name, "a");
        assert_eq!(all[1].name, "b");

        let web = reader.list("Replica", Some("default"), &LabelSelector::from_pairs([("app", "web")]));
        assert_eq!(web.len(), 1);
    }
}
