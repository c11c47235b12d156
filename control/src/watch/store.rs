//! Thread-safe keyed store mirroring one remote collection.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use kube::ResourceExt;

use super::{Change, ChangeType, Delta, OnChange};

/// Derives the store key for an object. Bound at construction.
pub type KeyFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Extracts an object's resource version. Bound at construction.
pub type VersionFn<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;

/// A mapping from derived string key to object, safe for concurrent use.
///
/// The optional change callback fires synchronously after each mutating
/// operation succeeds, outside the internal lock, so callbacks may read the
/// store but must not block.
pub struct Store<T> {
    key_fn: KeyFn<T>,
    version_fn: VersionFn<T>,
    state: Mutex<State<T>>,
    on_change: Option<OnChange<T>>,
}

struct State<T> {
    items: HashMap<String, T>,
    resource_version: String,
}

impl<T: Clone> Store<T> {
    pub fn new(key_fn: KeyFn<T>, version_fn: VersionFn<T>, on_change: Option<OnChange<T>>) -> Self {
        Store {
            key_fn,
            version_fn,
            state: Mutex::new(State {
                items: HashMap::new(),
                resource_version: String::new(),
            }),
            on_change,
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        // A panicking callback cannot poison us into uselessness.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn key_of(&self, obj: &T) -> String {
        (self.key_fn)(obj)
    }

    pub fn version_of(&self, obj: &T) -> Option<String> {
        (self.version_fn)(obj)
    }

    pub fn add(&self, obj: T) {
        let key = (self.key_fn)(&obj);
        self.state().items.insert(key, obj.clone());
        self.notify(
            ChangeType::Added,
            Change::Object(Delta {
                old: None,
                new: Some(obj),
            }),
        );
    }

    pub fn update(&self, obj: T) {
        let key = (self.key_fn)(&obj);
        let old = self.state().items.insert(key, obj.clone());
        self.notify(
            ChangeType::Updated,
            Change::Object(Delta {
                old,
                new: Some(obj),
            }),
        );
    }

    /// Removes the entry keyed by `obj`. The delta carries the stored entry
    /// when one existed, otherwise the object passed in.
    pub fn delete(&self, obj: &T) {
        let key = (self.key_fn)(obj);
        let old = self.state().items.remove(&key);
        self.notify(
            ChangeType::Deleted,
            Change::Object(Delta {
                old: old.or_else(|| Some(obj.clone())),
                new: None,
            }),
        );
    }

    pub fn get(&self, obj: &T) -> Option<T> {
        self.get_by_key(&(self.key_fn)(obj))
    }

    pub fn get_by_key(&self, key: &str) -> Option<T> {
        self.state().items.get(key).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.state().items.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    /// Resource version recorded by the last [`Store::replace`].
    pub fn resource_version(&self) -> String {
        self.state().resource_version.clone()
    }

    /// Swaps the full contents for `items`. Duplicate keys are resolved in
    /// favour of the numerically highest resource version; a non-numeric
    /// version ranks below any numeric one. Fires the callback once with the
    /// deduplicated snapshot.
    pub fn replace(&self, items: Vec<T>, resource_version: &str) {
        let mut next: HashMap<String, T> = HashMap::with_capacity(items.len());
        for obj in items {
            let key = (self.key_fn)(&obj);
            match next.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(obj);
                }
                Entry::Occupied(mut slot) => {
                    if numeric_version(self.version_of(&obj))
                        > numeric_version(self.version_of(slot.get()))
                    {
                        slot.insert(obj);
                    }
                }
            }
        }
        let snapshot: Vec<T> = next.values().cloned().collect();
        {
            let mut state = self.state();
            state.items = next;
            state.resource_version = resource_version.to_string();
        }
        self.notify(ChangeType::Replaced, Change::Replaced(snapshot));
    }

    fn notify(&self, change_type: ChangeType, change: Change<T>) {
        if let Some(on_change) = &self.on_change {
            on_change(change_type, change);
        }
    }
}

impl<K> Store<K>
where
    K: kube::Resource<DynamicType = ()> + Clone,
{
    /// Store keyed by `"<namespace>/<name>"` with resource versions taken
    /// from object metadata.
    pub fn for_resource(on_change: Option<OnChange<K>>) -> Self {
        Store::new(
            Arc::new(|obj: &K| {
                format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
            }),
            Arc::new(|obj: &K| obj.resource_version()),
            on_change,
        )
    }
}

/// `None` compares below any parsed version.
fn numeric_version(version: Option<String>) -> Option<u64> {
    version.and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn config_map(name: &str, namespace: &str, resource_version: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn add_get_update_delete() {
        let store: Store<ConfigMap> = Store::for_resource(None);

        let cm = config_map("configmap0", "test", "0");
        store.add(cm.clone());
        assert_eq!(store.len(), 1);
        let found = store.get(&cm).expect("object should exist in store");
        assert_eq!(found.resource_version(), Some("0".to_string()));
        assert!(store.get_by_key("test/configmap0").is_some());

        let newer = config_map("configmap0", "test", "7");
        store.update(newer);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(&cm).unwrap().resource_version(),
            Some("7".to_string())
        );

        store.delete(&cm);
        assert!(store.is_empty());
        assert!(store.get(&cm).is_none());
    }

    #[test]
    fn add_is_idempotent_for_identical_objects() {
        let store: Store<ConfigMap> = Store::for_resource(None);
        let cm = config_map("configmap0", "test", "0");
        store.add(cm.clone());
        store.add(cm.clone());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn callbacks_carry_old_and_new() {
        use std::sync::Mutex;

        type Seen = Arc<Mutex<Vec<(ChangeType, Option<String>, Option<String>)>>>;
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let version = |obj: &Option<ConfigMap>| {
            obj.as_ref().and_then(|cm| cm.metadata.resource_version.clone())
        };
        let store: Store<ConfigMap> = Store::for_resource(Some(Box::new(
            move |change_type, change| {
                if let Change::Object(delta) = change {
                    sink.lock()
                        .unwrap()
                        .push((change_type, version(&delta.old), version(&delta.new)));
                }
            },
        )));

        store.add(config_map("configmap0", "test", "1"));
        store.update(config_map("configmap0", "test", "2"));
        store.delete(&config_map("configmap0", "test", "2"));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (ChangeType::Added, None, Some("1".to_string())),
                (ChangeType::Updated, Some("1".to_string()), Some("2".to_string())),
                (ChangeType::Deleted, Some("2".to_string()), None),
            ]
        );
    }

    #[test]
    fn replace_keeps_highest_resource_version_per_key() {
        let store: Store<ConfigMap> = Store::for_resource(None);
        let items = vec![
            config_map("configmap0", "test", "3"),
            config_map("configmap0", "test", "1"),
            config_map("configmap0", "test", "0"),
            config_map("configmap0", "test", "2"),
            config_map("configmap0", "test", "4"),
        ];
        store.replace(items, "1");

        let items = store.list();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].resource_version(), Some("4".to_string()));
        assert_eq!(store.resource_version(), "1");
    }

    #[test]
    fn replace_ranks_non_numeric_versions_lowest() {
        let store: Store<ConfigMap> = Store::for_resource(None);
        store.replace(
            vec![
                config_map("configmap0", "test", "abc"),
                config_map("configmap0", "test", "2"),
            ],
            "1",
        );
        let items = store.list();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].resource_version(), Some("2".to_string()));
    }

    #[test]
    fn replace_notifies_once_with_snapshot() {
        use std::sync::Mutex;

        let seen: Arc<Mutex<Vec<(ChangeType, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let store: Store<ConfigMap> = Store::for_resource(Some(Box::new(
            move |change_type, change| {
                if let Change::Replaced(items) = change {
                    sink.lock().unwrap().push((change_type, items.len()));
                }
            },
        )));

        store.replace(
            vec![
                config_map("configmap0", "test", "0"),
                config_map("configmap1", "test", "1"),
            ],
            "5",
        );

        assert_eq!(*seen.lock().unwrap(), vec![(ChangeType::Replaced, 2)]);
    }
}
