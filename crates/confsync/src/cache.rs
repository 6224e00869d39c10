//! In-memory settings cache.
//!
//! Every mutator reports whether content actually changed; callers use that
//! to decide whether to notify, so replicas never see no-op updates.

use serde_json::Value;

use confsync_protocol::SettingsMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsCache {
    entries: SettingsMap,
}

impl SettingsCache {
    pub fn from_map(entries: SettingsMap) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store `value` unless it is structurally equal to the current one.
    pub fn put(&mut self, key: &str, value: Value) -> bool {
        if self.entries.get(key) == Some(&value) {
            return false;
        }
        self.entries.insert(key.to_string(), value);
        true
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Replace the whole content unless it is already equal.
    pub fn replace_all(&mut self, entries: SettingsMap) -> bool {
        if self.entries == entries {
            return false;
        }
        self.entries = entries;
        true
    }

    pub fn as_map(&self) -> &SettingsMap {
        &self.entries
    }

    pub fn snapshot(&self) -> SettingsMap {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_detects_changes() {
        let mut cache = SettingsCache::default();
        assert!(cache.put("size", json!(30)));
        assert!(!cache.put("size", json!(30)));
        assert!(cache.put("size", json!(31)));
        assert_eq!(cache.get("size"), Some(&json!(31)));
    }

    #[test]
    fn test_remove() {
        let mut cache = SettingsCache::default();
        cache.put("a", json!(1));
        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_replace_all() {
        let mut map = SettingsMap::new();
        map.insert("a".to_string(), json!(true));

        let mut cache = SettingsCache::default();
        assert!(cache.replace_all(map.clone()));
        assert!(!cache.replace_all(map.clone()));
        assert_eq!(cache.snapshot(), map);
    }
}
