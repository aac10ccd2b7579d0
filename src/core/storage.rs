use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::identifier::Key;

/// An opaque content item. The `(key, owner, content_type)` triple uniquely
/// identifies an item in a local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub key: Key,
    pub owner: Option<String>,
    pub content_type: Option<String>,
    pub value: Vec<u8>,
}

impl Content {
    pub fn new(key: Key, value: Vec<u8>) -> Self {
        Self {
            key,
            owner: None,
            content_type: None,
            value,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    fn triple(&self) -> StoreKey {
        (self.key, self.owner.clone(), self.content_type.clone())
    }
}

/// Parameters of a get call: the key, plus optional owner and type filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetParameter {
    pub key: Key,
    pub owner: Option<String>,
    pub content_type: Option<String>,
}

impl GetParameter {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            owner: None,
            content_type: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Key must match; owner and type only when the parameter names them.
    pub fn matches(&self, content: &Content) -> bool {
        if self.key != content.key {
            return false;
        }
        if let Some(owner) = &self.owner {
            if content.owner.as_deref() != Some(owner.as_str()) {
                return false;
            }
        }
        if let Some(content_type) = &self.content_type {
            if content.content_type.as_deref() != Some(content_type.as_str()) {
                return false;
            }
        }
        true
    }
}

type StoreKey = (Key, Option<String>, Option<String>);

/// Local key→content map, indexed by the `(key, owner, type)` triple.
#[derive(Debug, Default)]
pub struct ContentStore {
    entries: HashMap<StoreKey, Content>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an item, overwriting any entry with the same triple.
    pub fn put(&mut self, content: Content) {
        self.entries.insert(content.triple(), content);
    }

    pub fn contains(&self, param: &GetParameter) -> bool {
        self.get(param).is_some()
    }

    /// First stored item the parameter matches.
    pub fn get(&self, param: &GetParameter) -> Option<&Content> {
        self.entries.values().find(|c| param.matches(c))
    }

    /// All stored triples, as parameters that match exactly one entry each.
    pub fn keys(&self) -> Vec<GetParameter> {
        self.entries
            .keys()
            .map(|(key, owner, content_type)| GetParameter {
                key: *key,
                owner: owner.clone(),
                content_type: content_type.clone(),
            })
            .collect()
    }

    pub fn all(&self) -> Vec<Content> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::identifier::KadId;

    #[test]
    fn put_overwrites_the_same_triple() {
        let mut store = ContentStore::new();
        let key = KadId::from_hashed(&"doc");
        store.put(Content::new(key, b"one".to_vec()).with_owner("alice"));
        store.put(Content::new(key, b"two".to_vec()).with_owner("alice"));
        assert_eq!(store.len(), 1);
        let got = store.get(&GetParameter::new(key)).unwrap();
        assert_eq!(got.value, b"two");
    }

    #[test]
    fn filters_apply_only_when_specified() {
        let mut store = ContentStore::new();
        let key = KadId::from_hashed(&"doc");
        store.put(
            Content::new(key, b"v".to_vec())
                .with_owner("alice")
                .with_type("text"),
        );

        assert!(store.contains(&GetParameter::new(key)));
        assert!(store.contains(&GetParameter::new(key).with_owner("alice")));
        assert!(!store.contains(&GetParameter::new(key).with_owner("bob")));
        assert!(store.contains(&GetParameter::new(key).with_owner("alice").with_type("text")));
        assert!(!store.contains(&GetParameter::new(key).with_type("image")));
        assert!(!store.contains(&GetParameter::new(KadId::from_hashed(&"other"))));
    }

    #[test]
    fn keys_round_trip_to_their_entries() {
        let mut store = ContentStore::new();
        let a = Content::new(KadId::from_hashed(&"a"), b"1".to_vec()).with_owner("alice");
        let b = Content::new(KadId::from_hashed(&"b"), b"2".to_vec());
        store.put(a.clone());
        store.put(b.clone());

        let mut found = Vec::new();
        for param in store.keys() {
            found.push(store.get(&param).unwrap().clone());
        }
        assert_eq!(found.len(), 2);
        assert!(found.contains(&a));
        assert!(found.contains(&b));
    }
}
