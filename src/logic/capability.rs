use crate::logic::binder::BoundAction;
use crate::model::FieldRefs;
use itertools::Itertools;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A resolved entry of a capability object
#[derive(Debug, Clone)]
pub enum Property {
    Action(BoundAction),
    Fields(Arc<FieldRefs>),
    Value(Value),
}

impl Property {
    pub fn as_action(&self) -> Option<&BoundAction> {
        match self {
            Property::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Property::Value(value) => Some(value),
            _ => None,
        }
    }
}

/// One independent source of keys for a [`CompositeObject`]
pub trait Layer: Send + Sync {
    fn keys(&self) -> Vec<String>;

    fn property(&self, key: &str) -> Option<Property>;

    fn has(&self, key: &str) -> bool {
        self.keys().iter().any(|own| own == key)
    }
}

/// Exposes a single fixed key
pub struct ConstLayer {
    key: String,
    value: Property,
}

impl ConstLayer {
    pub fn new(key: impl Into<String>, value: Property) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

impl Layer for ConstLayer {
    fn keys(&self) -> Vec<String> {
        vec![self.key.clone()]
    }

    fn property(&self, key: &str) -> Option<Property> {
        (key == self.key).then(|| self.value.clone())
    }

    fn has(&self, key: &str) -> bool {
        key == self.key
    }
}

/// Exposes every entry of a JSON object
pub struct ObjectLayer {
    properties: Map<String, Value>,
}

impl ObjectLayer {
    pub fn new(properties: Map<String, Value>) -> Self {
        Self { properties }
    }
}

impl Layer for ObjectLayer {
    fn keys(&self) -> Vec<String> {
        self.properties.keys().cloned().collect()
    }

    fn property(&self, key: &str) -> Option<Property> {
        self.properties.get(key).cloned().map(Property::Value)
    }

    fn has(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }
}

/// Keys whose values are computed on demand
pub struct ComputedLayer<F> {
    keys: Vec<String>,
    compute: F,
}

impl<F> ComputedLayer<F>
where
    F: Fn(&str) -> Option<Property> + Send + Sync,
{
    pub fn new(keys: Vec<String>, compute: F) -> Self {
        Self { keys, compute }
    }
}

impl<F> Layer for ComputedLayer<F>
where
    F: Fn(&str) -> Option<Property> + Send + Sync,
{
    fn keys(&self) -> Vec<String> {
        self.keys.clone()
    }

    fn property(&self, key: &str) -> Option<Property> {
        if self.has(key) {
            (self.compute)(key)
        } else {
            None
        }
    }
}

/// Memoizes another layer's values after first access so repeated reads
/// return the same instance
pub struct CachedLayer {
    inner: Arc<dyn Layer>,
    cache: Mutex<HashMap<String, Property>>,
}

impl CachedLayer {
    pub fn new(inner: Arc<dyn Layer>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl Layer for CachedLayer {
    fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    fn property(&self, key: &str) -> Option<Property> {
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.get(key) {
            return Some(cached.clone());
        }
        let computed = self.inner.property(key)?;
        cache.insert(key.to_string(), computed.clone());
        Some(computed)
    }

    fn has(&self, key: &str) -> bool {
        self.inner.has(key)
    }
}

/// An object assembled from ordered layers. Later layers win on shared keys;
/// a key no layer owns resolves to `None`.
#[derive(Clone, Default)]
pub struct CompositeObject {
    layers: Vec<Arc<dyn Layer>>,
}

impl CompositeObject {
    pub fn new(layers: Vec<Arc<dyn Layer>>) -> Self {
        Self { layers }
    }

    pub fn with_layer(mut self, layer: Arc<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Union of every layer's keys, in first-seen order
    pub fn keys(&self) -> Vec<String> {
        self.layers
            .iter()
            .flat_map(|layer| layer.keys())
            .unique()
            .collect()
    }

    pub fn has(&self, key: &str) -> bool {
        self.layers.iter().any(|layer| layer.has(key))
    }

    pub fn get(&self, key: &str) -> Option<Property> {
        self.layers
            .iter()
            .rev()
            .find(|layer| layer.has(key))
            .and_then(|layer| layer.property(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_later_layers_override() {
        let mut extension = Map::new();
        extension.insert("name".to_string(), json!("shadowed"));
        extension.insert("greet".to_string(), json!("hello"));

        let object = CompositeObject::new(vec![
            Arc::new(ConstLayer::new("name", Property::Value(json!("User")))),
            Arc::new(ObjectLayer::new(extension)),
            Arc::new(ConstLayer::new("$name", Property::Value(json!("User")))),
        ]);

        assert_eq!(object.keys(), vec!["name", "greet", "$name"]);
        assert_eq!(object.get("name").unwrap().as_value(), Some(&json!("shadowed")));
        assert_eq!(object.get("greet").unwrap().as_value(), Some(&json!("hello")));
        assert!(object.get("missing").is_none());
        assert!(!object.has("missing"));
    }

    #[test]
    fn test_cached_layer_computes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let computed = ComputedLayer::new(vec!["fields".to_string()], move |_key: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Property::Fields(Arc::new(FieldRefs {
                model_name: "User".to_string(),
                refs: Vec::new(),
            })))
        });
        let object = CompositeObject::default().with_layer(Arc::new(CachedLayer::new(Arc::new(computed))));

        let first = object.get("fields").unwrap();
        let second = object.get("fields").unwrap();
        match (first, second) {
            (Property::Fields(a), Property::Fields(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("expected field references"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(object.get("other").is_none());
    }
}
