//! Type-erased application state storage.
//!
//! A small hand-rolled type map, so handlers can depend on any number of
//! independently-registered state types via [`crate::extract::State<T>`].

use std::any::{Any, TypeId};
use std::collections::HashMap;

/// A map from type to a single value of that type, built up once before the app runs
/// and treated as read-only afterwards.
#[derive(Default)]
pub struct StateMap {
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl StateMap {
    /// Creates an empty state map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value of type `T`, replacing any previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieves a reference to the stored value of type `T`, if any was registered.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_distinct_types() {
        let mut state = StateMap::new();
        state.insert(42u32);
        state.insert("hello".to_string());
        assert_eq!(state.get::<u32>(), Some(&42));
        assert_eq!(state.get::<String>(), Some(&"hello".to_string()));
        assert_eq!(state.get::<i64>(), None);
    }

    #[test]
    fn reinserting_replaces_previous_value() {
        let mut state = StateMap::new();
        state.insert(1u32);
        state.insert(2u32);
        assert_eq!(state.get::<u32>(), Some(&2));
    }
}
