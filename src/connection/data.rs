//! Per-connection values keyed by type.
//!
//! Handlers and hooks attach state to a session (a user name, an
//! authentication result, a sequence counter) without a side table keyed by
//! connection ID. Each concrete type holds at most one value.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

/// Values attached to one connection, one per concrete type.
#[derive(Clone, Default)]
pub(crate) struct ConnectionData {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ConnectionData {
    /// Store `value`, returning the value of the same type it replaced.
    pub(crate) fn insert<T>(&mut self, value: T) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.values
            .insert(
                TypeId::of::<T>(),
                Arc::new(value) as Arc<dyn Any + Send + Sync>,
            )
            .and_then(|old| old.downcast::<T>().ok())
    }

    pub(crate) fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    pub(crate) fn remove<T>(&mut self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }
}
