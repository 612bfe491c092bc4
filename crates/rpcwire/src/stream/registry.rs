// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Type registry: value factories, exception factories and compact ids.
//!
//! Populated by the application (typically generated code) at startup and
//! injected into every [`InputStream`](super::InputStream). Lookups are
//! lock-free.

use std::sync::Arc;

use dashmap::DashMap;

use super::exception::UserException;
use super::value::ValuePtr;
use crate::error::{Error, Result};

/// Creates a class instance for a type id, or declines with `None`.
pub type ValueFactory = Arc<dyn Fn(&str) -> Option<ValuePtr> + Send + Sync>;

/// Creates an empty user exception for a type id.
pub type ExceptionFactory = Arc<dyn Fn(&str) -> Option<Box<dyn UserException>> + Send + Sync>;

#[derive(Default)]
pub struct TypeRegistry {
    values: DashMap<String, ValueFactory>,
    exceptions: DashMap<String, ExceptionFactory>,
    compact_ids: DashMap<i32, String>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value factory. The empty type id registers the default
    /// factory, consulted when no specific factory exists.
    pub fn add_value_factory<F>(&self, type_id: &str, factory: F) -> Result<()>
    where
        F: Fn(&str) -> Option<ValuePtr> + Send + Sync + 'static,
    {
        if self.values.contains_key(type_id) {
            return Err(Error::AlreadyRegistered {
                kind: "value factory",
                id: type_id.to_string(),
            });
        }
        self.values.insert(type_id.to_string(), Arc::new(factory));
        Ok(())
    }

    pub fn find_value_factory(&self, type_id: &str) -> Option<ValueFactory> {
        self.values.get(type_id).map(|f| f.value().clone())
    }

    pub fn add_exception_factory<F>(&self, type_id: &str, factory: F) -> Result<()>
    where
        F: Fn(&str) -> Option<Box<dyn UserException>> + Send + Sync + 'static,
    {
        if self.exceptions.contains_key(type_id) {
            return Err(Error::AlreadyRegistered {
                kind: "exception factory",
                id: type_id.to_string(),
            });
        }
        self.exceptions.insert(type_id.to_string(), Arc::new(factory));
        Ok(())
    }

    pub fn register_compact_id(&self, compact_id: i32, type_id: &str) -> Result<()> {
        if compact_id < 0 {
            return Err(Error::IllegalArgument {
                reason: format!("negative compact id {}", compact_id),
            });
        }
        if self.compact_ids.contains_key(&compact_id) {
            return Err(Error::AlreadyRegistered {
                kind: "compact id",
                id: compact_id.to_string(),
            });
        }
        self.compact_ids.insert(compact_id, type_id.to_string());
        Ok(())
    }

    pub fn resolve_compact_id(&self, compact_id: i32) -> Option<String> {
        self.compact_ids.get(&compact_id).map(|t| t.value().clone())
    }

    /// Instantiate a value: the specific factory first, then the default one.
    pub fn create_value(&self, type_id: &str) -> Option<ValuePtr> {
        if let Some(factory) = self.find_value_factory(type_id) {
            if let Some(v) = factory(type_id) {
                return Some(v);
            }
        }
        self.find_value_factory("")
            .and_then(|factory| factory(type_id))
    }

    pub fn create_exception(&self, type_id: &str) -> Option<Box<dyn UserException>> {
        self.exceptions
            .get(type_id)
            .map(|f| f.value().clone())
            .and_then(|factory| factory(type_id))
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("values", &self.values.len())
            .field("exceptions", &self.exceptions.len())
            .field("compact_ids", &self.compact_ids.len())
            .finish()
    }
}
