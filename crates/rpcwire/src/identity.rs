// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Object identity, request context and operation mode.

use std::collections::BTreeMap;
use std::fmt;

/// Request context: string key/value pairs sent with every request.
///
/// Ordered so that marshaling and reference equality are deterministic.
pub type Context = BTreeMap<String, String>;

/// Identity of a remote object: a name within an optional category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    pub fn with_category(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// An identity with an empty name is never a valid request target.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

/// Semantics of an operation, carried in every request.
///
/// Nonmutating and idempotent operations may be retried after they were
/// sent without violating at-most-once semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0,
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OperationMode::Normal),
            1 => Some(OperationMode::Nonmutating),
            2 => Some(OperationMode::Idempotent),
            _ => None,
        }
    }

    pub fn is_idempotent(self) -> bool {
        !matches!(self, OperationMode::Normal)
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationMode::Normal => write!(f, "normal"),
            OperationMode::Nonmutating => write!(f, "nonmutating"),
            OperationMode::Idempotent => write!(f, "idempotent"),
        }
    }
}
