// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outgoing invocations.
//!
//! An [`Engine`] holds what every invocation shares (configuration, type
//! registry, connection factory). A [`Proxy`] binds a reference to an
//! engine and runs [`OutgoingAsync`] attempts under the retry policy.

mod outgoing;
mod proxy;
mod retry;

pub use outgoing::{InvocationResult, InvocationState, OutgoingAsync};
pub use proxy::Proxy;

use std::sync::Arc;

use crate::config::Config;
use crate::reference::{ConnectionFactory, Reference};
use crate::stream::TypeRegistry;

pub struct Engine {
    config: Arc<Config>,
    registry: Arc<TypeRegistry>,
    factory: Arc<dyn ConnectionFactory>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .finish()
    }
}

impl Engine {
    pub fn new(config: Arc<Config>, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Self::with_registry(config, factory, Arc::new(TypeRegistry::new()))
    }

    pub fn with_registry(
        config: Arc<Config>,
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<TypeRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            factory,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.factory
    }

    pub fn proxy(self: &Arc<Self>, reference: Reference) -> Proxy {
        Proxy::new(self.clone(), reference)
    }
}
