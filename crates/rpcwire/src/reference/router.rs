// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Router client side.
//!
//! A routed reference sends its requests to the router's client endpoints,
//! after registering itself with the router once.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Endpoint, Reference};
use crate::error::Result;
use crate::identity::Identity;

/// Operation reported by a router that does not know a routed proxy.
pub const ADD_PROXY_OPERATION: &str = "ice_add_proxy";

#[async_trait]
pub trait Router: Send + Sync {
    /// Endpoints clients connect to.
    async fn get_client_endpoints(&self) -> Result<Vec<Endpoint>>;

    /// Make `proxies` reachable through the router.
    async fn add_proxies(&self, proxies: &[Reference]) -> Result<()>;
}

pub struct RouterInfo {
    router: Arc<dyn Router>,
    client_endpoints: ArcSwapOption<Vec<Endpoint>>,
    added: Mutex<HashSet<Identity>>,
}

impl std::fmt::Debug for RouterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterInfo")
            .field("client_endpoints", &self.client_endpoints.load().is_some())
            .field("added", &self.added.lock().len())
            .finish()
    }
}

impl RouterInfo {
    pub fn new(router: Arc<dyn Router>) -> Arc<Self> {
        Arc::new(Self {
            router,
            client_endpoints: ArcSwapOption::empty(),
            added: Mutex::new(HashSet::new()),
        })
    }

    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Client endpoints, fetched once and cached.
    pub async fn get_client_endpoints(&self) -> Result<Vec<Endpoint>> {
        if let Some(endpoints) = self.client_endpoints.load_full() {
            return Ok(endpoints.as_ref().clone());
        }
        let endpoints = self.router.get_client_endpoints().await?;
        self.client_endpoints
            .store(Some(Arc::new(endpoints.clone())));
        Ok(endpoints)
    }

    /// Register `reference` with the router unless already done.
    pub async fn add_proxy(&self, reference: &Reference) -> Result<()> {
        if self.added.lock().contains(reference.identity()) {
            return Ok(());
        }
        self.router
            .add_proxies(std::slice::from_ref(reference))
            .await?;
        self.added.lock().insert(reference.identity().clone());
        Ok(())
    }

    /// Forget that `reference` was registered.
    pub fn clear_cache(&self, reference: &Reference) {
        self.added.lock().remove(reference.identity());
    }

    pub fn is_added(&self, identity: &Identity) -> bool {
        self.added.lock().contains(identity)
    }
}
