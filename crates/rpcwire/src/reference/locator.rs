// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Location service client side.
//!
//! Indirect references name an object adapter (`identity @ adapter`) or
//! only an identity (well-known object). [`LocatorInfo`] resolves both
//! through a [`Locator`] and keeps the answers in LRU caches whose entries
//! expire after the reference's locator cache timeout:
//!
//! - `None`: entries never expire,
//! - zero: the cache is bypassed,
//! - otherwise: entries older than the timeout are refreshed.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use super::{Endpoint, Reference};
use crate::error::{Error, Result};
use crate::identity::Identity;

const CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::MIN.saturating_add(1023);

/// Location service.
#[async_trait]
pub trait Locator: Send + Sync {
    /// Endpoints of an object adapter, `None` when the adapter is unknown.
    async fn find_adapter_by_id(&self, adapter_id: &str) -> Result<Option<Vec<Endpoint>>>;

    /// Reference of a well-known object, `None` when the object is unknown.
    async fn find_object_by_id(&self, identity: &Identity) -> Result<Option<Reference>>;
}

struct Cached<T> {
    value: T,
    stored: Instant,
}

impl<T: Clone> Cached<T> {
    fn fresh(&self, ttl: Option<Duration>) -> Option<T> {
        match ttl {
            None => Some(self.value.clone()),
            Some(ttl) if self.stored.elapsed() < ttl => Some(self.value.clone()),
            Some(_) => None,
        }
    }
}

fn caching(ttl: Option<Duration>) -> bool {
    ttl.map_or(true, |ttl| !ttl.is_zero())
}

pub struct LocatorInfo {
    locator: Arc<dyn Locator>,
    adapters: Mutex<LruCache<String, Cached<Vec<Endpoint>>>>,
    objects: Mutex<LruCache<Identity, Cached<Reference>>>,
}

impl std::fmt::Debug for LocatorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocatorInfo")
            .field("adapters", &self.adapters.lock().len())
            .field("objects", &self.objects.lock().len())
            .finish()
    }
}

impl LocatorInfo {
    pub fn new(locator: Arc<dyn Locator>) -> Arc<Self> {
        Arc::new(Self {
            locator,
            adapters: Mutex::new(LruCache::new(CACHE_CAPACITY)),
            objects: Mutex::new(LruCache::new(CACHE_CAPACITY)),
        })
    }

    pub fn locator(&self) -> &Arc<dyn Locator> {
        &self.locator
    }

    /// Resolve the endpoints of an indirect reference. The flag is true
    /// when any part of the answer came from the cache.
    pub async fn get_endpoints(
        &self,
        reference: &Reference,
        ttl: Option<Duration>,
    ) -> Result<(Vec<Endpoint>, bool)> {
        let adapter_id = reference.adapter_id();
        if !adapter_id.is_empty() {
            return self.adapter_endpoints(adapter_id, ttl, reference).await;
        }

        let identity = reference.identity();
        let cached = if caching(ttl) {
            self.objects
                .lock()
                .get(identity)
                .and_then(|entry| entry.fresh(ttl))
        } else {
            None
        };
        let (object, from_cache) = match cached {
            Some(object) => (object, true),
            None => {
                log::trace!("[Locator] searching for well-known object `{}'", identity);
                let object = self
                    .locator
                    .find_object_by_id(identity)
                    .await?
                    .ok_or_else(|| not_found(reference))?;
                if caching(ttl) {
                    self.objects.lock().put(
                        identity.clone(),
                        Cached {
                            value: object.clone(),
                            stored: Instant::now(),
                        },
                    );
                }
                (object, false)
            }
        };

        if !object.endpoints().is_empty() {
            return Ok((object.endpoints().to_vec(), from_cache));
        }
        if !object.adapter_id().is_empty() {
            let (endpoints, adapter_cached) = self
                .adapter_endpoints(object.adapter_id(), ttl, reference)
                .await?;
            return Ok((endpoints, from_cache || adapter_cached));
        }
        Err(not_found(reference))
    }

    async fn adapter_endpoints(
        &self,
        adapter_id: &str,
        ttl: Option<Duration>,
        reference: &Reference,
    ) -> Result<(Vec<Endpoint>, bool)> {
        if caching(ttl) {
            if let Some(endpoints) = self
                .adapters
                .lock()
                .get(adapter_id)
                .and_then(|entry| entry.fresh(ttl))
            {
                return Ok((endpoints, true));
            }
        }
        log::trace!("[Locator] searching for adapter `{}'", adapter_id);
        let endpoints = self
            .locator
            .find_adapter_by_id(adapter_id)
            .await?
            .filter(|endpoints| !endpoints.is_empty())
            .ok_or_else(|| not_found(reference))?;
        if caching(ttl) {
            self.adapters.lock().put(
                adapter_id.to_string(),
                Cached {
                    value: endpoints.clone(),
                    stored: Instant::now(),
                },
            );
        }
        Ok((endpoints, false))
    }

    /// Forget what was cached for `reference`.
    pub fn clear_cache(&self, reference: &Reference) {
        let adapter_id = reference.adapter_id();
        if !adapter_id.is_empty() {
            if self.adapters.lock().pop(adapter_id).is_some() {
                log::trace!("[Locator] removed endpoints of adapter `{}' from cache", adapter_id);
            }
            return;
        }
        let object = self.objects.lock().pop(reference.identity());
        if let Some(object) = object {
            log::trace!(
                "[Locator] removed well-known object `{}' from cache",
                reference.identity()
            );
            let adapter_id = object.value.adapter_id();
            if !adapter_id.is_empty() {
                self.adapters.lock().pop(adapter_id);
            }
        }
    }
}

fn not_found(reference: &Reference) -> Error {
    Error::NoEndpoint {
        proxy: reference.to_string(),
    }
}
