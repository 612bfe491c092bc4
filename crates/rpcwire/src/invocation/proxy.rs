// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxies: a reference bound to an engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;

use super::outgoing::{InvocationResult, OutgoingAsync};
use super::Engine;
use crate::connection::{Connection, State};
use crate::error::{Error, Result};
use crate::identity::{Context, OperationMode};
use crate::reference::{Endpoint, InvocationMode, LocatorInfo, Reference, RouterInfo};

/// Invokes operations on the object a [`Reference`] designates.
///
/// The connection used by the last successful attempt is cached when the
/// reference allows it, and dropped after any failure.
pub struct Proxy {
    engine: Arc<Engine>,
    reference: Reference,
    connection: ArcSwapOption<Connection>,
}

impl Clone for Proxy {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            reference: self.reference.clone(),
            connection: ArcSwapOption::new(self.connection.load_full()),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("reference", &self.reference)
            .field("connection", &self.connection.load().as_ref().map(|c| c.id()))
            .finish()
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.reference, f)
    }
}

impl Proxy {
    pub fn new(engine: Arc<Engine>, reference: Reference) -> Self {
        Self {
            engine,
            reference,
            connection: ArcSwapOption::empty(),
        }
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Proxy for `reference`; keeps the cached connection when the
    /// reference did not change.
    pub fn with_reference(&self, reference: Reference) -> Proxy {
        if reference.ptr_eq(&self.reference) {
            self.clone()
        } else {
            Proxy::new(self.engine.clone(), reference)
        }
    }

    pub fn with_facet(&self, facet: &str) -> Proxy {
        self.with_reference(self.reference.change_facet(facet))
    }

    pub fn with_mode(&self, mode: InvocationMode) -> Proxy {
        self.with_reference(self.reference.change_mode(mode))
    }

    pub fn with_context(&self, context: &Context) -> Proxy {
        self.with_reference(self.reference.change_context(context))
    }

    pub fn with_invocation_timeout(&self, timeout: Option<Duration>) -> Proxy {
        self.with_reference(self.reference.change_invocation_timeout(timeout))
    }

    pub fn with_endpoints(&self, endpoints: &[Endpoint]) -> Result<Proxy> {
        Ok(self.with_reference(self.reference.change_endpoints(endpoints)?))
    }

    pub fn with_adapter_id(&self, adapter_id: &str) -> Result<Proxy> {
        Ok(self.with_reference(self.reference.change_adapter_id(adapter_id)?))
    }

    pub fn with_locator(&self, locator: Option<Arc<LocatorInfo>>) -> Result<Proxy> {
        Ok(self.with_reference(self.reference.change_locator(locator)?))
    }

    pub fn with_router(&self, router: Option<Arc<RouterInfo>>) -> Result<Proxy> {
        Ok(self.with_reference(self.reference.change_router(router)?))
    }

    /// Operations returning values need a twoway reference.
    pub fn check_twoway_only(&self, operation: &str) -> Result<()> {
        if self.reference.mode().is_twoway() {
            Ok(())
        } else {
            Err(Error::TwowayOnly {
                operation: operation.to_string(),
            })
        }
    }

    /// Connection cached by the last successful attempt.
    pub fn cached_connection(&self) -> Option<Arc<Connection>> {
        self.connection.load_full()
    }

    /// Connection for the next request: the cached one while it is usable,
    /// otherwise resolved through the reference.
    pub async fn get_connection(&self) -> Result<Arc<Connection>> {
        if let Some(conn) = self.connection.load_full() {
            if conn.exception().is_none() && conn.state() < State::Closing {
                return Ok(conn);
            }
            self.connection.store(None);
        }
        let conn = self
            .reference
            .get_connection(self.engine.factory().as_ref())
            .await?;
        // Batches are queued per connection: keep it for the flush.
        if self.reference.cache_connection() || self.reference.mode().is_batch() {
            self.connection.store(Some(conn.clone()));
        }
        Ok(conn)
    }

    pub(crate) fn clear_connection(&self) {
        self.connection.store(None);
    }

    /// Invocation of `operation` with an already-marshaled parameter
    /// encapsulation; `context` overrides the reference's context.
    pub fn outgoing<'a>(
        &'a self,
        operation: &'a str,
        mode: OperationMode,
        params: &'a [u8],
        context: Option<&'a Context>,
    ) -> OutgoingAsync<'a> {
        OutgoingAsync::new(self, operation, mode, params, context)
    }

    pub async fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
        context: Option<&Context>,
    ) -> Result<InvocationResult> {
        self.outgoing(operation, mode, params, context)
            .invoke()
            .await
    }

    /// Send the batch queued on this proxy's connection.
    pub async fn flush_batch_requests(&self) -> Result<()> {
        let conn = match self.reference.fixed_connection() {
            Some(conn) => Some(conn.clone()),
            None => self.cached_connection(),
        };
        let Some(conn) = conn else {
            return Ok(());
        };
        if let Some(mut request) = conn.flush_batch_requests()? {
            request.sent().await?;
        }
        Ok(())
    }
}
