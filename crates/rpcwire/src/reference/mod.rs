// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! References: how to reach and treat a remote object.
//!
//! A [`Reference`] is an immutable value shared behind an `Arc`. It comes
//! in two kinds:
//!
//! - **fixed**: bound to one established connection (callbacks over a
//!   bidirectional connection). Endpoint, locator, router and cache
//!   settings do not apply and changing them fails with
//!   [`Error::FixedProxy`].
//! - **routable**: resolved when a connection is needed. Router client
//!   endpoints take precedence, then the direct endpoints, then the
//!   endpoints the locator returns for the adapter id (or well-known
//!   identity). Candidates are filtered and ordered (see [`endpoint`]) and
//!   tried in order until one connects.
//!
//! `change_*` methods return the same reference (pointer-equal) when the
//! value does not change, a new reference otherwise.

pub mod endpoint;
pub mod factory;
pub mod locator;
pub mod router;

pub use endpoint::Endpoint;
pub use factory::{ConnectionFactory, MemoryConnectionFactory};
pub use locator::{Locator, LocatorInfo};
pub use router::{Router, RouterInfo, ADD_PROXY_OPERATION};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use self::endpoint::{filter_endpoints, EndpointFilter};
use crate::config::{Config, EndpointSelection};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::identity::{Context, Identity};
use crate::protocol::{EncodingVersion, ProtocolVersion, CURRENT_PROTOCOL};

/// How requests made through a reference are sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    #[default]
    Twoway,
    Oneway,
    BatchOneway,
    Datagram,
    BatchDatagram,
}

impl InvocationMode {
    pub fn is_twoway(self) -> bool {
        self == InvocationMode::Twoway
    }

    pub fn is_batch(self) -> bool {
        matches!(self, InvocationMode::BatchOneway | InvocationMode::BatchDatagram)
    }

    pub fn is_datagram(self) -> bool {
        matches!(self, InvocationMode::Datagram | InvocationMode::BatchDatagram)
    }

    fn flag(self) -> &'static str {
        match self {
            InvocationMode::Twoway => "-t",
            InvocationMode::Oneway => "-o",
            InvocationMode::BatchOneway => "-O",
            InvocationMode::Datagram => "-d",
            InvocationMode::BatchDatagram => "-D",
        }
    }
}

#[derive(Clone)]
pub struct Reference(Arc<ReferenceInner>);

#[derive(Clone, PartialEq)]
struct ReferenceInner {
    identity: Identity,
    facet: String,
    mode: InvocationMode,
    secure: bool,
    protocol: ProtocolVersion,
    encoding: EncodingVersion,
    invocation_timeout: Option<Duration>,
    context: Context,
    kind: Kind,
}

#[derive(Clone)]
enum Kind {
    Fixed(Arc<Connection>),
    Routable(Routable),
}

#[derive(Clone)]
struct Routable {
    endpoints: Vec<Endpoint>,
    adapter_id: String,
    locator: Option<Arc<LocatorInfo>>,
    router: Option<Arc<RouterInfo>>,
    prefer_secure: bool,
    endpoint_selection: EndpointSelection,
    locator_cache_timeout: Option<Duration>,
    cache_connection: bool,
    connection_id: String,
}

fn same_arc<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl PartialEq for Routable {
    fn eq(&self, other: &Self) -> bool {
        self.endpoints == other.endpoints
            && self.adapter_id == other.adapter_id
            && same_arc(&self.locator, &other.locator)
            && same_arc(&self.router, &other.router)
            && self.prefer_secure == other.prefer_secure
            && self.endpoint_selection == other.endpoint_selection
            && self.locator_cache_timeout == other.locator_cache_timeout
            && self.cache_connection == other.cache_connection
            && self.connection_id == other.connection_id
    }
}

impl PartialEq for Kind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Kind::Fixed(a), Kind::Fixed(b)) => Arc::ptr_eq(a, b),
            (Kind::Routable(a), Kind::Routable(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Reference {
    // ========================================================================
    // Construction
    // ========================================================================

    fn routable(identity: Identity, routable: Routable, config: &Config) -> Self {
        Reference(Arc::new(ReferenceInner {
            identity,
            facet: String::new(),
            mode: InvocationMode::Twoway,
            secure: false,
            protocol: CURRENT_PROTOCOL,
            encoding: config.default_encoding,
            invocation_timeout: config.invocation_timeout,
            context: Context::new(),
            kind: Kind::Routable(routable),
        }))
    }

    fn routable_defaults(config: &Config) -> Routable {
        Routable {
            endpoints: Vec::new(),
            adapter_id: String::new(),
            locator: None,
            router: None,
            prefer_secure: config.prefer_secure,
            endpoint_selection: config.endpoint_selection,
            locator_cache_timeout: config.locator_cache_timeout,
            cache_connection: config.cache_connection,
            connection_id: String::new(),
        }
    }

    /// Reference with explicit endpoints.
    pub fn direct(identity: Identity, endpoints: Vec<Endpoint>, config: &Config) -> Self {
        let mut routable = Self::routable_defaults(config);
        routable.endpoints = endpoints;
        Self::routable(identity, routable, config)
    }

    /// `identity @ adapter_id`, resolved through `locator`.
    pub fn indirect(
        identity: Identity,
        adapter_id: impl Into<String>,
        locator: Arc<LocatorInfo>,
        config: &Config,
    ) -> Self {
        let mut routable = Self::routable_defaults(config);
        routable.adapter_id = adapter_id.into();
        routable.locator = Some(locator);
        Self::routable(identity, routable, config)
    }

    /// Well-known object, resolved by identity through `locator`.
    pub fn well_known(identity: Identity, locator: Arc<LocatorInfo>, config: &Config) -> Self {
        Self::indirect(identity, "", locator, config)
    }

    /// Reference bound to `connection`.
    pub fn fixed(identity: Identity, connection: Arc<Connection>) -> Self {
        let mode = if connection.is_datagram() {
            InvocationMode::Datagram
        } else {
            InvocationMode::Twoway
        };
        let encoding = connection.config().default_encoding;
        let invocation_timeout = connection.config().invocation_timeout;
        Reference(Arc::new(ReferenceInner {
            identity,
            facet: String::new(),
            mode,
            secure: false,
            protocol: CURRENT_PROTOCOL,
            encoding,
            invocation_timeout,
            context: Context::new(),
            kind: Kind::Fixed(connection),
        }))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn identity(&self) -> &Identity {
        &self.0.identity
    }

    pub fn facet(&self) -> &str {
        &self.0.facet
    }

    pub fn mode(&self) -> InvocationMode {
        self.0.mode
    }

    pub fn is_secure(&self) -> bool {
        self.0.secure
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.0.protocol
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.0.encoding
    }

    pub fn invocation_timeout(&self) -> Option<Duration> {
        self.0.invocation_timeout
    }

    pub fn context(&self) -> &Context {
        &self.0.context
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.0.kind, Kind::Fixed(_))
    }

    pub fn fixed_connection(&self) -> Option<&Arc<Connection>> {
        match &self.0.kind {
            Kind::Fixed(conn) => Some(conn),
            Kind::Routable(_) => None,
        }
    }

    fn routable_ref(&self) -> Option<&Routable> {
        match &self.0.kind {
            Kind::Fixed(_) => None,
            Kind::Routable(r) => Some(r),
        }
    }

    /// Direct endpoints; empty for fixed and indirect references.
    pub fn endpoints(&self) -> &[Endpoint] {
        self.routable_ref().map_or(&[], |r| r.endpoints.as_slice())
    }

    pub fn adapter_id(&self) -> &str {
        self.routable_ref().map_or("", |r| r.adapter_id.as_str())
    }

    pub fn locator_info(&self) -> Option<&Arc<LocatorInfo>> {
        self.routable_ref().and_then(|r| r.locator.as_ref())
    }

    pub fn router_info(&self) -> Option<&Arc<RouterInfo>> {
        self.routable_ref().and_then(|r| r.router.as_ref())
    }

    pub fn prefer_secure(&self) -> bool {
        self.routable_ref().is_some_and(|r| r.prefer_secure)
    }

    pub fn endpoint_selection(&self) -> EndpointSelection {
        self.routable_ref()
            .map_or(EndpointSelection::Random, |r| r.endpoint_selection)
    }

    pub fn locator_cache_timeout(&self) -> Option<Duration> {
        self.routable_ref().and_then(|r| r.locator_cache_timeout)
    }

    /// Fixed references always use their connection.
    pub fn cache_connection(&self) -> bool {
        self.routable_ref().map_or(true, |r| r.cache_connection)
    }

    pub fn connection_id(&self) -> &str {
        self.routable_ref().map_or("", |r| r.connection_id.as_str())
    }

    /// Routable without direct endpoints: resolved through the locator.
    pub fn is_indirect(&self) -> bool {
        self.routable_ref().is_some_and(|r| r.endpoints.is_empty())
    }

    /// Indirect without an adapter id.
    pub fn is_well_known(&self) -> bool {
        self.is_indirect() && self.adapter_id().is_empty()
    }

    /// True when both handles share the same value allocation.
    pub fn ptr_eq(&self, other: &Reference) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    // ========================================================================
    // Changes
    // ========================================================================

    fn with<F: FnOnce(&mut ReferenceInner)>(&self, f: F) -> Reference {
        let mut inner = (*self.0).clone();
        f(&mut inner);
        if inner == *self.0 {
            self.clone()
        } else {
            Reference(Arc::new(inner))
        }
    }

    fn with_routable<F: FnOnce(&mut Routable)>(&self, f: F) -> Result<Reference> {
        if self.is_fixed() {
            return Err(Error::FixedProxy);
        }
        Ok(self.with(|inner| {
            if let Kind::Routable(r) = &mut inner.kind {
                f(r);
            }
        }))
    }

    pub fn change_identity(&self, identity: &Identity) -> Reference {
        if self.0.identity == *identity {
            return self.clone();
        }
        self.with(|r| r.identity = identity.clone())
    }

    pub fn change_facet(&self, facet: &str) -> Reference {
        if self.0.facet == facet {
            return self.clone();
        }
        self.with(|r| r.facet = facet.to_string())
    }

    pub fn change_context(&self, context: &Context) -> Reference {
        if self.0.context == *context {
            return self.clone();
        }
        self.with(|r| r.context = context.clone())
    }

    pub fn change_mode(&self, mode: InvocationMode) -> Reference {
        self.with(|r| r.mode = mode)
    }

    pub fn change_secure(&self, secure: bool) -> Reference {
        self.with(|r| r.secure = secure)
    }

    pub fn change_encoding(&self, encoding: EncodingVersion) -> Reference {
        self.with(|r| r.encoding = encoding)
    }

    pub fn change_invocation_timeout(&self, timeout: Option<Duration>) -> Reference {
        self.with(|r| r.invocation_timeout = timeout)
    }

    /// Replaces the adapter id: a reference has endpoints or an adapter id.
    pub fn change_endpoints(&self, endpoints: &[Endpoint]) -> Result<Reference> {
        if self.routable_ref().is_some_and(|r| r.endpoints == endpoints) {
            return Ok(self.clone());
        }
        self.with_routable(|r| {
            r.endpoints = endpoints.to_vec();
            r.adapter_id.clear();
        })
    }

    /// Replaces the endpoints: a reference has endpoints or an adapter id.
    pub fn change_adapter_id(&self, adapter_id: &str) -> Result<Reference> {
        if self.routable_ref().is_some_and(|r| r.adapter_id == adapter_id) {
            return Ok(self.clone());
        }
        self.with_routable(|r| {
            r.adapter_id = adapter_id.to_string();
            r.endpoints.clear();
        })
    }

    pub fn change_locator(&self, locator: Option<Arc<LocatorInfo>>) -> Result<Reference> {
        self.with_routable(|r| r.locator = locator)
    }

    pub fn change_router(&self, router: Option<Arc<RouterInfo>>) -> Result<Reference> {
        self.with_routable(|r| r.router = router)
    }

    pub fn change_prefer_secure(&self, prefer_secure: bool) -> Result<Reference> {
        self.with_routable(|r| r.prefer_secure = prefer_secure)
    }

    pub fn change_endpoint_selection(&self, selection: EndpointSelection) -> Result<Reference> {
        self.with_routable(|r| r.endpoint_selection = selection)
    }

    pub fn change_locator_cache_timeout(&self, timeout: Option<Duration>) -> Result<Reference> {
        self.with_routable(|r| r.locator_cache_timeout = timeout)
    }

    pub fn change_cache_connection(&self, cache: bool) -> Result<Reference> {
        self.with_routable(|r| r.cache_connection = cache)
    }

    pub fn change_connection_id(&self, connection_id: &str) -> Result<Reference> {
        if self.routable_ref().is_some_and(|r| r.connection_id == connection_id) {
            return Ok(self.clone());
        }
        self.with_routable(|r| r.connection_id = connection_id.to_string())
    }

    // ========================================================================
    // Connection establishment
    // ========================================================================

    /// Connection for a request through this reference.
    pub async fn get_connection(&self, factory: &dyn ConnectionFactory) -> Result<Arc<Connection>> {
        let routable = match &self.0.kind {
            Kind::Fixed(conn) => return self.check_fixed(conn),
            Kind::Routable(r) => r,
        };

        let (endpoints, cached) = self.resolve_endpoints(routable).await?;
        let conn = match self.connect(&endpoints, factory).await {
            Ok(conn) => conn,
            Err(e) if cached => {
                // Stale locator answer: ask again once.
                log::debug!(
                    "[Network] connection to cached endpoints of `{}' failed, refreshing: {}",
                    self,
                    e
                );
                if let Some(locator) = &routable.locator {
                    locator.clear_cache(self);
                }
                let (endpoints, _) = self.resolve_endpoints(routable).await?;
                self.connect(&endpoints, factory).await?
            }
            Err(e) => return Err(e),
        };

        if let Some(router) = &routable.router {
            router.add_proxy(self).await?;
        }
        Ok(conn)
    }

    fn check_fixed(&self, conn: &Arc<Connection>) -> Result<Arc<Connection>> {
        if let Some(ex) = conn.exception() {
            return Err(ex);
        }
        if self.0.mode.is_datagram() != conn.is_datagram() {
            return Err(Error::NoEndpoint {
                proxy: self.to_string(),
            });
        }
        Ok(conn.clone())
    }

    async fn resolve_endpoints(&self, routable: &Routable) -> Result<(Vec<Endpoint>, bool)> {
        let filter = EndpointFilter {
            datagram: self.0.mode.is_datagram(),
            secure: self.0.secure,
            prefer_secure: routable.prefer_secure,
            selection: routable.endpoint_selection,
            connection_id: &routable.connection_id,
        };

        let mut resolved = None;
        if let Some(router) = &routable.router {
            let endpoints = router.get_client_endpoints().await?;
            if !endpoints.is_empty() {
                resolved = Some((endpoints, false));
            }
        }
        if resolved.is_none() && !routable.endpoints.is_empty() {
            resolved = Some((routable.endpoints.clone(), false));
        }
        if resolved.is_none() {
            if let Some(locator) = &routable.locator {
                resolved = Some(
                    locator
                        .get_endpoints(self, routable.locator_cache_timeout)
                        .await?,
                );
            }
        }

        let (endpoints, cached) = resolved.unwrap_or_default();
        let endpoints = filter_endpoints(&endpoints, filter);
        if endpoints.is_empty() {
            return Err(Error::NoEndpoint {
                proxy: self.to_string(),
            });
        }
        Ok((endpoints, cached))
    }

    async fn connect(
        &self,
        endpoints: &[Endpoint],
        factory: &dyn ConnectionFactory,
    ) -> Result<Arc<Connection>> {
        if let Some(conn) = factory.find(endpoints) {
            return Ok(conn);
        }
        let mut last = None;
        for endpoint in endpoints {
            match factory.connect(endpoint).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    log::debug!("[Network] failed to connect to `{}': {}", endpoint, e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| Error::NoEndpoint {
            proxy: self.to_string(),
        }))
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({})", self)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.identity)?;
        if !self.0.facet.is_empty() {
            write!(f, " -f {}", self.0.facet)?;
        }
        write!(f, " {}", self.0.mode.flag())?;
        if self.0.secure {
            write!(f, " -s")?;
        }
        write!(f, " -e {}", self.0.encoding)?;
        match &self.0.kind {
            Kind::Fixed(conn) => write!(f, " (fixed #{})", conn.id()),
            Kind::Routable(r) if !r.endpoints.is_empty() => {
                for endpoint in &r.endpoints {
                    write!(f, ":{}", endpoint)?;
                }
                Ok(())
            }
            Kind::Routable(r) if !r.adapter_id.is_empty() => write!(f, " @ {}", r.adapter_id),
            Kind::Routable(_) => Ok(()),
        }
    }
}
