// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outgoing connection establishment.
//!
//! [`ConnectionFactory`] is the seam between reference resolution and
//! transports. [`MemoryConnectionFactory`] connects in-process: servers are
//! registered by host name and every connect creates a transceiver pair,
//! one end dispatching to the server's dispatcher.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::Endpoint;
use crate::config::{AcmConfig, Config};
use crate::connection::{AcmMonitor, CloseMode, Connection, Dispatcher, Role, State};
use crate::error::{Error, Result};
use crate::transceiver::{datagram_pair, stream_pair, ReadinessPoller, Transceiver};

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// An established, usable connection to one of `endpoints`.
    fn find(&self, endpoints: &[Endpoint]) -> Option<Arc<Connection>>;

    /// Establish and validate a new connection to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<Connection>>;
}

struct Server {
    dispatcher: Arc<dyn Dispatcher>,
    config: Arc<Config>,
}

pub struct MemoryConnectionFactory {
    config: Arc<Config>,
    servers: DashMap<String, Server>,
    outgoing: Arc<DashMap<Endpoint, Arc<Connection>>>,
    incoming: Arc<DashMap<u64, Arc<Connection>>>,
    monitor: Arc<AcmMonitor>,
    connects: AtomicUsize,
    poller: ReadinessPoller,
}

impl MemoryConnectionFactory {
    /// Client connections use `config`; server ends default to the server
    /// ACM settings.
    pub fn new(config: Arc<Config>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            config,
            servers: DashMap::new(),
            outgoing: Arc::new(DashMap::new()),
            incoming: Arc::new(DashMap::new()),
            monitor: AcmMonitor::new(),
            connects: AtomicUsize::new(0),
            poller: ReadinessPoller::new()?,
        }))
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Accept connections for `host`.
    pub fn add_server(&self, host: &str, dispatcher: Arc<dyn Dispatcher>) -> Result<()> {
        let config = Config {
            acm: AcmConfig::server_default(),
            ..(*self.config).clone()
        };
        self.add_server_with_config(host, dispatcher, Arc::new(config))
    }

    pub fn add_server_with_config(
        &self,
        host: &str,
        dispatcher: Arc<dyn Dispatcher>,
        config: Arc<Config>,
    ) -> Result<()> {
        if self.servers.contains_key(host) {
            return Err(Error::AlreadyRegistered {
                kind: "server",
                id: host.to_string(),
            });
        }
        self.servers
            .insert(host.to_string(), Server { dispatcher, config });
        Ok(())
    }

    /// Stop accepting connections for `host`. Established connections stay.
    pub fn remove_server(&self, host: &str) -> bool {
        self.servers.remove(host).is_some()
    }

    /// Connections established so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }

    /// Client ends of the open connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.outgoing.iter().map(|e| e.value().clone()).collect()
    }

    /// Server ends of the open connections.
    pub fn incoming_connections(&self) -> Vec<Arc<Connection>> {
        self.incoming.iter().map(|e| e.value().clone()).collect()
    }

    /// Monitor watching every connection of this factory.
    pub fn acm_monitor(&self) -> &Arc<AcmMonitor> {
        &self.monitor
    }

    pub fn close_all(&self, mode: CloseMode) {
        // Close callbacks remove entries from the maps: collect first.
        let mut all = self.connections();
        all.extend(self.incoming_connections());
        for conn in all {
            conn.close(mode);
        }
    }

    fn transceivers(endpoint: &Endpoint) -> (Box<dyn Transceiver>, Box<dyn Transceiver>) {
        let name = endpoint.to_string();
        if endpoint.datagram {
            let (a, b) = datagram_pair(&name);
            (Box::new(a), Box::new(b))
        } else {
            let (a, b) = stream_pair(&name);
            (Box::new(a), Box::new(b))
        }
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    fn find(&self, endpoints: &[Endpoint]) -> Option<Arc<Connection>> {
        endpoints.iter().find_map(|endpoint| {
            self.outgoing
                .get(endpoint)
                .map(|e| e.value().clone())
                .filter(|conn| {
                    matches!(conn.state(), State::Active | State::Holding)
                        && conn.exception().is_none()
                })
        })
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<Connection>> {
        let (dispatcher, server_config) = self
            .servers
            .get(&endpoint.host)
            .map(|s| (s.dispatcher.clone(), s.config.clone()))
            .ok_or_else(|| Error::ConnectFailed {
                reason: format!("no server for `{}'", endpoint),
            })?;

        let (client_end, server_end) = Self::transceivers(endpoint);
        let client = Connection::new(
            client_end,
            self.config.clone(),
            Role::Outgoing,
            None,
            &self.poller,
        );
        let server = Connection::new(
            server_end,
            server_config,
            Role::Incoming,
            Some(dispatcher),
            &self.poller,
        );

        let incoming = Arc::downgrade(&self.incoming);
        server.set_close_callback(Box::new(move |conn| {
            if let Some(map) = incoming.upgrade() {
                map.remove(&conn.id());
            }
        }));
        self.incoming.insert(server.id(), server.clone());

        let (started, _) = tokio::join!(client.start(), server.start());
        if let Err(e) = started {
            server.close(CloseMode::Forcefully);
            return Err(e);
        }

        let outgoing = Arc::downgrade(&self.outgoing);
        let key = endpoint.clone();
        client.set_close_callback(Box::new(move |conn| {
            if let Some(map) = outgoing.upgrade() {
                map.remove_if(&key, |_, cached| Arc::ptr_eq(cached, conn));
            }
        }));
        self.outgoing.insert(endpoint.clone(), client.clone());
        self.monitor.add(&client);
        self.monitor.add(&server);
        self.connects.fetch_add(1, Ordering::Relaxed);

        if self.config.trace.network >= 1 {
            log::info!("[Network] established connection to `{}'", endpoint);
        }
        Ok(client)
    }
}

impl Drop for MemoryConnectionFactory {
    fn drop(&mut self) {
        self.close_all(CloseMode::Forcefully);
    }
}
