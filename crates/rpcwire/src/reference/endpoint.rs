// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Endpoints and candidate filtering.
//!
//! Before connecting, the endpoints of a routable reference are filtered and
//! ordered:
//!
//! 1. endpoints without a host are dropped (not connectable),
//! 2. datagram invocation modes keep datagram endpoints, the others keep
//!    stream endpoints,
//! 3. the reference's connection id is applied to each endpoint,
//! 4. `Random` selection shuffles, `Ordered` keeps the configured order,
//! 5. secure references keep secure endpoints only; otherwise endpoints are
//!    partitioned non-secure first, or secure first with `prefer_secure`.

use std::fmt;
use std::time::Duration;

use crate::config::EndpointSelection;

/// Address of a server-side transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Transport name, e.g. `mem` or `mem-udp`.
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub datagram: bool,
    pub secure: bool,
    pub timeout: Option<Duration>,
    /// Connections are only shared between endpoints with the same id.
    pub connection_id: String,
}

impl Endpoint {
    /// In-memory stream endpoint for the server registered as `host`.
    pub fn stream(host: impl Into<String>) -> Self {
        Self {
            transport: "mem".into(),
            host: host.into(),
            ..Self::default()
        }
    }

    /// In-memory datagram endpoint for the server registered as `host`.
    pub fn datagram(host: impl Into<String>) -> Self {
        Self {
            transport: "mem-udp".into(),
            host: host.into(),
            datagram: true,
            ..Self::default()
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = connection_id.into();
        self
    }

    pub fn is_connectable(&self) -> bool {
        !self.host.is_empty()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -h {}", self.transport, self.host)?;
        if self.port != 0 {
            write!(f, " -p {}", self.port)?;
        }
        if let Some(timeout) = self.timeout {
            write!(f, " -t {}", timeout.as_millis())?;
        }
        if self.secure {
            write!(f, " -s")?;
        }
        Ok(())
    }
}

/// Endpoint policy of one invocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndpointFilter<'a> {
    pub datagram: bool,
    pub secure: bool,
    pub prefer_secure: bool,
    pub selection: EndpointSelection,
    pub connection_id: &'a str,
}

pub(crate) fn filter_endpoints(endpoints: &[Endpoint], filter: EndpointFilter<'_>) -> Vec<Endpoint> {
    let mut candidates: Vec<Endpoint> = endpoints
        .iter()
        .filter(|e| e.is_connectable() && e.datagram == filter.datagram)
        .map(|e| {
            let mut e = e.clone();
            e.connection_id = filter.connection_id.to_string();
            e
        })
        .collect();

    if filter.selection == EndpointSelection::Random {
        fastrand::shuffle(&mut candidates);
    }

    if filter.secure {
        candidates.retain(|e| e.secure);
    } else {
        // Stable partition, keeps the selection order within each half.
        let (first, second): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|e| e.secure == filter.prefer_secure);
        candidates = first;
        candidates.extend(second);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(selection: EndpointSelection) -> EndpointFilter<'static> {
        EndpointFilter {
            datagram: false,
            secure: false,
            prefer_secure: false,
            selection,
            connection_id: "",
        }
    }

    #[test]
    fn test_mode_and_connectable_filtering() {
        let endpoints = vec![
            Endpoint::stream("a"),
            Endpoint::datagram("b"),
            Endpoint::stream(""),
            Endpoint::stream("c"),
        ];
        let stream = filter_endpoints(&endpoints, filter(EndpointSelection::Ordered));
        assert_eq!(stream, vec![Endpoint::stream("a"), Endpoint::stream("c")]);

        let dgram = filter_endpoints(
            &endpoints,
            EndpointFilter {
                datagram: true,
                ..filter(EndpointSelection::Ordered)
            },
        );
        assert_eq!(dgram, vec![Endpoint::datagram("b")]);
    }

    #[test]
    fn test_secure_partitioning() {
        let endpoints = vec![
            Endpoint::stream("s1").with_secure(true),
            Endpoint::stream("p1"),
            Endpoint::stream("s2").with_secure(true),
            Endpoint::stream("p2"),
        ];
        let hosts = |v: Vec<Endpoint>| v.into_iter().map(|e| e.host).collect::<Vec<_>>();

        let plain_first = filter_endpoints(&endpoints, filter(EndpointSelection::Ordered));
        assert_eq!(hosts(plain_first), vec!["p1", "p2", "s1", "s2"]);

        let secure_first = filter_endpoints(
            &endpoints,
            EndpointFilter {
                prefer_secure: true,
                ..filter(EndpointSelection::Ordered)
            },
        );
        assert_eq!(hosts(secure_first), vec!["s1", "s2", "p1", "p2"]);

        let secure_only = filter_endpoints(
            &endpoints,
            EndpointFilter {
                secure: true,
                ..filter(EndpointSelection::Ordered)
            },
        );
        assert_eq!(hosts(secure_only), vec!["s1", "s2"]);
    }

    #[test]
    fn test_random_selection_keeps_candidates() {
        let endpoints: Vec<Endpoint> = (0..16).map(|i| Endpoint::stream(format!("h{}", i))).collect();
        let mut shuffled = filter_endpoints(&endpoints, filter(EndpointSelection::Random));
        shuffled.sort_by(|a, b| a.host.cmp(&b.host));
        let mut expected = endpoints.clone();
        expected.sort_by(|a, b| a.host.cmp(&b.host));
        assert_eq!(shuffled, expected);
    }

    #[test]
    fn test_connection_id_applied() {
        let out = filter_endpoints(
            &[Endpoint::stream("a")],
            EndpointFilter {
                connection_id: "cid",
                ..filter(EndpointSelection::Ordered)
            },
        );
        assert_eq!(out[0].connection_id, "cid");
        assert_eq!(Endpoint::stream("a").with_port(4).to_string(), "mem -h a -p 4");
    }
}
