// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Active connection management.
//!
//! [`Connection::monitor`] is called periodically with the current time:
//!
//! - closing connections are closed forcefully once the close timeout
//!   expired,
//! - active connections send heartbeats according to
//!   [`AcmHeartbeat`](crate::config::AcmHeartbeat), then are closed once
//!   idle for the ACM timeout according to
//!   [`AcmClose`](crate::config::AcmClose).
//!
//! [`AcmMonitor`] drives `monitor` for a set of connections from a tokio
//! interval task.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{Connection, Effects, State};
use crate::config::{AcmClose, AcmHeartbeat};
use crate::error::Error;

impl Connection {
    /// Run the timers of this connection.
    pub fn monitor(&self, now: Instant) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if matches!(inner.state, State::Closing | State::ClosingPending) {
                if inner.close_deadline.is_some_and(|deadline| now >= deadline) {
                    self.set_state(
                        inner,
                        State::Closed,
                        Some(Error::CloseTimeout),
                        &mut effects,
                    );
                }
            } else if inner.state == State::Active && inner.acm.is_enabled() {
                let acm = inner.acm;

                let heartbeat = match acm.heartbeat {
                    AcmHeartbeat::Off => false,
                    AcmHeartbeat::Always => true,
                    AcmHeartbeat::OnIdle => idle_for(inner.last_activity, now, acm.timeout / 4),
                    AcmHeartbeat::OnDispatch => {
                        inner.dispatch_count > 0
                            && idle_for(inner.last_activity, now, acm.timeout / 4)
                    }
                };
                if heartbeat && inner.write_queue.is_empty() {
                    log::trace!("[Network] sending heartbeat");
                    if self.send_heartbeat(inner, &mut effects).is_ok() {
                        inner.last_activity = now;
                    }
                }

                // Never time out a connection in the middle of a message.
                let busy = inner.is_reading() || !inner.write_queue.is_empty();
                if inner.state == State::Active
                    && !busy
                    && acm.close != AcmClose::Off
                    && idle_for(inner.last_activity, now, acm.timeout)
                {
                    let has_requests = !inner.requests.is_empty();
                    if acm.close == AcmClose::OnIdleForceful
                        || (acm.close != AcmClose::OnIdle && has_requests)
                    {
                        self.set_state(
                            inner,
                            State::Closed,
                            Some(Error::ConnectionTimeout),
                            &mut effects,
                        );
                    } else if acm.close != AcmClose::OnInvocation
                        && inner.dispatch_count == 0
                        && inner.batch.is_empty()
                        && !has_requests
                    {
                        self.set_state(
                            inner,
                            State::Closing,
                            Some(Error::ConnectionTimeout),
                            &mut effects,
                        );
                    }
                }
            }
        }
        self.run_effects(effects);
    }
}

fn idle_for(last_activity: Instant, now: Instant, period: Duration) -> bool {
    now.saturating_duration_since(last_activity) >= period
}

/// Periodic driver for [`Connection::monitor`].
///
/// Connections are held weakly and forgotten once dropped or finished.
pub struct AcmMonitor {
    connections: Mutex<Vec<Weak<Connection>>>,
}

impl AcmMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn add(&self, conn: &Arc<Connection>) {
        self.connections.lock().push(Arc::downgrade(conn));
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monitor every live connection once.
    pub fn run_once(&self, now: Instant) {
        let live: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock();
            connections.retain(|weak| {
                weak.upgrade()
                    .is_some_and(|conn| conn.state() != State::Finished)
            });
            connections.iter().filter_map(Weak::upgrade).collect()
        };
        for conn in live {
            conn.monitor(now);
        }
    }

    /// Spawn the monitoring task on the current tokio runtime. The task
    /// stops once the monitor is dropped.
    pub fn spawn(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.run_once(Instant::now());
            }
        })
    }
}
