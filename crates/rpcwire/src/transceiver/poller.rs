// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Readiness poller thread.
//!
//! Transceivers signal readiness through a [`ReadyCallback`] that only
//! pushes a command on a channel; the poller thread drains the channel and
//! drives the connection. Readiness callbacks therefore never run
//! connection code on the transport's thread and never take the
//! connection lock.
//!
//! ```text
//!  transceiver --ready()--> [channel] --> rpcwire-poller --> Connection::poll_ready()
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use super::ReadyCallback;
use crate::connection::Connection;
use crate::error::Result;

enum PollerCommand {
    Ready(Weak<Connection>),
    Shutdown,
}

pub struct ReadinessPoller {
    tx: Sender<PollerCommand>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReadinessPoller {
    /// Spawn the poller thread.
    pub fn new() -> Result<Self> {
        let (tx, rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("rpcwire-poller".into())
            .spawn(move || run_loop(rx, flag))?;
        log::debug!("[Network] readiness poller started");
        Ok(Self {
            tx,
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Callback to install on the transceiver of `conn`.
    pub fn notifier(&self, conn: Weak<Connection>) -> ReadyCallback {
        let tx = self.tx.clone();
        Arc::new(move || {
            // Fails only once the poller is gone.
            let _ = tx.send(PollerCommand::Ready(conn.clone()));
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the thread and wait for it, unless called from the poller
    /// thread itself.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(PollerCommand::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        log::debug!("[Network] readiness poller stopped");
    }
}

impl Drop for ReadinessPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(rx: Receiver<PollerCommand>, running: Arc<AtomicBool>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            PollerCommand::Ready(conn) => {
                if let Some(conn) = conn.upgrade() {
                    conn.poll_ready();
                }
            }
            PollerCommand::Shutdown => break,
        }
        if !running.load(Ordering::Acquire) {
            break;
        }
    }
}
