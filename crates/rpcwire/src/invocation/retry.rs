// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Retry decision after a failed attempt.
//!
//! Checked in order:
//!
//! 1. batch requests and fixed references are never retried,
//! 2. "object not exist" for the router's add-proxy operation clears the
//!    router cache and retries at once, uncounted,
//! 3. "object not exist" on an indirect reference clears the locator cache
//!    and falls through to the counted retry,
//! 4. other request failures, marshal errors, shutdown of the local side,
//!    manual close and invocation control errors are final,
//! 5. a sent non-idempotent request is only retried after a close
//!    connection or "object not exist" (the peer did not run it),
//! 6. connection-level [`Error::Retry`] is retried at once, uncounted,
//! 7. otherwise the retry interval table is indexed by the attempt count.
//!    A close connection error is always retried once more past the end of
//!    the table.

use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::identity::OperationMode;
use crate::reference::{Reference, ADD_PROXY_OPERATION};

/// Returns the delay before the next attempt, or the error to report.
pub(crate) fn check_retry_after_exception(
    reference: &Reference,
    ex: Error,
    sent: bool,
    mode: OperationMode,
    cnt: &mut usize,
    config: &Config,
) -> Result<Duration, Error> {
    if reference.mode().is_batch() || reference.is_fixed() {
        return Err(unwrap_retry(ex));
    }

    if let Error::ObjectNotExist(failed) = &ex {
        if let Some(router) = reference.router_info() {
            if failed.operation == ADD_PROXY_OPERATION {
                router.clear_cache(reference);
                if config.trace.retry >= 1 {
                    log::info!(
                        "[Retry] retrying operation call to add proxy to router\n{}",
                        ex
                    );
                }
                return Ok(Duration::ZERO);
            }
        }
        if !reference.is_indirect() {
            return Err(ex);
        }
        if let Some(locator) = reference.locator_info() {
            locator.clear_cache(reference);
        }
    } else if ex.kind() == ErrorKind::RequestFailed {
        return Err(ex);
    }

    if is_final(&ex) {
        return Err(ex);
    }

    if sent
        && !mode.is_idempotent()
        && !matches!(ex, Error::CloseConnection | Error::ObjectNotExist(_))
    {
        return Err(ex);
    }

    if let Error::Retry(inner) = &ex {
        if config.trace.retry >= 1 {
            log::info!("[Retry] retrying operation call because of exception\n{}", inner);
        }
        return Ok(Duration::ZERO);
    }

    *cnt += 1;
    let intervals = &config.retry_intervals;
    let delay = if *cnt == intervals.len() + 1 && matches!(ex, Error::CloseConnection) {
        // A graceful close by the peer is always worth one more attempt.
        Duration::ZERO
    } else if *cnt > intervals.len() {
        if config.trace.retry >= 1 {
            log::info!(
                "[Retry] cannot retry operation call because retry limit has been exceeded\n{}",
                ex
            );
        }
        return Err(ex);
    } else {
        intervals[*cnt - 1]
    };

    if config.trace.retry >= 1 {
        log::info!(
            "[Retry] retrying operation call{} because of exception\n{}",
            if delay.is_zero() {
                String::new()
            } else {
                format!(" in {}ms", delay.as_millis())
            },
            ex
        );
    }
    Ok(delay)
}

fn is_final(ex: &Error) -> bool {
    match ex.kind() {
        ErrorKind::Marshal | ErrorKind::UnknownType | ErrorKind::InvocationControl => true,
        ErrorKind::ConnectionLifecycle => matches!(
            ex,
            Error::CommunicatorDestroyed
                | Error::ObjectAdapterDeactivated { .. }
                | Error::ConnectionManuallyClosed { .. }
        ),
        ErrorKind::RequestFailed => false,
        ErrorKind::Other => !matches!(ex, Error::Retry(_) | Error::NoEndpoint { .. }),
    }
}

pub(crate) fn unwrap_retry(ex: Error) -> Error {
    match ex {
        Error::Retry(inner) => *inner,
        other => other,
    }
}
