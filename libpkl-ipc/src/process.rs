// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Global registry of spawned evaluator children.
//!
//! Every child is registered here before it is handed to a transport, and an
//! exit hook terminates whatever is still registered when the host process
//! goes down, so an aborting caller does not leave `pkl server` processes
//! behind.

use std::sync::{Mutex, Once};

static REGISTERED: Mutex<Vec<u32>> = Mutex::new(Vec::new());
static INSTALL_HOOK: Once = Once::new();

/// Registers a live child pid and installs the exit hook on first use.
pub fn register(pid: u32) {
    INSTALL_HOOK.call_once(|| {
        // SAFETY: `terminate_registered` is a plain extern "C" fn with no
        // unwinding path.
        #[cfg(unix)]
        unsafe {
            libc::atexit(terminate_registered);
        }
    });
    if let Ok(mut pids) = REGISTERED.lock() {
        pids.push(pid);
    }
}

/// Removes a pid after the transport has reaped the child.
pub fn deregister(pid: u32) {
    if let Ok(mut pids) = REGISTERED.lock() {
        pids.retain(|p| *p != pid);
    }
}

#[cfg(test)]
pub(crate) fn registered_pids() -> Vec<u32> {
    REGISTERED.lock().map(|pids| pids.clone()).unwrap_or_default()
}

#[cfg_attr(not(unix), allow(dead_code))]
extern "C" fn terminate_registered() {
    let Ok(mut pids) = REGISTERED.lock() else {
        return;
    };
    for pid in pids.drain(..) {
        terminate(pid);
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: signalling and reaping a pid we spawned ourselves.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
        libc::waitpid(pid as libc::pid_t, std::ptr::null_mut(), 0);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}
