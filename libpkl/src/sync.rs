// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, MutexGuard};

/// Extension trait for `Mutex` to provide a method that acquires a lock,
/// panicking if the lock is poisoned.
///
/// A poisoned lock means another thread panicked while holding the manager's
/// writer, reader, or session table; there is no state worth continuing with.
pub(crate) trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[allow(clippy::unwrap_used)]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap()
    }
}
