// Logmet -- extract metrics from log streams
// Copyright (C) 2025  The logmet authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Cooperative shutdown flag shared by all long-running threads.
///
/// The flag is set at most once, either by a signal or programmatically, and
/// stays set. Requesting shutdown twice is harmless.
#[derive(Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    /// Catch SIGINT and SIGTERM into this flag.
    pub fn catch_signals(&self) -> Result<(), ctrlc::Error> {
        let requested = self.requested.clone();
        ctrlc::set_handler(move || {
            requested.store(true, Ordering::SeqCst);
        })?;
        Ok(())
    }

    /// Request shutdown. Idempotent.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {

    use super::Shutdown;

    #[test]
    fn request_is_idempotent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.requested());
        shutdown.request();
        shutdown.request();
        assert!(shutdown.requested());
    }

    #[test]
    fn clones_share_the_flag() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        other.request();
        assert!(shutdown.requested());
    }
}
