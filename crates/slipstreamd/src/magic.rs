//! Magic rotation for the v5 packet filters.
//!
//! Three 8-byte magic values are live at any moment: upcoming, current
//! and previous. Servers learn the triple from init/update responses and
//! chonkle their packets with whichever they hold; we accept all three,
//! so a server can lag a full rotation behind without being filtered.

use std::sync::RwLock;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::broadcast;

pub const MAGIC_BYTES: usize = 8;

/// Seconds between rotations. A server that misses two rotations in a
/// row starts failing the advanced filter and must re-init.
pub const MAGIC_ROTATION_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MagicValues {
    pub upcoming: [u8; MAGIC_BYTES],
    pub current: [u8; MAGIC_BYTES],
    pub previous: [u8; MAGIC_BYTES],
}

impl MagicValues {
    /// The triple in the order the inbound filter tries them.
    pub fn accepted(&self) -> [[u8; MAGIC_BYTES]; 3] {
        [self.current, self.upcoming, self.previous]
    }
}

#[derive(Debug)]
pub struct MagicKeeper {
    values: RwLock<MagicValues>,
}

impl MagicKeeper {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(MagicValues {
                upcoming: random_magic(),
                current: random_magic(),
                previous: random_magic(),
            }),
        }
    }

    pub fn values(&self) -> MagicValues {
        *self.values.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Shift the window: current becomes previous, upcoming becomes
    /// current, and a fresh upcoming is drawn.
    pub fn rotate(&self) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.previous = values.current;
        values.current = values.upcoming;
        values.upcoming = random_magic();
    }

    /// Interval rotation; exits on shutdown.
    pub async fn rotation_loop(
        self: std::sync::Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(MAGIC_ROTATION_SECONDS));
        // The first tick fires immediately; burn it so the startup
        // triple lives a full period.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    return;
                }

                _ = interval.tick() => {
                    self.rotate();
                    tracing::debug!("rotated packet magic");
                }
            }
        }
    }
}

impl Default for MagicKeeper {
    fn default() -> Self {
        Self::new()
    }
}

fn random_magic() -> [u8; MAGIC_BYTES] {
    let mut magic = [0u8; MAGIC_BYTES];
    rand::thread_rng().fill_bytes(&mut magic);
    magic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_shifts_the_window() {
        let keeper = MagicKeeper::new();
        let before = keeper.values();
        keeper.rotate();
        let after = keeper.values();
        assert_eq!(after.previous, before.current);
        assert_eq!(after.current, before.upcoming);
        assert_ne!(after.upcoming, before.upcoming);
    }

    #[test]
    fn packets_from_one_rotation_back_still_pass() {
        let keeper = MagicKeeper::new();
        let held = keeper.values().current;
        keeper.rotate();
        assert!(keeper.values().accepted().contains(&held));
        keeper.rotate();
        assert!(!keeper.values().accepted().contains(&held));
    }
}
