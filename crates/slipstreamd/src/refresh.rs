//! Background reload of the routing inputs.
//!
//! The route matrix is rewritten by the optimizer every few seconds and
//! the directory whenever operators push a change. Both land on disk;
//! these loops poll the files and swap fresh snapshots into the holders
//! so the packet path never touches the filesystem.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use slipstream_services::database::Directory;
use slipstream_services::maps::{unix_time, RelayEntry};
use slipstream_services::matrix::RouteMatrix;

use crate::state::BackendState;

/// Poll the matrix file and swap in any snapshot with a new timestamp.
/// The first tick fires immediately, which doubles as the initial load;
/// the holder starts empty.
pub async fn matrix_refresh_loop(
    state: Arc<BackendState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let path = state.config.routing.matrix_path.clone();
    let every = Duration::from_secs(state.config.routing.matrix_refresh_seconds.max(1));
    let mut interval = tokio::time::interval(every);
    let mut last_created_at = state.matrix.snapshot().created_at;
    let mut healthy = true;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                return;
            }

            _ = interval.tick() => {
                match load_matrix(&path).await {
                    Ok(matrix) => {
                        if !healthy {
                            tracing::info!(path = %path.display(), "route matrix recovered");
                        }
                        healthy = true;
                        if matrix.created_at != last_created_at {
                            last_created_at = matrix.created_at;
                            feed_relays(&state, &matrix);
                            tracing::debug!(
                                relays = matrix.num_relays(),
                                created_at = matrix.created_at,
                                "new route matrix"
                            );
                            state.matrix.swap(matrix);
                        }
                    }
                    Err(e) => {
                        // Warn once per outage, not once per tick.
                        if healthy {
                            tracing::warn!(
                                path = %path.display(),
                                error = %e,
                                "could not load route matrix"
                            );
                        }
                        healthy = false;
                    }
                }
            }
        }
    }
}

/// Poll the directory file. The startup snapshot was loaded before the
/// sockets came up, so the immediate first tick is burned.
pub async fn directory_refresh_loop(
    state: Arc<BackendState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let path = state.config.routing.database_path.clone();
    let every = Duration::from_secs(state.config.routing.database_refresh_seconds.max(1));
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    let mut healthy = true;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                return;
            }

            _ = interval.tick() => {
                match Directory::load(&path) {
                    Ok(directory) => {
                        if !healthy {
                            tracing::info!(path = %path.display(), "directory recovered");
                        }
                        healthy = true;
                        tracing::debug!(created_at = %directory.created_at, "directory reloaded");
                        state.directory.swap(directory);
                    }
                    Err(e) => {
                        if healthy {
                            tracing::warn!(
                                path = %path.display(),
                                error = %e,
                                "could not load directory"
                            );
                        }
                        healthy = false;
                    }
                }
            }
        }
    }
}

async fn load_matrix(path: &Path) -> Result<RouteMatrix> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    let matrix = RouteMatrix::from_bytes(&data)?;
    Ok(matrix)
}

/// Mirror the matrix relay set into the relay map. Rows stop being
/// refreshed when a relay leaves the matrix and age out on their own.
fn feed_relays(state: &BackendState, matrix: &RouteMatrix) {
    let now = unix_time();
    for i in 0..matrix.num_relays() {
        let relay_id = matrix.relay_ids[i];
        state.relays.update(
            relay_id,
            RelayEntry {
                relay_id,
                name: matrix.relay_names[i].clone(),
                address: matrix.relay_addresses[i],
                last_update: now,
            },
        );
    }
}
