//! Slice billing: envelope accounting and nibblin pricing.
//!
//! Every accelerated slice is billed for its bandwidth envelope, the
//! capacity reserved through the relays, not the traffic actually sent.
//! Prices are kept in nibblins, a fixed point unit where 1e9 nibblins is
//! one reference unit per gigabyte. All arithmetic stays exact until the
//! final conversion, which truncates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::Directory;
use crate::matrix::MAX_RELAYS_PER_ROUTE;

/// Fixed point pricing unit. 1e9 nibblins per gigabyte is the reference
/// price of acceleration itself, before relay egress.
pub type Nibblin = u64;

/// The platform's own fee, charged per gigabyte of envelope on top of
/// relay egress.
pub const NEXT_PRICE_NIBBLINS_PER_GB: Nibblin = 1_000_000_000;

const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// Bandwidth envelope in bytes for one slice: `(1000 * kbps / 8) *
/// seconds`, integer math throughout.
pub fn envelope_bytes(kbps_up: u64, kbps_down: u64, slice_seconds: u64) -> (u64, u64) {
    let bytes_up = 1000 * kbps_up / 8 * slice_seconds;
    let bytes_down = 1000 * kbps_down / 8 * slice_seconds;
    (bytes_up, bytes_down)
}

/// Per-hop egress price for a route, nibblins per gigabyte. A relay's
/// own override wins over its seller's list price; a relay missing from
/// the directory prices at zero rather than failing the slice.
pub fn route_relay_prices_per_gb(
    directory: &Directory,
    route_relay_ids: &[u64],
) -> [Nibblin; MAX_RELAYS_PER_ROUTE] {
    let mut prices = [0; MAX_RELAYS_PER_ROUTE];
    for (i, relay_id) in route_relay_ids.iter().take(MAX_RELAYS_PER_ROUTE).enumerate() {
        let Some(relay) = directory.relay_by_id(*relay_id) else {
            continue;
        };
        prices[i] = if relay.egress_price_override > 0 {
            relay.egress_price_override
        } else {
            directory
                .seller_of(relay)
                .map_or(0, |seller| seller.egress_price_nibblins_per_gb)
        };
    }
    prices
}

/// Total slice price: relay egress summed across hops plus the platform
/// fee, scaled by envelope gigabytes up and down. Truncated to whole
/// nibblins at the end only.
pub fn total_price_nibblins(
    prices_per_gb: &[Nibblin; MAX_RELAYS_PER_ROUTE],
    route_num_relays: i32,
    envelope_bytes_up: u64,
    envelope_bytes_down: u64,
) -> Nibblin {
    if route_num_relays == 0 {
        return 0;
    }

    let envelope_gb =
        envelope_bytes_up as f64 / BYTES_PER_GB + envelope_bytes_down as f64 / BYTES_PER_GB;
    let per_gb: Nibblin = prices_per_gb.iter().sum::<Nibblin>() + NEXT_PRICE_NIBBLINS_PER_GB;

    (per_gb as f64 * envelope_gb) as Nibblin
}

/// What each relay earns for the slice, for per-seller settlement.
pub fn per_relay_price_nibblins(
    prices_per_gb: &[Nibblin; MAX_RELAYS_PER_ROUTE],
    route_num_relays: i32,
    envelope_bytes_up: u64,
    envelope_bytes_down: u64,
) -> [Nibblin; MAX_RELAYS_PER_ROUTE] {
    let mut prices = [0; MAX_RELAYS_PER_ROUTE];
    if route_num_relays == 0 {
        return prices;
    }

    let envelope_gb =
        envelope_bytes_up as f64 / BYTES_PER_GB + envelope_bytes_down as f64 / BYTES_PER_GB;
    for (price, per_gb) in prices.iter_mut().zip(prices_per_gb) {
        *price = (*per_gb as f64 * envelope_gb) as Nibblin;
    }
    prices
}

// ── Billing entries ───────────────────────────────────────────────────────────

/// One slice's billing record, queued to the post-session pipeline and
/// handed to the [`Biller`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingEntry {
    pub timestamp: u64,
    pub buyer_id: u64,
    pub user_hash: u64,
    pub session_id: u64,
    pub slice_number: u32,
    pub datacenter_id: u64,
    pub latitude: f32,
    pub longitude: f32,

    pub direct_rtt: f32,
    pub direct_jitter: f32,
    pub direct_packet_loss: f32,
    /// Loss measured from game packet counters, worst direction.
    pub real_packet_loss: f32,

    pub next: bool,
    pub committed: bool,
    pub multipath: bool,
    /// Slice that put the session on a fresh route, billed double to
    /// cover the doubled expiry window granted for route negotiation.
    pub initial: bool,
    pub fallback_to_direct: bool,
    pub reported: bool,
    pub route_changed: bool,

    pub next_rtt: f32,
    pub next_jitter: f32,
    pub next_packet_loss: f32,
    pub predicted_rtt: f32,

    pub session_duration: u32,
    pub duration_on_next: u32,
    /// Bitfield of client-reported events, accumulated across slices.
    pub session_events: u64,

    pub envelope_bytes_up: u64,
    pub envelope_bytes_down: u64,
    pub num_route_relays: u32,
    pub route_relay_ids: [u64; MAX_RELAYS_PER_ROUTE],
    pub relay_prices: [Nibblin; MAX_RELAYS_PER_ROUTE],
    pub total_price: Nibblin,

    /// End-of-session summary row, written once when the session is
    /// evicted from the session map.
    pub summary: bool,
}

#[derive(Debug, Error)]
pub enum BillError {
    #[error("billing sink unavailable: {0}")]
    Unavailable(String),
    #[error("billing entry rejected: {0}")]
    Rejected(String),
}

/// Sink for finished billing entries. Implementations are expected to be
/// slow; entries reach them through the post-session worker pool, never
/// from the packet path.
#[async_trait]
pub trait Biller: Send + Sync {
    async fn bill(&self, entry: &BillingEntry) -> Result<(), BillError>;
}

/// Discards every entry. For tests and billing-disabled deployments.
#[derive(Debug, Default)]
pub struct NoOpBiller;

#[async_trait]
impl Biller for NoOpBiller {
    async fn bill(&self, _entry: &BillingEntry) -> Result<(), BillError> {
        Ok(())
    }
}

/// Writes entries to the structured log as JSON, one line per slice.
#[derive(Debug, Default)]
pub struct LogBiller;

#[async_trait]
impl Biller for LogBiller {
    async fn bill(&self, entry: &BillingEntry) -> Result<(), BillError> {
        let json = serde_json::to_string(entry)
            .map_err(|err| BillError::Rejected(err.to_string()))?;
        tracing::info!(target: "billing", session_id = entry.session_id, slice = entry.slice_number, %json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DirectoryFile;

    #[test]
    fn envelope_bytes_formula() {
        // 1024 kbps is 128,000 bytes per second.
        assert_eq!(envelope_bytes(1024, 512, 10), (1_280_000, 640_000));
        assert_eq!(envelope_bytes(0, 0, 10), (0, 0));
        // Initial slices cover twenty seconds.
        assert_eq!(envelope_bytes(1024, 512, 20), (2_560_000, 1_280_000));
    }

    #[test]
    fn total_price_sums_relays_and_platform_fee() {
        let prices = [100, 200, 0, 0, 0];
        // Half a gigabyte each way.
        let total = total_price_nibblins(&prices, 2, 500_000_000, 500_000_000);
        assert_eq!(total, 300 + NEXT_PRICE_NIBBLINS_PER_GB);

        // Direct slices cost nothing.
        assert_eq!(total_price_nibblins(&prices, 0, 500_000_000, 500_000_000), 0);
    }

    #[test]
    fn price_truncates_at_the_end_only() {
        // 1.5 GB at 3 nibblins/GB is 4.5, truncated to 4 with the fee
        // scaled separately exact.
        let prices = [3, 0, 0, 0, 0];
        let total = total_price_nibblins(&prices, 1, 1_000_000_000, 500_000_000);
        assert_eq!(total, 1_500_000_004);

        let per_relay = per_relay_price_nibblins(&prices, 1, 1_000_000_000, 500_000_000);
        assert_eq!(per_relay, [4, 0, 0, 0, 0]);
    }

    #[test]
    fn relay_prices_prefer_overrides_and_tolerate_missing_relays() {
        let file = r#"{
            "sellers": [
                { "id": 1, "name": "Amazing Cloud", "code": "amazing", "egress_price_nibblins_per_gb": 100 }
            ],
            "datacenters": [
                { "id": 100, "name": "amazing.ohio", "latitude": 40.0, "longitude": -83.0, "seller_id": 1 }
            ],
            "relays": [
                {
                    "id": 1000, "name": "amazing.ohio.1", "public_addr": "10.0.0.1:40000",
                    "public_key": "0101010101010101010101010101010101010101010101010101010101010101",
                    "seller_id": 1, "datacenter_id": 100
                },
                {
                    "id": 1001, "name": "amazing.ohio.2", "public_addr": "10.0.0.2:40000",
                    "public_key": "0202020202020202020202020202020202020202020202020202020202020202",
                    "seller_id": 1, "datacenter_id": 100, "egress_price_override": 250
                }
            ]
        }"#;
        let file: DirectoryFile = serde_json::from_str(file).unwrap();
        let directory = Directory::build(file).unwrap();

        let prices = route_relay_prices_per_gb(&directory, &[1000, 1001, 9999]);
        assert_eq!(prices, [100, 250, 0, 0, 0]);
    }

    #[tokio::test]
    async fn noop_biller_accepts_everything() {
        let entry = BillingEntry { session_id: 7, ..BillingEntry::default() };
        assert!(NoOpBiller.bill(&entry).await.is_ok());
    }
}
