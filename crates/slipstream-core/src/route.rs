//! Route policy and per-session decision state.
//!
//! `RouteShader` is buyer-level policy (what the buyer pays us to optimize),
//! `InternalConfig` is operator tuning (thresholds the decision machinery
//! runs on), and `RouteState` is the per-session decision state that rides
//! inside the session blob between slices. RouteState is bit-packed; see
//! `serialize` for the exact layout.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::stream::{Stream, WireError};
use crate::wire::MAX_NEAR_RELAYS;

/// Cost value meaning "not routable through this relay".
pub const UNROUTABLE_COST: u8 = 255;

/// Slots in the packet-loss history bitmaps.
pub const PL_HISTORY_SLOTS: u32 = 8;

/// Jitter headroom before a near relay is excluded.
pub const JITTER_THRESHOLD: u8 = 15;

/// RTT headroom over direct before a near relay is excluded.
pub const NEAR_RELAY_RTT_HEADROOM: u8 = 10;

/// Consecutive bad slices before mispredict / multipath latency vetoes fire.
pub const VETO_SLICE_COUNT: u8 = 3;

/// Try-before-you-buy sessions get vetoed past this many committed slices.
pub const MAX_COMMIT_COUNT: u8 = 3;

// ── RouteShader ───────────────────────────────────────────────────────────────

/// Per-buyer routing policy, part of the buyer record in the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteShader {
    /// Master off-switch: never take this buyer's sessions onto next.
    pub disabled: bool,
    /// Percentage of users eligible for acceleration (by user hash).
    pub selection_percent: u64,
    /// Run an A/B test: the B side (odd user hash) stays direct.
    pub ab_test: bool,
    pub reduce_latency: bool,
    pub reduce_packet_loss: bool,
    /// Direct RTT at or below this needs no acceleration (ms).
    pub acceptable_latency: i32,
    /// Latency improvement (ms) required before next is worth taking.
    pub latency_threshold: i32,
    /// Instant packet loss (percent) considered acceptable on direct.
    pub acceptable_packet_loss: f32,
    /// Sustained packet loss (percent) that triggers the packet-loss goal.
    pub packet_loss_sustained: f32,
    pub bandwidth_envelope_up_kbps: u32,
    pub bandwidth_envelope_down_kbps: u32,
    /// Send on both paths at once (doubles bandwidth cost).
    pub multipath: bool,
    /// Pro tier: aggressive acceleration regardless of measured benefit.
    pub pro_mode: bool,
    /// Debug/QA: force every eligible session onto next.
    pub force_next: bool,
    /// Sessions start uncommitted and only bill once acceleration proves out.
    pub try_before_you_buy: bool,
    pub banned_users: HashSet<u64>,
}

impl Default for RouteShader {
    fn default() -> Self {
        Self {
            disabled: false,
            selection_percent: 100,
            ab_test: false,
            reduce_latency: true,
            reduce_packet_loss: true,
            acceptable_latency: 0,
            latency_threshold: 10,
            acceptable_packet_loss: 1.0,
            packet_loss_sustained: 0.1,
            bandwidth_envelope_up_kbps: 1024,
            bandwidth_envelope_down_kbps: 1024,
            multipath: false,
            pro_mode: false,
            force_next: false,
            try_before_you_buy: false,
            banned_users: HashSet::new(),
        }
    }
}

// ── InternalConfig ────────────────────────────────────────────────────────────

/// Operator tuning for the decision machinery. Ships with the buyer record
/// so support can adjust a single buyer without a deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalConfig {
    /// Next must beat direct by at least this much to be selected (ms).
    pub route_select_threshold: i32,
    /// A new route must beat the current one by this much to switch (ms).
    pub route_switch_threshold: i32,
    /// Most added latency tolerated when chasing packet-loss reduction (ms).
    pub max_latency_trade_off: i32,
    /// Latency-worse veto margins, negative = tolerated regression (ms).
    pub rtt_veto_default: i32,
    pub rtt_veto_packet_loss: i32,
    pub rtt_veto_multipath: i32,
    /// Direct RTT at which multipath is overloading the client link (ms).
    pub multipath_overload_threshold: i32,
    /// Hard ceiling on next RTT (ms).
    pub max_next_rtt: i32,
    /// Improvement so large that multipath is cancelled as wasteful (ms).
    pub multipath_threshold: i32,
    /// Minimum distinct first-hop relays among candidate routes, 0 = no check.
    pub route_diversity: i32,
    /// Never commit sessions; acceleration is observational only.
    pub uncommitted: bool,
}

impl Default for InternalConfig {
    fn default() -> Self {
        Self {
            route_select_threshold: 2,
            route_switch_threshold: 5,
            max_latency_trade_off: 20,
            rtt_veto_default: -10,
            rtt_veto_packet_loss: -30,
            rtt_veto_multipath: -20,
            multipath_overload_threshold: 500,
            max_next_rtt: 300,
            multipath_threshold: 25,
            route_diversity: 0,
            uncommitted: false,
        }
    }
}

// ── RouteState ────────────────────────────────────────────────────────────────

/// Per-session decision state, carried inside the session blob.
///
/// Veto flags are one-way: once set they stay set for the life of the
/// session, and `veto` implies the session never goes back on next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteState {
    pub next: bool,
    pub committed: bool,
    pub multipath: bool,
    pub veto: bool,

    // Early-out reasons, recorded once.
    pub banned: bool,
    pub disabled: bool,
    pub not_selected: bool,
    pub ab_test: bool,
    pub a_side: bool,
    pub b_side: bool,
    pub forced_next: bool,
    pub location_veto: bool,

    // What the session is optimizing while on next, set when the route is taken.
    pub reduce_latency: bool,
    pub reduce_packet_loss: bool,
    pub pro_mode: bool,

    // Veto reasons while on next.
    pub mispredict: bool,
    pub latency_worse: bool,
    pub multipath_overload: bool,
    pub commit_veto: bool,
    pub route_lost: bool,
    pub relay_went_away: bool,
    pub no_route: bool,
    pub next_latency_too_high: bool,
    pub lack_of_diversity: bool,
    pub multipath_restricted: bool,

    pub mispredict_counter: u8,
    pub latency_worse_counter: u8,
    pub commit_counter: u8,

    // Near-relay reconciliation state (running maxima, exclusions at 255).
    pub num_near_relays: u8,
    pub near_relay_rtt: [u8; MAX_NEAR_RELAYS],
    pub near_relay_jitter: [u8; MAX_NEAR_RELAYS],
    pub near_relay_pl_history: [u8; MAX_NEAR_RELAYS],
    pub near_relay_pl_count: [u16; MAX_NEAR_RELAYS],

    pub direct_pl_history: u8,
    pub direct_pl_count: u16,
    pub pl_history_index: u8,
    pub pl_history_samples: u8,
    pub direct_jitter: u8,
}

impl RouteState {
    /// True when any veto reason has fired.
    pub fn vetoed(&self) -> bool {
        self.veto
    }

    pub fn serialize<S: Stream>(&mut self, stream: &mut S) -> Result<(), WireError> {
        stream.serialize_bool(&mut self.next)?;
        stream.serialize_bool(&mut self.committed)?;
        stream.serialize_bool(&mut self.multipath)?;
        stream.serialize_bool(&mut self.veto)?;

        stream.serialize_bool(&mut self.banned)?;
        stream.serialize_bool(&mut self.disabled)?;
        stream.serialize_bool(&mut self.not_selected)?;
        stream.serialize_bool(&mut self.ab_test)?;
        stream.serialize_bool(&mut self.a_side)?;
        stream.serialize_bool(&mut self.b_side)?;
        stream.serialize_bool(&mut self.forced_next)?;
        stream.serialize_bool(&mut self.location_veto)?;

        stream.serialize_bool(&mut self.reduce_latency)?;
        stream.serialize_bool(&mut self.reduce_packet_loss)?;
        stream.serialize_bool(&mut self.pro_mode)?;

        stream.serialize_bool(&mut self.mispredict)?;
        stream.serialize_bool(&mut self.latency_worse)?;
        stream.serialize_bool(&mut self.multipath_overload)?;
        stream.serialize_bool(&mut self.commit_veto)?;
        stream.serialize_bool(&mut self.route_lost)?;
        stream.serialize_bool(&mut self.relay_went_away)?;
        stream.serialize_bool(&mut self.no_route)?;
        stream.serialize_bool(&mut self.next_latency_too_high)?;
        stream.serialize_bool(&mut self.lack_of_diversity)?;
        stream.serialize_bool(&mut self.multipath_restricted)?;

        let mut counter = i64::from(self.mispredict_counter);
        stream.serialize_int_range(&mut counter, 0, 7)?;
        self.mispredict_counter = counter as u8;
        let mut counter = i64::from(self.latency_worse_counter);
        stream.serialize_int_range(&mut counter, 0, 7)?;
        self.latency_worse_counter = counter as u8;
        let mut counter = i64::from(self.commit_counter);
        stream.serialize_int_range(&mut counter, 0, 7)?;
        self.commit_counter = counter as u8;

        let mut num = i64::from(self.num_near_relays);
        stream.serialize_int_range(&mut num, 0, MAX_NEAR_RELAYS as i64)?;
        self.num_near_relays = num as u8;
        for i in 0..self.num_near_relays as usize {
            stream.serialize_u8(&mut self.near_relay_rtt[i])?;
            stream.serialize_u8(&mut self.near_relay_jitter[i])?;
            stream.serialize_u8(&mut self.near_relay_pl_history[i])?;
            stream.serialize_u16(&mut self.near_relay_pl_count[i])?;
        }

        stream.serialize_u8(&mut self.direct_pl_history)?;
        stream.serialize_u16(&mut self.direct_pl_count)?;
        let mut index = i64::from(self.pl_history_index);
        stream.serialize_int_range(&mut index, 0, PL_HISTORY_SLOTS as i64 - 1)?;
        self.pl_history_index = index as u8;
        let mut samples = i64::from(self.pl_history_samples);
        stream.serialize_int_range(&mut samples, 0, PL_HISTORY_SLOTS as i64)?;
        self.pl_history_samples = samples as u8;
        stream.serialize_u8(&mut self.direct_jitter)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{ReadStream, WriteStream};

    #[test]
    fn defaults_match_policy() {
        let shader = RouteShader::default();
        assert_eq!(shader.selection_percent, 100);
        assert!(shader.reduce_latency);
        assert!(shader.reduce_packet_loss);
        assert_eq!(shader.latency_threshold, 10);
        assert_eq!(shader.bandwidth_envelope_up_kbps, 1024);
        assert!(!shader.multipath);

        let config = InternalConfig::default();
        assert_eq!(config.route_select_threshold, 2);
        assert_eq!(config.route_switch_threshold, 5);
        assert_eq!(config.rtt_veto_default, -10);
        assert_eq!(config.rtt_veto_packet_loss, -30);
        assert_eq!(config.rtt_veto_multipath, -20);
        assert_eq!(config.max_next_rtt, 300);
    }

    #[test]
    fn shader_deserializes_from_partial_json() {
        let shader: RouteShader =
            serde_json::from_str(r#"{"multipath": true, "latency_threshold": 5}"#).unwrap();
        assert!(shader.multipath);
        assert_eq!(shader.latency_threshold, 5);
        // Unspecified fields keep their defaults.
        assert_eq!(shader.selection_percent, 100);
    }

    #[test]
    fn route_state_round_trip() {
        let mut state = RouteState {
            next: true,
            committed: true,
            multipath: true,
            reduce_packet_loss: true,
            latency_worse_counter: 2,
            num_near_relays: 3,
            direct_pl_history: 0b1010_0001,
            direct_pl_count: 17,
            pl_history_index: 5,
            pl_history_samples: 8,
            direct_jitter: 9,
            ..RouteState::default()
        };
        state.near_relay_rtt[0] = 20;
        state.near_relay_rtt[1] = UNROUTABLE_COST;
        state.near_relay_rtt[2] = 35;
        state.near_relay_jitter[2] = 4;
        state.near_relay_pl_count[1] = 600;

        let mut ws = WriteStream::new();
        state.clone().serialize(&mut ws).unwrap();
        let data = ws.finish();

        let mut rs = ReadStream::new(&data);
        let mut decoded = RouteState::default();
        decoded.serialize(&mut rs).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn route_state_rejects_truncated_stream() {
        let mut state = RouteState { num_near_relays: 2, ..RouteState::default() };
        let mut ws = WriteStream::new();
        state.serialize(&mut ws).unwrap();
        let data = ws.finish();

        let mut rs = ReadStream::new(&data[..data.len() - 2]);
        let mut decoded = RouteState::default();
        assert!(decoded.serialize(&mut rs).is_err());
    }
}
