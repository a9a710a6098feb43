//! Daemon counters.
//!
//! One atomic per thing worth counting, bumped inline with relaxed
//! ordering and read by the status endpoint. No registry, no metrics
//! framework: a counter that needs explaining gets a field doc instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use slipstream_core::packets4::{
    FALLBACK_FLAG_BAD_CONTINUE_TOKEN, FALLBACK_FLAG_BAD_ROUTE_TOKEN, FALLBACK_FLAG_CLIENT_TIMED_OUT,
    FALLBACK_FLAG_CONTINUE_REQUEST_TIMED_OUT, FALLBACK_FLAG_DIRECT_PONG_TIMED_OUT,
    FALLBACK_FLAG_NEXT_PONG_TIMED_OUT, FALLBACK_FLAG_NO_NEXT_ROUTE_TO_CONTINUE,
    FALLBACK_FLAG_PREVIOUS_UPDATE_STILL_PENDING, FALLBACK_FLAG_ROUTE_EXPIRED,
    FALLBACK_FLAG_ROUTE_REQUEST_TIMED_OUT, FALLBACK_FLAG_ROUTE_UPDATE_TIMED_OUT,
    FALLBACK_FLAG_UPGRADE_RESPONSE_TIMED_OUT,
};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Every counter the daemon keeps. Grouped the way the packet path
/// encounters them; the snapshot flattens to name -> value for JSON.
#[derive(Debug, Default)]
pub struct Metrics {
    // Datagram plumbing.
    pub packets_received: Counter,
    pub packets_too_small: Counter,
    pub packets_unknown_type: Counter,
    pub bad_packet_filter: Counter,
    pub read_packet_failure: Counter,
    pub signature_check_failed: Counter,
    pub write_response_failure: Counter,

    // Handler invocations.
    pub server_init_packets: Counter,
    pub server_update_packets: Counter,
    pub session_update_packets: Counter,

    // Session pipeline drops (no response sent).
    pub buyer_not_found: Counter,
    pub buyer_not_live: Counter,
    pub sdk_too_old: Counter,
    pub stale_route_matrix: Counter,
    pub read_session_data_failure: Counter,
    pub bad_session_id: Counter,
    pub bad_slice_number: Counter,
    pub client_locate_failure: Counter,

    // Direct-response aborts.
    pub datacenter_not_found: Counter,
    pub no_relays_in_datacenter: Counter,
    pub near_relay_locate_failure: Counter,
    pub client_ping_timed_out: Counter,

    // Client-reported fallback to direct, by reason.
    pub fallback_to_direct: Counter,
    pub fallback_bad_route_token: Counter,
    pub fallback_no_next_route_to_continue: Counter,
    pub fallback_previous_update_still_pending: Counter,
    pub fallback_bad_continue_token: Counter,
    pub fallback_route_expired: Counter,
    pub fallback_route_request_timed_out: Counter,
    pub fallback_continue_request_timed_out: Counter,
    pub fallback_client_timed_out: Counter,
    pub fallback_upgrade_response_timed_out: Counter,
    pub fallback_route_update_timed_out: Counter,
    pub fallback_direct_pong_timed_out: Counter,
    pub fallback_next_pong_timed_out: Counter,
    pub fallback_unknown_reason: Counter,

    // Decision outcomes.
    pub next_slices: Counter,
    pub direct_slices: Counter,
    pub route_switched: Counter,
    pub token_build_failure: Counter,
    pub route_does_not_exist: Counter,
    pub next_without_route_relays: Counter,
    pub sdk_aborted: Counter,
    pub no_route_veto: Counter,
    pub multipath_overload_veto: Counter,
    pub mispredict_veto: Counter,
    pub latency_worse_veto: Counter,

    // Post-session pipeline.
    pub billing_buffer_full: Counter,
    pub portal_buffer_full: Counter,
    pub billing_entries_sent: Counter,
    pub billing_failure: Counter,
    pub portal_entries_sent: Counter,
    pub portal_retries: Counter,
    pub portal_failure: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count each reason bit a falling-back client reported. A fallback
    /// with no recognized bits still counts, as unknown.
    pub fn record_fallback_flags(&self, flags: u64) {
        self.fallback_to_direct.inc();

        let reasons = [
            (FALLBACK_FLAG_BAD_ROUTE_TOKEN, &self.fallback_bad_route_token),
            (FALLBACK_FLAG_NO_NEXT_ROUTE_TO_CONTINUE, &self.fallback_no_next_route_to_continue),
            (
                FALLBACK_FLAG_PREVIOUS_UPDATE_STILL_PENDING,
                &self.fallback_previous_update_still_pending,
            ),
            (FALLBACK_FLAG_BAD_CONTINUE_TOKEN, &self.fallback_bad_continue_token),
            (FALLBACK_FLAG_ROUTE_EXPIRED, &self.fallback_route_expired),
            (FALLBACK_FLAG_ROUTE_REQUEST_TIMED_OUT, &self.fallback_route_request_timed_out),
            (FALLBACK_FLAG_CONTINUE_REQUEST_TIMED_OUT, &self.fallback_continue_request_timed_out),
            (FALLBACK_FLAG_CLIENT_TIMED_OUT, &self.fallback_client_timed_out),
            (FALLBACK_FLAG_UPGRADE_RESPONSE_TIMED_OUT, &self.fallback_upgrade_response_timed_out),
            (FALLBACK_FLAG_ROUTE_UPDATE_TIMED_OUT, &self.fallback_route_update_timed_out),
            (FALLBACK_FLAG_DIRECT_PONG_TIMED_OUT, &self.fallback_direct_pong_timed_out),
            (FALLBACK_FLAG_NEXT_PONG_TIMED_OUT, &self.fallback_next_pong_timed_out),
        ];

        let mut reported = false;
        for (bit, counter) in reasons {
            if flags & bit != 0 {
                counter.inc();
                reported = true;
            }
        }
        if !reported {
            self.fallback_unknown_reason.inc();
        }
    }

    /// Name -> value for the status endpoint. Sorted keys keep the JSON
    /// diffable between scrapes.
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        let entries = [
            ("packets_received", &self.packets_received),
            ("packets_too_small", &self.packets_too_small),
            ("packets_unknown_type", &self.packets_unknown_type),
            ("bad_packet_filter", &self.bad_packet_filter),
            ("read_packet_failure", &self.read_packet_failure),
            ("signature_check_failed", &self.signature_check_failed),
            ("write_response_failure", &self.write_response_failure),
            ("server_init_packets", &self.server_init_packets),
            ("server_update_packets", &self.server_update_packets),
            ("session_update_packets", &self.session_update_packets),
            ("buyer_not_found", &self.buyer_not_found),
            ("buyer_not_live", &self.buyer_not_live),
            ("sdk_too_old", &self.sdk_too_old),
            ("stale_route_matrix", &self.stale_route_matrix),
            ("read_session_data_failure", &self.read_session_data_failure),
            ("bad_session_id", &self.bad_session_id),
            ("bad_slice_number", &self.bad_slice_number),
            ("client_locate_failure", &self.client_locate_failure),
            ("datacenter_not_found", &self.datacenter_not_found),
            ("no_relays_in_datacenter", &self.no_relays_in_datacenter),
            ("near_relay_locate_failure", &self.near_relay_locate_failure),
            ("client_ping_timed_out", &self.client_ping_timed_out),
            ("fallback_to_direct", &self.fallback_to_direct),
            ("fallback_bad_route_token", &self.fallback_bad_route_token),
            ("fallback_no_next_route_to_continue", &self.fallback_no_next_route_to_continue),
            (
                "fallback_previous_update_still_pending",
                &self.fallback_previous_update_still_pending,
            ),
            ("fallback_bad_continue_token", &self.fallback_bad_continue_token),
            ("fallback_route_expired", &self.fallback_route_expired),
            ("fallback_route_request_timed_out", &self.fallback_route_request_timed_out),
            ("fallback_continue_request_timed_out", &self.fallback_continue_request_timed_out),
            ("fallback_client_timed_out", &self.fallback_client_timed_out),
            ("fallback_upgrade_response_timed_out", &self.fallback_upgrade_response_timed_out),
            ("fallback_route_update_timed_out", &self.fallback_route_update_timed_out),
            ("fallback_direct_pong_timed_out", &self.fallback_direct_pong_timed_out),
            ("fallback_next_pong_timed_out", &self.fallback_next_pong_timed_out),
            ("fallback_unknown_reason", &self.fallback_unknown_reason),
            ("next_slices", &self.next_slices),
            ("direct_slices", &self.direct_slices),
            ("route_switched", &self.route_switched),
            ("token_build_failure", &self.token_build_failure),
            ("route_does_not_exist", &self.route_does_not_exist),
            ("next_without_route_relays", &self.next_without_route_relays),
            ("sdk_aborted", &self.sdk_aborted),
            ("no_route_veto", &self.no_route_veto),
            ("multipath_overload_veto", &self.multipath_overload_veto),
            ("mispredict_veto", &self.mispredict_veto),
            ("latency_worse_veto", &self.latency_worse_veto),
            ("billing_buffer_full", &self.billing_buffer_full),
            ("portal_buffer_full", &self.portal_buffer_full),
            ("billing_entries_sent", &self.billing_entries_sent),
            ("billing_failure", &self.billing_failure),
            ("portal_entries_sent", &self.portal_entries_sent),
            ("portal_retries", &self.portal_retries),
            ("portal_failure", &self.portal_failure),
        ];
        entries.iter().map(|(name, counter)| (*name, counter.get())).collect()
    }
}
