//! Per-slice route decisions.
//!
//! Every session update reframes the session's near relays against the
//! current route matrix, then asks one of two questions: a direct session
//! asks whether to take an accelerated route ([`take_next`]), a session
//! already on next asks whether to stay on it ([`stay_on_next`]). Both
//! mutate the session's [`RouteState`], which rides in the session blob
//! between slices, so exclusions and veto reasons survive reconnects to
//! any backend instance.

use std::collections::HashMap;

use rand::Rng;

use slipstream_core::route::{
    InternalConfig, RouteShader, RouteState, JITTER_THRESHOLD, MAX_COMMIT_COUNT,
    NEAR_RELAY_RTT_HEADROOM, PL_HISTORY_SLOTS, UNROUTABLE_COST, VETO_SLICE_COUNT,
};
use slipstream_core::wire::MAX_NEAR_RELAYS;

use crate::matrix::{route_hash, tri_matrix_index, RouteEntry, COST_BIAS, MAX_RELAYS_PER_ROUTE};

/// Candidate routes considered per selection pass.
pub const MAX_BEST_ROUTES: usize = 1024;

/// Last-slice packet loss (percent) that disqualifies a near relay outright.
const NEAR_RELAY_PACKET_LOSS_LIMIT: i32 = 50;

/// Next RTT this far above the predicted cost counts as a mispredict (ms).
const MISPREDICT_HEADROOM: i32 = 10;

const UNROUTABLE: i32 = UNROUTABLE_COST as i32;

// ── Working set ───────────────────────────────────────────────────────────────

/// Near-relay ping report for one slice. Parallel arrays in the order the
/// relays were handed to the client, whole milliseconds and percent.
#[derive(Debug, Clone, Copy)]
pub struct NearRelayPings<'a> {
    pub ids: &'a [u64],
    pub rtt: &'a [i32],
    pub jitter: &'a [i32],
    pub packet_loss: &'a [i32],
}

/// The session's relays reframed as matrix indices. `source_cost` carries
/// the cost of the client-to-relay leg with every exclusion folded in as
/// [`UNROUTABLE_COST`]; `source_relays` holds -1 for relays that have left
/// the matrix (their cost is always unroutable).
#[derive(Debug, Clone, Default)]
pub struct RelayCandidates {
    pub source_relays: Vec<i32>,
    pub source_cost: Vec<i32>,
    pub source_jitter: Vec<i32>,
    pub dest_relays: Vec<i32>,
}

/// What the SDK measured over the last slice, whole ms and percent.
#[derive(Debug, Clone, Copy, Default)]
pub struct SliceStats {
    pub direct_latency: i32,
    pub next_latency: i32,
    pub predicted_latency: i32,
    pub direct_packet_loss: f32,
    pub next_packet_loss: f32,
}

/// A route chosen for a session. Relays are matrix indices ordered from
/// the client's entry relay to the relay beside the server.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NextRoute {
    pub cost: i32,
    pub num_relays: i32,
    pub relays: [i32; MAX_RELAYS_PER_ROUTE],
}

/// One candidate pulled out of a route entry, still in matrix orientation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestRoute {
    pub cost: i32,
    pub num_relays: i32,
    pub relays: [i32; MAX_RELAYS_PER_ROUTE],
    pub need_to_reverse: bool,
}

// ── Reframing ─────────────────────────────────────────────────────────────────

/// Maps a held route's relay ids onto the current matrix. Fails, flagging
/// the session, when any relay has left the matrix since the route was
/// built.
pub fn reframe_route(
    state: &mut RouteState,
    relay_id_to_index: &HashMap<u64, i32>,
    route_relay_ids: &[u64],
    out_route_relays: &mut [i32; MAX_RELAYS_PER_ROUTE],
) -> bool {
    for (i, id) in route_relay_ids.iter().enumerate() {
        match relay_id_to_index.get(id) {
            Some(&index) => out_route_relays[i] = index,
            None => {
                state.relay_went_away = true;
                return false;
            }
        }
    }
    state.relay_went_away = false;
    true
}

/// Reframes the slice's near-relay pings into route-planning form and runs
/// the exclusion filters. Exclusions are conservative and mostly one-way:
/// the per-relay RTT held in the route state is a running maximum, so a
/// relay that ever looked bad stays priced at its worst.
pub fn reframe_relays(
    state: &mut RouteState,
    relay_id_to_index: &HashMap<u64, i32>,
    slice_number: i32,
    direct_latency: i32,
    direct_jitter: i32,
    direct_packet_loss: i32,
    pings: &NearRelayPings<'_>,
    dest_relay_ids: &[u64],
) -> RelayCandidates {
    let n = pings.ids.len().min(MAX_NEAR_RELAYS);

    let mut out = RelayCandidates {
        source_relays: vec![0; n],
        source_cost: vec![0; n],
        source_jitter: vec![0; n],
        dest_relays: Vec::with_capacity(dest_relay_ids.len()),
    };

    for i in 0..n {
        out.source_relays[i] = relay_id_to_index.get(&pings.ids[i]).copied().unwrap_or(-1);
    }

    if state.num_near_relays == 0 {
        state.num_near_relays = n as u8;
    }

    let direct_jitter = direct_jitter.clamp(0, UNROUTABLE);
    if direct_jitter > i32::from(state.direct_jitter) {
        state.direct_jitter = direct_jitter as u8;
    }

    for i in 0..n {
        // A reported latency of zero is not believable.
        if pings.rtt[i] <= 0 {
            state.near_relay_rtt[i] = UNROUTABLE_COST;
            out.source_cost[i] = UNROUTABLE;
            continue;
        }

        // Heavy packet loss in the last slice disqualifies the relay.
        if pings.packet_loss[i] >= NEAR_RELAY_PACKET_LOSS_LIMIT {
            state.near_relay_rtt[i] = UNROUTABLE_COST;
            out.source_cost[i] = UNROUTABLE;
            continue;
        }

        // A relay slower than the direct path cannot help.
        if state.near_relay_rtt[i] != UNROUTABLE_COST
            && i32::from(state.near_relay_rtt[i])
                > direct_latency + i32::from(NEAR_RELAY_RTT_HEADROOM)
        {
            state.near_relay_rtt[i] = UNROUTABLE_COST;
            out.source_cost[i] = UNROUTABLE;
            continue;
        }

        // A relay that left the matrix cannot be routed through.
        if out.source_relays[i] < 0 {
            state.near_relay_rtt[i] = UNROUTABLE_COST;
            out.source_cost[i] = UNROUTABLE;
            continue;
        }

        let rtt = pings.rtt[i].min(UNROUTABLE) as u8;
        let jitter = pings.jitter[i].clamp(0, UNROUTABLE) as u8;

        if rtt > state.near_relay_rtt[i] {
            state.near_relay_rtt[i] = rtt;
        }
        if jitter > state.near_relay_jitter[i] {
            state.near_relay_jitter[i] = jitter;
        }

        out.source_cost[i] = i32::from(state.near_relay_rtt[i]);
        out.source_jitter[i] = i32::from(state.near_relay_jitter[i]);
    }

    // Relays with more lossy slices than direct are excluded, but only
    // while direct packet loss itself is absent or sporadic.
    if direct_packet_loss > 0 {
        state.direct_pl_count = state.direct_pl_count.saturating_add(1);
    }

    if i32::from(state.direct_pl_count) * 10 <= slice_number {
        for i in 0..n {
            if pings.packet_loss[i] > 0 {
                state.near_relay_pl_count[i] = state.near_relay_pl_count[i].saturating_add(1);
            }
            if state.near_relay_pl_count[i] > state.direct_pl_count {
                out.source_cost[i] = UNROUTABLE;
            }
        }
    }

    // Rolling window of slices where a relay lost more than direct did.
    // A relay lossy in over half the window is excluded until it recovers.
    state.pl_history_samples = (state.pl_history_samples + 1).min(PL_HISTORY_SLOTS as u8);

    let index = state.pl_history_index;
    let samples = state.pl_history_samples;
    let threshold = samples / 2;
    let window = ((1u16 << samples) - 1) as u8;

    if direct_packet_loss > 0 {
        state.direct_pl_history |= 1 << index;
    } else {
        state.direct_pl_history &= !(1 << index);
    }

    for i in 0..n {
        if pings.packet_loss[i] > direct_packet_loss {
            state.near_relay_pl_history[i] |= 1 << index;
        } else {
            state.near_relay_pl_history[i] &= !(1 << index);
        }
        if (state.near_relay_pl_history[i] & window).count_ones() as u8 > threshold {
            out.source_cost[i] = UNROUTABLE;
        }
    }

    state.pl_history_index = (index + 1) % PL_HISTORY_SLOTS as u8;

    // Exclude relays with jitter meaningfully above direct.
    for i in 0..n {
        if i32::from(state.near_relay_jitter[i])
            > i32::from(state.direct_jitter) + i32::from(JITTER_THRESHOLD)
        {
            out.source_cost[i] = UNROUTABLE;
        }
    }

    // Exclude relays with jitter meaningfully above the survivor average.
    let mut count = 0;
    let mut total_jitter = 0.0;
    for i in 0..n {
        if out.source_cost[i] != UNROUTABLE {
            total_jitter += f64::from(out.source_jitter[i]);
            count += 1;
        }
    }
    if count > 0 {
        let average = (total_jitter / f64::from(count)).ceil() as i32;
        for i in 0..n {
            if out.source_cost[i] == UNROUTABLE {
                continue;
            }
            if out.source_jitter[i] > average + i32::from(JITTER_THRESHOLD) {
                out.source_cost[i] = UNROUTABLE;
            }
        }
    }

    // Belt and braces: never let a zero-cost entry leg through.
    for i in 0..n {
        if pings.rtt[i] <= 0 || out.source_cost[i] <= 0 {
            state.near_relay_rtt[i] = UNROUTABLE_COST;
            out.source_cost[i] = UNROUTABLE;
        }
    }

    for id in dest_relay_ids {
        if let Some(&index) = relay_id_to_index.get(id) {
            out.dest_relays.push(index);
        }
    }

    out
}

// ── Route search ──────────────────────────────────────────────────────────────

/// Cheapest total cost over all routable source/dest pairs, including the
/// selection bias. Returns `i32::MAX` when nothing is reachable.
pub fn best_route_cost(
    entries: &[RouteEntry],
    source_relays: &[i32],
    source_cost: &[i32],
    dest_relays: &[i32],
) -> i32 {
    let mut best = i32::MAX;
    for (i, &src) in source_relays.iter().enumerate() {
        if source_cost[i] >= UNROUTABLE {
            continue;
        }
        for &dest in dest_relays {
            if src == dest {
                continue;
            }
            let entry = &entries[tri_matrix_index(src as usize, dest as usize)];
            if entry.num_routes > 0 {
                best = best.min(source_cost[i] + entry.route_cost[0]);
            }
        }
    }
    if best == i32::MAX {
        return best;
    }
    best + COST_BIAS
}

/// True when the route is still present in the matrix, in either
/// orientation.
pub fn route_exists(
    entries: &[RouteEntry],
    route_num_relays: i32,
    mut route_relays: [i32; MAX_RELAYS_PER_ROUTE],
) -> bool {
    if entries.is_empty() {
        return false;
    }
    if route_num_relays <= 0 || route_num_relays > MAX_RELAYS_PER_ROUTE as i32 {
        return false;
    }
    let n = route_num_relays as usize;
    if route_relays[0] < route_relays[n - 1] {
        route_relays[..n].reverse();
    }
    if route_relays[0] == route_relays[n - 1] {
        return false;
    }
    let entry = &entries[tri_matrix_index(route_relays[0] as usize, route_relays[n - 1] as usize)];
    for i in 0..entry.num_routes as usize {
        if entry.route_num_relays[i] == route_num_relays
            && entry.route_relays[i][..n] == route_relays[..n]
        {
            return true;
        }
    }
    false
}

/// Reprices the session's current route against the live matrix. Returns
/// -1 when the route is gone or its entry relay is no longer routable.
pub fn current_route_cost(
    entries: &[RouteEntry],
    route_num_relays: i32,
    mut route_relays: [i32; MAX_RELAYS_PER_ROUTE],
    source_relays: &[i32],
    source_cost: &[i32],
) -> i32 {
    if entries.is_empty() {
        return -1;
    }
    if route_num_relays <= 0 || route_num_relays > MAX_RELAYS_PER_ROUTE as i32 {
        return -1;
    }
    let n = route_num_relays as usize;

    // Cost of the client-to-entry-relay leg. UNROUTABLE when the entry
    // relay is not among the session's near relays any more.
    let mut cost_to_first = 1000;
    for (i, &src) in source_relays.iter().enumerate() {
        if route_relays[0] == src {
            cost_to_first = source_cost[i];
            break;
        }
    }
    if cost_to_first >= UNROUTABLE {
        return -1;
    }

    // Entries are triangular, stored from the higher index down.
    if route_relays[0] < route_relays[n - 1] {
        route_relays[..n].reverse();
    }
    if route_relays[0] == route_relays[n - 1] {
        return -1;
    }

    let wanted = route_hash(&route_relays[..n]);
    let entry = &entries[tri_matrix_index(route_relays[0] as usize, route_relays[n - 1] as usize)];
    for i in 0..entry.num_routes as usize {
        if entry.route_hash[i] != wanted {
            continue;
        }
        if entry.route_num_relays[i] != route_num_relays {
            continue;
        }
        return cost_to_first + entry.route_cost[i] + COST_BIAS;
    }
    -1
}

/// Collects every route within `max_cost`, and counts how many distinct
/// source relays contributed at least one candidate. Caps out at
/// [`MAX_BEST_ROUTES`].
pub fn best_routes(
    entries: &[RouteEntry],
    source_relays: &[i32],
    source_cost: &[i32],
    dest_relays: &[i32],
    max_cost: i32,
) -> (Vec<BestRoute>, i32) {
    let mut routes = Vec::new();
    let mut diversity = 0;
    for (i, &src) in source_relays.iter().enumerate() {
        if source_cost[i] >= UNROUTABLE {
            continue;
        }
        let mut first_route_from_this_relay = true;
        for &dest in dest_relays {
            if src == dest {
                continue;
            }
            let entry = &entries[tri_matrix_index(src as usize, dest as usize)];
            for k in 0..entry.num_routes as usize {
                let cost = entry.route_cost[k] + source_cost[i];
                // Entry routes are sorted by cost.
                if cost > max_cost {
                    break;
                }
                routes.push(BestRoute {
                    cost,
                    num_relays: entry.route_num_relays[k],
                    relays: entry.route_relays[k],
                    need_to_reverse: src < dest,
                });
                if first_route_from_this_relay {
                    diversity += 1;
                    first_route_from_this_relay = false;
                }
                if routes.len() == MAX_BEST_ROUTES {
                    return (routes, diversity);
                }
            }
        }
    }
    (routes, diversity)
}

/// Picks uniformly among all routes within `threshold` of the best one, so
/// concurrent sessions spread over near-equal routes instead of piling onto
/// a single winner. A `max_cost` of -1 means no budget at all.
pub fn random_best_route(
    entries: &[RouteEntry],
    source_relays: &[i32],
    source_cost: &[i32],
    dest_relays: &[i32],
    max_cost: i32,
    threshold: i32,
) -> (Option<NextRoute>, i32) {
    if max_cost == -1 {
        return (None, 0);
    }

    let best_cost = best_route_cost(entries, source_relays, source_cost, dest_relays);
    if best_cost > max_cost {
        return (None, 0);
    }

    let (routes, diversity) =
        best_routes(entries, source_relays, source_cost, dest_relays, best_cost + threshold);
    if routes.is_empty() {
        return (None, diversity);
    }

    let pick = &routes[rand::thread_rng().gen_range(0..routes.len())];
    let n = pick.num_relays as usize;
    let mut relays = [0i32; MAX_RELAYS_PER_ROUTE];
    if pick.need_to_reverse {
        for i in 0..n {
            relays[n - 1 - i] = pick.relays[i];
        }
    } else {
        relays[..n].copy_from_slice(&pick.relays[..n]);
    }

    (Some(NextRoute { cost: pick.cost + COST_BIAS, num_relays: pick.num_relays, relays }), diversity)
}

/// Per-slice maintenance of an existing route: hold it while it stays
/// within the switch threshold of the best, otherwise re-pick. Returns
/// (route changed, route lost); a lost route with no replacement leaves
/// `route` with zero relays.
pub fn best_route_update(
    entries: &[RouteEntry],
    source_relays: &[i32],
    source_cost: &[i32],
    dest_relays: &[i32],
    max_cost: i32,
    select_threshold: i32,
    switch_threshold: i32,
    route: &mut NextRoute,
) -> (bool, bool) {
    let current_cost = current_route_cost(
        entries,
        route.num_relays,
        route.relays,
        source_relays,
        source_cost,
    );

    if current_cost < 0 {
        *route = random_best_route(entries, source_relays, source_cost, dest_relays, max_cost, select_threshold)
            .0
            .unwrap_or_default();
        return (true, true);
    }

    let best_cost = best_route_cost(entries, source_relays, source_cost, dest_relays);

    if current_cost > best_cost + switch_threshold {
        *route = random_best_route(entries, source_relays, source_cost, dest_relays, best_cost, select_threshold)
            .0
            .unwrap_or_default();
        return (true, false);
    }

    route.cost = current_cost;
    (false, false)
}

// ── Decisions ─────────────────────────────────────────────────────────────────

/// Policy gates that take a session out of consideration before any route
/// math runs. Reasons are recorded once and stick for the session.
pub fn early_out_direct(shader: &RouteShader, state: &mut RouteState, user_hash: u64) -> bool {
    if state.veto
        || state.location_veto
        || state.banned
        || state.disabled
        || state.not_selected
        || state.b_side
    {
        return true;
    }

    if shader.disabled {
        state.disabled = true;
        return true;
    }

    if shader.selection_percent == 0 || user_hash % 100 > shader.selection_percent {
        state.not_selected = true;
        return true;
    }

    if shader.ab_test {
        state.ab_test = true;
        if user_hash % 2 == 1 {
            state.b_side = true;
            return true;
        }
        state.a_side = true;
    }

    if shader.banned_users.contains(&user_hash) {
        state.banned = true;
        return true;
    }

    false
}

/// Uncommitted sessions ride the route without billing until it proves
/// itself. Commits on proof, vetoes when the window runs out, and returns
/// false only on that veto.
pub fn try_before_you_buy(
    shader: &RouteShader,
    internal: &InternalConfig,
    state: &mut RouteState,
    direct_latency: i32,
    next_latency: i32,
    direct_packet_loss: f32,
    next_packet_loss: f32,
) -> bool {
    if !shader.try_before_you_buy {
        return true;
    }

    if state.committed {
        return true;
    }

    state.commit_counter += 1;
    if state.commit_counter > MAX_COMMIT_COUNT {
        state.commit_veto = true;
        return false;
    }

    if state.reduce_packet_loss {
        // Chasing packet loss: accept the configured latency trade as
        // long as loss did not get worse.
        if next_latency <= direct_latency - internal.rtt_veto_packet_loss
            && next_packet_loss <= direct_packet_loss
        {
            state.committed = true;
        }
        return true;
    }

    if next_latency <= direct_latency && next_packet_loss <= direct_packet_loss {
        state.committed = true;
    }

    true
}

/// Decides whether a direct session should move onto an accelerated route
/// this slice. Returns the chosen route, or `None` to stay direct.
pub fn take_next(
    entries: &[RouteEntry],
    shader: &RouteShader,
    internal: &InternalConfig,
    state: &mut RouteState,
    multipath_veto: &HashMap<u64, bool>,
    user_hash: u64,
    stats: SliceStats,
    candidates: &mut RelayCandidates,
) -> Option<NextRoute> {
    if early_out_direct(shader, state, user_hash) {
        return None;
    }

    let direct_latency = stats.direct_latency;
    let mut max_cost = direct_latency;

    for cost in candidates.source_cost.iter_mut() {
        if *cost <= 0 {
            *cost = UNROUTABLE;
        }
    }

    let mut reduce_latency = false;
    if shader.reduce_latency {
        if direct_latency > shader.acceptable_latency {
            max_cost = direct_latency - (shader.latency_threshold + internal.route_select_threshold);
            reduce_latency = true;
        } else {
            max_cost = -1;
        }
    }

    let mut reduce_packet_loss = false;
    if shader.reduce_packet_loss && stats.direct_packet_loss > shader.acceptable_packet_loss {
        max_cost = direct_latency + internal.max_latency_trade_off - internal.route_select_threshold;
        reduce_packet_loss = true;
    }

    state.multipath_restricted = multipath_veto.get(&user_hash).copied().unwrap_or(false);

    let mut pro_mode = false;
    if shader.pro_mode && !state.multipath_restricted {
        max_cost = direct_latency + internal.max_latency_trade_off - internal.route_select_threshold;
        pro_mode = true;
        reduce_latency = false;
        reduce_packet_loss = false;
    }

    if shader.force_next {
        max_cost = i32::MAX;
        state.forced_next = true;
    }

    let (route, diversity) = random_best_route(
        entries,
        &candidates.source_relays,
        &candidates.source_cost,
        &candidates.dest_relays,
        max_cost,
        internal.route_select_threshold,
    );

    if diversity < internal.route_diversity {
        state.lack_of_diversity = true;
        return None;
    }

    let route = route?;

    if route.cost > internal.max_next_rtt {
        return None;
    }

    let mut multipath = (pro_mode || shader.multipath) && !state.multipath_restricted;
    if internal.multipath_threshold > 0 && direct_latency - route.cost > internal.multipath_threshold {
        // The win is big enough on its own; double bandwidth buys nothing.
        multipath = false;
    }

    state.next = true;
    state.reduce_latency = reduce_latency;
    state.reduce_packet_loss = reduce_packet_loss;
    state.pro_mode = pro_mode;
    state.multipath = multipath;

    state.committed = !internal.uncommitted && (!shader.try_before_you_buy || state.multipath);

    Some(route)
}

/// Decides whether a session already on next should stay there. Returns
/// the (possibly re-picked) route and whether it changed; `None` means the
/// session is vetoed back to direct for good.
pub fn stay_on_next(
    entries: &[RouteEntry],
    shader: &RouteShader,
    internal: &InternalConfig,
    state: &mut RouteState,
    user_hash: u64,
    stats: SliceStats,
    current_route: NextRoute,
    candidates: &mut RelayCandidates,
) -> (Option<NextRoute>, bool) {
    let (route, switched) = stay_on_next_inner(
        entries,
        shader,
        internal,
        state,
        user_hash,
        stats,
        current_route,
        candidates,
    );

    if state.next && route.is_none() {
        state.next = false;
        state.veto = true;
    }

    (route, switched)
}

fn stay_on_next_inner(
    entries: &[RouteEntry],
    shader: &RouteShader,
    internal: &InternalConfig,
    state: &mut RouteState,
    user_hash: u64,
    stats: SliceStats,
    current_route: NextRoute,
    candidates: &mut RelayCandidates,
) -> (Option<NextRoute>, bool) {
    if early_out_direct(shader, state, user_hash) {
        return (None, false);
    }

    for cost in candidates.source_cost.iter_mut() {
        if *cost <= 0 {
            *cost = UNROUTABLE;
        }
    }

    let direct_latency = stats.direct_latency;
    let next_latency = stats.next_latency;

    // Leave when next keeps measuring well above what the route promised.
    if stats.predicted_latency > 0 && next_latency >= stats.predicted_latency + MISPREDICT_HEADROOM
    {
        state.mispredict_counter += 1;
        if state.mispredict_counter == VETO_SLICE_COUNT {
            state.mispredict = true;
            return (None, false);
        }
    } else {
        state.mispredict_counter = 0;
    }

    // Multipath doubles the client's send rate. Back off when the link
    // looks saturated.
    if state.multipath && direct_latency >= internal.multipath_overload_threshold {
        state.multipath_overload = true;
        return (None, false);
    }

    let mut max_cost = i32::MAX;

    if !shader.force_next {
        let mut rtt_veto = internal.rtt_veto_default;
        if state.reduce_packet_loss {
            rtt_veto = internal.rtt_veto_packet_loss;
        }
        if state.multipath {
            rtt_veto = internal.rtt_veto_multipath;
        }

        // Only committed sessions abort on a latency regression. An
        // uncommitted session keeps measuring so try-before-you-buy can
        // judge the route instead.
        if state.committed {
            if !state.multipath {
                if next_latency > direct_latency - rtt_veto {
                    state.latency_worse = true;
                    return (None, false);
                }
            } else if next_latency > direct_latency - rtt_veto {
                state.latency_worse_counter += 1;
                if state.latency_worse_counter == VETO_SLICE_COUNT {
                    state.latency_worse = true;
                    return (None, false);
                }
            } else {
                state.latency_worse_counter = 0;
            }
        }

        max_cost = direct_latency - rtt_veto;
    }

    let mut route = current_route;
    let (route_switched, route_lost) = best_route_update(
        entries,
        &candidates.source_relays,
        &candidates.source_cost,
        &candidates.dest_relays,
        max_cost,
        internal.route_select_threshold,
        internal.route_switch_threshold,
        &mut route,
    );

    state.route_lost = route_lost;

    if route.num_relays == 0 {
        state.no_route = true;
        return (None, false);
    }

    if route.cost > internal.max_next_rtt {
        state.next_latency_too_high = true;
        return (None, false);
    }

    if !try_before_you_buy(
        shader,
        internal,
        state,
        direct_latency,
        next_latency,
        stats.direct_packet_loss,
        stats.next_packet_loss,
    ) {
        return (None, false);
    }

    (Some(route), route_switched)
}
