//! Static service dependency graph (spec §4.6.1). `migration_engine` is
//! declared but excluded from the canonical startup set — it depends on
//! `store` but is invoked on demand, not kept running.

pub const STORE: &str = "store";
pub const TELEMETRY_FEED: &str = "telemetry_feed";
pub const INGEST_WORKER: &str = "ingest_worker";
pub const MIGRATION_ENGINE: &str = "migration_engine";
pub const BRIDGE: &str = "bridge";
pub const DASHBOARD_API: &str = "dashboard_api";

/// `(service, dependencies)` for every service the orchestrator
/// lifecycles continuously. `migration_engine` is omitted here — it is
/// started on demand by the CLI, never as part of the always-on set.
pub const EDGES: &[(&str, &[&str])] = &[
    (STORE, &[]),
    (TELEMETRY_FEED, &[STORE]),
    (INGEST_WORKER, &[STORE, TELEMETRY_FEED]),
    (BRIDGE, &[STORE, TELEMETRY_FEED]),
    (DASHBOARD_API, &[BRIDGE]),
];

/// Kahn's algorithm over the static edge list. Panics on a cycle — the
/// graph is a build-time constant, so a cycle is a programming error, not
/// a runtime condition to recover from.
pub fn topological_order() -> Vec<&'static str> {
    let mut in_degree: std::collections::HashMap<&str, usize> =
        EDGES.iter().map(|(name, deps)| (*name, deps.len())).collect();

    let mut ready: std::collections::VecDeque<&str> =
        in_degree.iter().filter(|(_, d)| **d == 0).map(|(name, _)| *name).collect();
    let mut order = Vec::new();

    while let Some(name) = ready.pop_front() {
        order.push(name);
        for (dependent, deps) in EDGES {
            if deps.contains(&name) {
                if let Some(count) = in_degree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }
    }

    assert_eq!(order.len(), EDGES.len(), "service dependency graph has a cycle");
    order
}

pub fn reverse_topological_order() -> Vec<&'static str> {
    let mut order = topological_order();
    order.reverse();
    order
}
