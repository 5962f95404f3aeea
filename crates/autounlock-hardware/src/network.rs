//! Parsers for `ip -j` and `arping` output.

use autounlock_core::error::AutoUnlockResult;
use autounlock_provider::hardware::DefaultRoute;
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

const UNUSABLE_NEIGH_STATES: &[&str] = &["FAILED", "INCOMPLETE", "NOARP"];

#[derive(Debug, Deserialize)]
struct RouteEntry {
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    dev: Option<String>,
    #[serde(default)]
    metric: Option<u32>,
}

/// Default routes with a gateway, lowest metric first.
pub(crate) fn parse_routes(json: &str) -> AutoUnlockResult<Vec<DefaultRoute>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<RouteEntry> = serde_json::from_str(json)?;
    let mut routes: Vec<(u32, DefaultRoute)> = entries
        .into_iter()
        .filter_map(|entry| {
            let gateway = entry.gateway.filter(|g| !g.is_empty())?;
            let interface = entry.dev.filter(|d| !d.is_empty())?;
            Some((entry.metric.unwrap_or(0), DefaultRoute { gateway, interface }))
        })
        .collect();
    routes.sort_by_key(|(metric, _)| *metric);
    Ok(routes.into_iter().map(|(_, route)| route).collect())
}

#[derive(Debug, Deserialize)]
struct NeighEntry {
    #[serde(default)]
    lladdr: Option<String>,
    #[serde(default)]
    state: Vec<String>,
}

/// Link-layer address of the first usable neighbour entry.
pub(crate) fn parse_neighbour(json: &str) -> AutoUnlockResult<Option<String>> {
    if json.trim().is_empty() {
        return Ok(None);
    }
    let entries: Vec<NeighEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .filter(|entry| {
            !entry
                .state
                .iter()
                .any(|state| UNUSABLE_NEIGH_STATES.contains(&state.as_str()))
        })
        .filter_map(|entry| entry.lladdr)
        .find_map(|mac| normalize_mac(&mac)))
}

fn mac_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\b([0-9a-f]{2}(?::[0-9a-f]{2}){5})\b").ok())
        .as_ref()
}

/// MAC from an `arping` reply line (`Unicast reply from 10.0.0.1 [AA:BB:...]`).
pub(crate) fn parse_arping_reply(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| line.to_ascii_lowercase().contains("reply from"))
        .find_map(|line| mac_pattern()?.captures(line))
        .and_then(|caps| normalize_mac(&caps[1]))
}

/// Lowercase colon-separated MAC; rejects the all-zero address.
pub(crate) fn normalize_mac(raw: &str) -> Option<String> {
    let mac = raw.trim().to_ascii_lowercase();
    if !mac_pattern()?.is_match(&mac) || mac.len() != 17 || mac == "00:00:00:00:00:00" {
        return None;
    }
    Some(mac)
}
