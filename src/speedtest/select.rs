//! Picks the server to probe: either the one the caller named, or the
//! lowest-latency server among the geographically closest few.

use std::time::Duration;

use tracing::{debug, info};

use super::error::ProbeError;
use super::geo::{Coordinates, Kilometers};
use super::ping::{LatencyProbe, LatencyResult};
use super::scope::Scope;
use super::server::{Server, ServerId};

pub const DEFAULT_MAX_CLOSE_SERVERS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Explicit(ServerId),
    /// Latency-probe only the `max_close` nearest candidates.
    Closest { max_close: usize },
}

impl Default for SelectionMode {
    fn default() -> Self {
        SelectionMode::Closest {
            max_close: DEFAULT_MAX_CLOSE_SERVERS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub server: Server,
    /// Mean round-trip time
    pub latency: Duration,
    pub jitter: Duration,
    pub distance: Kilometers,
}

impl Selection {
    fn new(server: Server, distance: Kilometers, result: &LatencyResult) -> Result<Self, ProbeError> {
        Ok(Self {
            server,
            latency: result.average()?,
            jitter: result.jitter().unwrap_or_default(),
            distance,
        })
    }
}

pub async fn select_server(
    servers: &[Server],
    origin: Coordinates,
    mode: SelectionMode,
    prober: &dyn LatencyProbe,
    scope: &Scope,
) -> Result<Selection, ProbeError> {
    if servers.is_empty() {
        return Err(ProbeError::NoServers);
    }

    let selection = match mode {
        SelectionMode::Explicit(id) => {
            let server = servers
                .iter()
                .find(|s| s.id == id)
                .ok_or(ProbeError::ServerNotFound { id })?;
            let result = prober.measure(server, scope).await?;
            Selection::new(
                server.clone(),
                origin.distance_to(&server.coordinates),
                &result,
            )?
        }
        SelectionMode::Closest { max_close } => {
            if max_close == 0 {
                return Err(ProbeError::InvalidSetting {
                    name: "closest server count",
                    value: max_close,
                });
            }
            let mut closest = sort_by_distance(servers, origin);
            closest.truncate(max_close);

            stable_sort_by_latency(closest, prober, scope)
                .await?
                .into_iter()
                .next()
                .ok_or(ProbeError::NoServers)?
        }
    };

    info!(
        server = %selection.server,
        distance = %selection.distance,
        latency_ms = selection.latency.as_secs_f64() * 1000.0,
        "selected server"
    );
    Ok(selection)
}

/// Every candidate with its distance from `origin`, nearest first. Equal
/// distances keep list order.
pub fn sort_by_distance(servers: &[Server], origin: Coordinates) -> Vec<(Server, Kilometers)> {
    let mut by_distance: Vec<_> = servers
        .iter()
        .map(|s| (s.clone(), origin.distance_to(&s.coordinates)))
        .collect();
    by_distance.sort_by(|a, b| a.1 .0.total_cmp(&b.1 .0));
    by_distance
}

/// Measures each candidate in turn and orders them by mean latency. The
/// sort is stable, so ties stay in their incoming (distance) order.
pub async fn stable_sort_by_latency(
    candidates: Vec<(Server, Kilometers)>,
    prober: &dyn LatencyProbe,
    scope: &Scope,
) -> Result<Vec<Selection>, ProbeError> {
    let mut measured = Vec::with_capacity(candidates.len());
    for (server, distance) in candidates {
        let result = prober.measure(&server, scope).await?;
        let candidate = Selection::new(server, distance, &result)?;
        debug!(
            server = %candidate.server.id,
            %distance,
            latency = ?candidate.latency,
            "candidate latency"
        );
        measured.push(candidate);
    }
    measured.sort_by_key(|c| c.latency);
    Ok(measured)
}
