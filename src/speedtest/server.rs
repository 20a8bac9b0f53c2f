//! Candidate servers and their probe URLs.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::error::ProbeError;
use super::geo::Coordinates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u32);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A speed test server. `url` is the upload endpoint; download images and
/// the latency file live next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub sponsor: String,
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(flatten)]
    pub coordinates: Coordinates,
    pub url: String,
}

impl Server {
    /// Resolves `path` against the server URL. An unparseable URL is
    /// returned unchanged so the transfer using it fails on its own.
    pub fn relative_url(&self, path: &str) -> String {
        match Url::parse(&self.url).and_then(|base| base.join(path)) {
            Ok(url) => url.into(),
            Err(e) => {
                debug!(server = %self.id, url = %self.url, "cannot resolve {}: {}", path, e);
                self.url.clone()
            }
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) [{}]", self.sponsor, self.name, self.id)
    }
}

pub fn parse_servers(json: &str) -> Result<Vec<Server>, serde_json::Error> {
    serde_json::from_str(json)
}

pub fn load_servers(path: &Path) -> Result<Vec<Server>, ProbeError> {
    let to_err = |message: String| ProbeError::ServerList {
        path: path.display().to_string(),
        message,
    };
    let content = std::fs::read_to_string(path).map_err(|e| to_err(e.to_string()))?;
    let servers = parse_servers(&content).map_err(|e| to_err(e.to_string()))?;
    if servers.is_empty() {
        return Err(to_err("list is empty".to_string()));
    }
    Ok(servers)
}

#[cfg(test)]
pub(crate) fn test_server(id: u32, lat: f64, lon: f64) -> Server {
    Server {
        id: ServerId(id),
        sponsor: format!("Sponsor {id}"),
        name: format!("City {id}"),
        country: String::new(),
        coordinates: Coordinates::new(lat, lon),
        url: format!("http://server{id}.example:8080/speedtest/upload.php"),
    }
}
