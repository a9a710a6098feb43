//! IP-to-location seam.
//!
//! Session decisions need the client's rough position to rank near
//! relays. The real geo database is an external concern; the handler
//! only sees the `IpLocator` trait.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("no location data for {0}")]
    NotFound(IpAddr),
    #[error("location database unavailable")]
    Unavailable,
}

/// A lat/long on Earth with lookup metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub continent: String,
    pub country: String,
    pub country_code: String,
    pub region: String,
    pub city: String,
    pub latitude: f32,
    pub longitude: f32,
    pub isp: String,
    pub asn: u32,
}

impl Location {
    /// True for (0, 0), the "we have no idea" location.
    pub fn is_zero(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }
}

pub trait IpLocator: Send + Sync {
    fn locate(&self, ip: IpAddr) -> Result<Location, LocateError>;
}

/// Locator used when no geo database is configured. Everyone lives at
/// (0, 0) in the Gulf of Guinea.
#[derive(Debug, Default)]
pub struct NullIsland;

impl IpLocator for NullIsland {
    fn locate(&self, _ip: IpAddr) -> Result<Location, LocateError> {
        Ok(Location::default())
    }
}
