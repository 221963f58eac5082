//! Region lookup for candidates that arrive without one, using an MMDB file

use crate::Result;
use maxminddb::{geoip2, Reader};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// What the MMDB knows about one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoLocation {
    pub country_code: Option<String>,
    /// English name, preferred over the code in region labels
    pub country_name: Option<String>,
    pub city_name: Option<String>,
}

impl GeoLocation {
    pub fn is_empty(&self) -> bool {
        self.country_code.is_none() && self.country_name.is_none() && self.city_name.is_none()
    }

    /// Free-text region stored on a record, or `None` when nothing is known
    pub fn region(&self) -> Option<String> {
        let country = self.country_name.as_ref().or(self.country_code.as_ref());
        match (&self.city_name, country) {
            (Some(city), Some(country)) => Some(format!("{}, {}", city, country)),
            (Some(city), None) => Some(city.clone()),
            (None, Some(country)) => Some(country.clone()),
            (None, None) => None,
        }
    }
}

/// Shared handle to a GeoLite2/GeoIP2 city database
#[derive(Clone)]
pub struct GeoLocator {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoLocator {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            reader: Arc::new(Reader::open_readfile(path)?),
        })
    }

    /// Region label for an address; hostnames and unknown addresses yield `None`.
    pub fn region_for(&self, address: &str) -> Option<String> {
        let ip: IpAddr = address.parse().ok()?;
        self.lookup_ip(ip).ok()?.region()
    }

    /// Addresses absent from the database yield an empty location, not an error.
    pub fn lookup_ip(&self, ip: IpAddr) -> Result<GeoLocation> {
        let found = self.reader.lookup(ip)?;
        let Some(city) = found.decode::<geoip2::City>()? else {
            return Ok(GeoLocation::default());
        };

        Ok(GeoLocation {
            country_code: city.country.iso_code.map(String::from),
            country_name: city.country.names.english.map(String::from),
            city_name: city.city.names.english.map(String::from),
        })
    }
}
