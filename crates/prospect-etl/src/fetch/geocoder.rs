//! Address geocoding: OpenCage when a key is configured, Nominatim
//! otherwise or when OpenCage has no answer.

use reqwest::Client;
use serde::Deserialize;

use prospect_core::model::Coordinates;

use crate::enrich::resilience::RateLimiter;
use crate::enrich::sources::GEOCODER;
use crate::error::{EnrichError, EnrichResult};
use crate::fetch::http::check_status;

pub const OPENCAGE_URL: &str = "https://api.opencagedata.com/geocode/v1/json";
pub const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org/search";

/// Nominatim's usage policy allows one request per second.
const NOMINATIM_RATE: f64 = 1.0;

/// Addresses shorter than this are too vague to resolve.
const MIN_ADDRESS_CHARS: usize = 10;

#[derive(Debug, Deserialize)]
struct OpenCageResponse {
    #[serde(default)]
    results: Vec<OpenCageResult>,
}

#[derive(Debug, Deserialize)]
struct OpenCageResult {
    geometry: OpenCageGeometry,
    #[serde(default)]
    formatted: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenCageGeometry {
    lat: f64,
    lng: f64,
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug)]
pub struct Geocoder {
    client: Client,
    opencage_key: Option<String>,
    opencage_url: String,
    nominatim_url: String,
    nominatim_limiter: RateLimiter,
}

impl Geocoder {
    pub fn new(client: Client, opencage_key: Option<String>) -> Self {
        Self {
            client,
            opencage_key: opencage_key.filter(|k| !k.trim().is_empty()),
            opencage_url: OPENCAGE_URL.to_string(),
            nominatim_url: NOMINATIM_URL.to_string(),
            nominatim_limiter: RateLimiter::with_burst(NOMINATIM_RATE, 1),
        }
    }

    pub fn with_endpoints(
        mut self,
        opencage_url: impl Into<String>,
        nominatim_url: impl Into<String>,
    ) -> Self {
        self.opencage_url = opencage_url.into();
        self.nominatim_url = nominatim_url.into();
        self
    }

    pub fn has_opencage(&self) -> bool {
        self.opencage_key.is_some()
    }

    pub async fn geocode(&self, address: &str) -> EnrichResult<Option<Coordinates>> {
        let address = address.trim();
        if address.chars().count() < MIN_ADDRESS_CHARS {
            return Ok(None);
        }

        if let Some(key) = &self.opencage_key {
            match self.opencage(address, key).await {
                Ok(Some(coordinates)) => return Ok(Some(coordinates)),
                Ok(None) => log::debug!("OpenCage has no match for '{address}'"),
                Err(err) => log::warn!("OpenCage geocoding failed for '{address}': {err}"),
            }
        }

        self.nominatim(address).await
    }

    async fn opencage(&self, address: &str, key: &str) -> EnrichResult<Option<Coordinates>> {
        let response = self
            .client
            .get(&self.opencage_url)
            .query(&[
                ("q", address),
                ("key", key),
                ("limit", "1"),
                ("countrycode", "gb"),
                ("language", "en"),
            ])
            .send()
            .await?;
        let body = check_status(GEOCODER, response)?.text().await?;
        parse_opencage(&body)
    }

    async fn nominatim(&self, address: &str) -> EnrichResult<Option<Coordinates>> {
        self.nominatim_limiter.acquire().await;
        let response = self
            .client
            .get(&self.nominatim_url)
            .query(&[
                ("q", address),
                ("format", "json"),
                ("limit", "1"),
                ("countrycodes", "gb"),
            ])
            .send()
            .await?;
        let body = check_status(GEOCODER, response)?.text().await?;
        parse_nominatim(&body)
    }
}

fn parse_opencage(body: &str) -> EnrichResult<Option<Coordinates>> {
    let response: OpenCageResponse =
        serde_json::from_str(body).map_err(|e| EnrichError::parse(GEOCODER, e))?;
    Ok(response.results.into_iter().next().map(|r| Coordinates {
        lat: r.geometry.lat,
        lng: r.geometry.lng,
        label: r.formatted,
    }))
}

fn parse_nominatim(body: &str) -> EnrichResult<Option<Coordinates>> {
    let places: Vec<NominatimPlace> =
        serde_json::from_str(body).map_err(|e| EnrichError::parse(GEOCODER, e))?;
    let Some(place) = places.into_iter().next() else {
        return Ok(None);
    };
    let lat = place
        .lat
        .parse::<f64>()
        .map_err(|e| EnrichError::parse(GEOCODER, format!("latitude {:?}: {e}", place.lat)))?;
    let lng = place
        .lon
        .parse::<f64>()
        .map_err(|e| EnrichError::parse(GEOCODER, format!("longitude {:?}: {e}", place.lon)))?;
    Ok(Some(Coordinates {
        lat,
        lng,
        label: place.display_name,
    }))
}
