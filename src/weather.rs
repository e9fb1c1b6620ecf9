//! Weather lookups against the National Weather Service API.
//!
//! Two-step lookup: resolve the nearest observation station for a
//! latitude/longitude, then fetch that station's latest observation.
//! The NWS API only covers U.S. locations, so callers gate lookups on the
//! location's country code before calling in.

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::retry::{self, CallError, RetryPolicy};

/// Current conditions at a station, in the units the platform expects
/// (degrees Fahrenheit, percent relative humidity).
#[derive(Debug, Clone, PartialEq)]
pub struct Conditions {
    pub temperature: f64,
    pub humidity: f64,
}

#[derive(Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct Feature {
    id: String,
}

#[derive(Deserialize)]
struct Observation {
    properties: ObservationProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservationProperties {
    temperature: Measurement,
    relative_humidity: Measurement,
}

#[derive(Deserialize)]
struct Measurement {
    value: Option<f64>,
}

/// NWS observations report temperature in Celsius; sensor readings are
/// stored in Fahrenheit, rounded to two decimal places.
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    (celsius * 9.0 / 5.0 * 100.0 + 3200.0).round() / 100.0
}

pub struct Weather {
    base_url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl Weather {
    pub fn new(base_url: String, http: reqwest::Client, retry: RetryPolicy) -> Self {
        Weather {
            base_url,
            http,
            retry,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, CallError> {
        retry::call(&self.retry, || async {
            let response = self
                .http
                .get(url)
                .header("Accept", "application/geo+json")
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(CallError::from_response(response).await);
            }
            Ok(response.json::<T>().await?)
        })
        .await
    }

    /// Resolve the observation station nearest a point. The stations
    /// endpoint returns features ordered by distance.
    async fn nearest_station(&self, latitude: f64, longitude: f64) -> anyhow::Result<String> {
        let url = format!(
            "{}/points/{:.4},{:.4}/stations",
            self.base_url.trim_end_matches('/'),
            latitude,
            longitude
        );
        let stations: FeatureCollection = self
            .get_json(&url)
            .await
            .context("station lookup failed")?;
        stations
            .features
            .into_iter()
            .next()
            .map(|feature| feature.id)
            .ok_or_else(|| anyhow!("no observation stations near {latitude},{longitude}"))
    }

    /// Fetch current conditions for a point.
    pub async fn current_conditions(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> anyhow::Result<Conditions> {
        let station = self.nearest_station(latitude, longitude).await?;
        let url = format!("{}/observations/latest", station);
        let observation: Observation = self
            .get_json(&url)
            .await
            .context("observation lookup failed")?;
        let celsius = observation
            .properties
            .temperature
            .value
            .ok_or_else(|| anyhow!("station reported no temperature"))?;
        let humidity = observation
            .properties
            .relative_humidity
            .value
            .ok_or_else(|| anyhow!("station reported no humidity"))?;
        Ok(Conditions {
            temperature: celsius_to_fahrenheit(celsius),
            humidity,
        })
    }
}
