//! SmartThings API client.
//!
//! Bearer-token client for the small slice of the SmartThings REST API this
//! app needs: capability event subscriptions, location lookup, and the
//! weather-lookup schedule. Tokens arrive per lifecycle request, so a
//! client is built per request around a shared connection pool.
//!
//! Every operation here is idempotent (subscriptions are keyed by name,
//! schedules are replace-by-name) and runs under the outbound retry guard.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::retry::{self, CallError, RetryPolicy};

/// Details about a location, as needed for weather lookups.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub location_id: String,
    pub name: String,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub temperature_scale: Option<String>,
}

/// Client scoped to one installed app's token and location.
pub struct SmartThings {
    base_url: String,
    token: String,
    app_id: String,
    location_id: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

impl SmartThings {
    pub fn new(
        base_url: String,
        http: reqwest::Client,
        retry: RetryPolicy,
        token: String,
        app_id: String,
        location_id: String,
    ) -> Self {
        SmartThings {
            base_url,
            token,
            app_id,
            location_id,
            http,
            retry,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), endpoint)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Accept", "application/vnd.smartthings+json;v=1")
            .header("Accept-Language", "en_US")
            .header("Authorization", format!("Bearer {}", self.token))
    }

    /// Subscribe to an event by capability, for every matching device at
    /// the location.
    async fn subscribe(&self, capability: &str, attribute: &str) -> Result<(), CallError> {
        let url = self.url(&format!("/installedapps/{}/subscriptions", self.app_id));
        let body = json!({
            "sourceType": "CAPABILITY",
            "capability": {
                "locationId": self.location_id,
                "capability": capability,
                "attribute": attribute,
                "value": "*",
                "stateChangeOnly": true,
                // subscription names are limited to 36 characters
                "subscriptionName": format!("all-{capability}"),
            },
        });
        retry::call(&self.retry, || async {
            let response = self
                .request(self.http.post(&url))
                .json(&body)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(CallError::from_response(response).await);
            }
            Ok(())
        })
        .await?;
        debug!(capability, attribute, "subscribed to capability events");
        Ok(())
    }

    /// Subscribe to temperature events by capability.
    pub async fn subscribe_to_temperature_events(&self) -> Result<(), CallError> {
        self.subscribe("temperatureMeasurement", "temperature").await
    }

    /// Subscribe to humidity events by capability.
    pub async fn subscribe_to_humidity_events(&self) -> Result<(), CallError> {
        self.subscribe("relativeHumidityMeasurement", "humidity").await
    }

    /// Retrieve details about the installed app's location.
    pub async fn retrieve_location(&self) -> Result<Location, CallError> {
        let url = self.url(&format!("/locations/{}", self.location_id));
        retry::call(&self.retry, || async {
            let response = self.request(self.http.get(&url)).send().await?;
            if !response.status().is_success() {
                return Err(CallError::from_response(response).await);
            }
            Ok(response.json::<Location>().await?)
        })
        .await
    }

    /// Replace the named timer schedule: any existing schedule is deleted
    /// first, then a new one is created when a cron expression is given.
    /// Safe to repeat — INSTALL and every subsequent UPDATE go through the
    /// same delete-then-create path.
    pub async fn schedule_timer(&self, name: &str, cron: Option<&str>) -> Result<(), CallError> {
        let delete_url = self.url(&format!("/installedapps/{}/schedules/{}", self.app_id, name));
        retry::call(&self.retry, || async {
            let response = self.request(self.http.delete(&delete_url)).send().await?;
            // deleting a schedule that was never created is fine
            if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
                return Err(CallError::from_response(response).await);
            }
            Ok(())
        })
        .await?;

        if let Some(expression) = cron {
            let url = self.url(&format!("/installedapps/{}/schedules", self.app_id));
            let body = json!({
                "name": name,
                "cron": { "expression": expression, "timezone": "UTC" },
            });
            retry::call(&self.retry, || async {
                let response = self
                    .request(self.http.post(&url))
                    .json(&body)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(CallError::from_response(response).await);
                }
                Ok(())
            })
            .await?;
            debug!(name, expression, "scheduled timer");
        } else {
            debug!(name, "timer schedule removed");
        }
        Ok(())
    }
}
