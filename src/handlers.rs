//! Phase handlers.
//!
//! One handler per lifecycle phase, wired into the dispatcher at startup.
//! INSTALL sets up device subscriptions and the weather-lookup schedule;
//! UPDATE replaces the schedule only, since capability subscriptions
//! survive a reconfiguration. EVENT persists sensor readings and services
//! the weather-lookup timer. Everything outbound goes through the shared
//! retry guard.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::OauthSettings;
use crate::definition::SmartAppDefinition;
use crate::dispatcher::{DispatchError, HandlerMap, PhaseHandler};
use crate::influx::{FieldValue, Influx, Point};
use crate::lifecycle::{
    ConfigInit, ConfigInitData, ConfigPage, ConfigPageData, ConfigPhase, ConfigurationInitResponse,
    ConfigurationPageResponse, ConfirmationResponse, EventRequest, InstalledApp, LifecyclePhase,
    LifecycleRequest, LifecycleResponse,
};
use crate::retry::{self, CallError, RetryPolicy};
use crate::smartthings::SmartThings;
use crate::weather::{celsius_to_fahrenheit, Weather};

/// Name of the scheduled timer that triggers weather lookups.
pub const WEATHER_LOOKUP: &str = "weather-lookup";

/// Setting id controlling whether weather lookups run at all.
pub const WEATHER_ENABLED_SETTING: &str = "retrieve-weather-enabled";

/// Setting id selecting the lookup cron expression.
pub const WEATHER_CRON_SETTING: &str = "retrieve-weather-cron";

/// The cron expressions offered in the app definition. Anything else in the
/// config is a tampered or stale installation and is rejected.
pub const WEATHER_CRON_PRESETS: [&str; 3] =
    ["0/15 * * * ? *", "0/30 * * * ? *", "0 * * * ? *"];

/// Outbound collaborators shared by the handlers.
pub struct Services {
    pub http: reqwest::Client,
    pub retry: RetryPolicy,
    pub smartthings_base_url: String,
    pub weather: Weather,
    pub influx: Influx,
}

impl Services {
    /// SmartThings client scoped to the request's token and installation.
    fn smartthings(&self, token: &str, app: &InstalledApp) -> SmartThings {
        SmartThings::new(
            self.smartthings_base_url.clone(),
            self.http.clone(),
            self.retry,
            token.to_string(),
            app.installed_app_id.clone(),
            app.location_id.clone(),
        )
    }
}

/// Build the phase-to-handler map the dispatcher is constructed with.
pub fn handler_map(
    definition: Arc<SmartAppDefinition>,
    services: Arc<Services>,
    oauth: Option<OauthSettings>,
) -> HandlerMap {
    let mut handlers = HandlerMap::new();
    handlers.insert(
        LifecyclePhase::Confirmation,
        Arc::new(ConfirmationHandler {
            target_url: definition.target_url.clone(),
            http: services.http.clone(),
            retry: services.retry,
        }) as Arc<dyn PhaseHandler>,
    );
    handlers.insert(
        LifecyclePhase::Configuration,
        Arc::new(ConfigurationHandler {
            definition: definition.clone(),
        }),
    );
    handlers.insert(
        LifecyclePhase::Install,
        Arc::new(InstallHandler {
            services: services.clone(),
        }),
    );
    handlers.insert(
        LifecyclePhase::Update,
        Arc::new(UpdateHandler {
            services: services.clone(),
        }),
    );
    handlers.insert(
        LifecyclePhase::Event,
        Arc::new(EventHandler {
            services: services.clone(),
        }),
    );
    handlers.insert(
        LifecyclePhase::OauthCallback,
        Arc::new(OauthCallbackHandler {
            http: services.http.clone(),
            oauth,
        }),
    );
    handlers.insert(LifecyclePhase::Uninstall, Arc::new(UninstallHandler));
    handlers
}

fn wrong_phase(request: &LifecycleRequest) -> DispatchError {
    DispatchError::HandlerFailed(anyhow!("handler received a {} envelope", request.phase()))
}

/// Replace (or clear) the weather-lookup schedule per the installed config.
async fn schedule_weather_lookup(
    smartthings: &SmartThings,
    app: &InstalledApp,
) -> Result<(), DispatchError> {
    if app.as_bool(WEATHER_ENABLED_SETTING) {
        let cron = app.as_str(WEATHER_CRON_SETTING).ok_or_else(|| {
            DispatchError::HandlerFailed(anyhow!(
                "weather lookups enabled but no cron expression configured"
            ))
        })?;
        if !WEATHER_CRON_PRESETS.contains(&cron) {
            return Err(DispatchError::HandlerFailed(anyhow!(
                "unrecognized weather cron expression: {cron:?}"
            )));
        }
        smartthings
            .schedule_timer(WEATHER_LOOKUP, Some(cron))
            .await
            .context("failed to schedule weather lookups")?;
    } else {
        smartthings
            .schedule_timer(WEATHER_LOOKUP, None)
            .await
            .context("failed to clear weather lookup schedule")?;
    }
    Ok(())
}

/// CONFIRMATION: fetch the confirmation URL to register the app, then
/// acknowledge with our target URL. Registration may also happen out of
/// band, so a failed fetch is logged rather than failing the request.
struct ConfirmationHandler {
    target_url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
}

#[async_trait]
impl PhaseHandler for ConfirmationHandler {
    async fn handle(&self, request: &LifecycleRequest) -> Result<LifecycleResponse, DispatchError> {
        let LifecycleRequest::Confirmation(request) = request else {
            return Err(wrong_phase(request));
        };
        let url = &request.confirmation_data.confirmation_url;
        info!(app_id = %request.confirmation_data.app_id, "confirming app registration");
        let fetch = retry::call(&self.retry, || async {
            let response = self.http.get(url).send().await?;
            if !response.status().is_success() {
                return Err(CallError::from_response(response).await);
            }
            Ok(())
        })
        .await;
        match fetch {
            Ok(()) => info!("app registration confirmed"),
            Err(error) => warn!(error = %error, "confirmation fetch failed"),
        }
        Ok(LifecycleResponse::Confirmation(ConfirmationResponse {
            target_url: self.target_url.clone(),
        }))
    }
}

/// CONFIGURATION: answer INITIALIZE and PAGE from the static definition.
/// Page ids are 1-based indexes into the definition's page list.
struct ConfigurationHandler {
    definition: Arc<SmartAppDefinition>,
}

#[async_trait]
impl PhaseHandler for ConfigurationHandler {
    async fn handle(&self, request: &LifecycleRequest) -> Result<LifecycleResponse, DispatchError> {
        let LifecycleRequest::Configuration(request) = request else {
            return Err(wrong_phase(request));
        };
        let data = &request.configuration_data;
        match data.phase {
            ConfigPhase::Initialize => Ok(LifecycleResponse::ConfigurationInit(
                ConfigurationInitResponse {
                    configuration_data: ConfigInitData {
                        initialize: ConfigInit {
                            id: self.definition.id.clone(),
                            name: self.definition.name.clone(),
                            description: self.definition.description.clone(),
                            permissions: self.definition.permissions.clone(),
                            first_page_id: "1".to_string(),
                        },
                    },
                },
            )),
            ConfigPhase::Page => {
                let pages = &self.definition.config_pages;
                let index: usize = data
                    .page_id
                    .parse()
                    .map_err(|_| DispatchError::UnknownPage(data.page_id.clone()))?;
                if index < 1 || index > pages.len() {
                    return Err(DispatchError::UnknownPage(data.page_id.clone()));
                }
                let page = &pages[index - 1];
                let last = index == pages.len();
                Ok(LifecycleResponse::ConfigurationPage(
                    ConfigurationPageResponse {
                        configuration_data: ConfigPageData {
                            page: ConfigPage {
                                page_id: data.page_id.clone(),
                                name: page.page_name.clone(),
                                previous_page_id: (index > 1).then(|| (index - 1).to_string()),
                                next_page_id: (!last).then(|| (index + 1).to_string()),
                                complete: last,
                                sections: page.sections.clone(),
                            },
                        },
                    },
                ))
            }
        }
    }
}

/// INSTALL: subscribe to sensor events and set up the weather schedule.
struct InstallHandler {
    services: Arc<Services>,
}

#[async_trait]
impl PhaseHandler for InstallHandler {
    async fn handle(&self, request: &LifecycleRequest) -> Result<LifecycleResponse, DispatchError> {
        let LifecycleRequest::Install(request) = request else {
            return Err(wrong_phase(request));
        };
        let data = &request.install_data;
        let smartthings = self
            .services
            .smartthings(&data.auth_token, &data.installed_app);
        smartthings
            .subscribe_to_temperature_events()
            .await
            .context("temperature subscription failed")?;
        smartthings
            .subscribe_to_humidity_events()
            .await
            .context("humidity subscription failed")?;
        schedule_weather_lookup(&smartthings, &data.installed_app).await?;
        info!(installed_app_id = %data.installed_app.installed_app_id, "installation complete");
        Ok(LifecycleResponse::install())
    }
}

/// UPDATE: replace the weather schedule. Capability subscriptions are
/// location-wide and survive reconfiguration, so they are not re-created.
struct UpdateHandler {
    services: Arc<Services>,
}

#[async_trait]
impl PhaseHandler for UpdateHandler {
    async fn handle(&self, request: &LifecycleRequest) -> Result<LifecycleResponse, DispatchError> {
        let LifecycleRequest::Update(request) = request else {
            return Err(wrong_phase(request));
        };
        let data = &request.update_data;
        let smartthings = self
            .services
            .smartthings(&data.auth_token, &data.installed_app);
        schedule_weather_lookup(&smartthings, &data.installed_app).await?;
        info!(installed_app_id = %data.installed_app.installed_app_id, "update complete");
        Ok(LifecycleResponse::update())
    }
}

/// EVENT: persist device readings and service the weather-lookup timer.
///
/// Persistence is best-effort per point: a failed write is logged and the
/// remaining readings still go through. The platform acknowledgment does
/// not depend on it, since SmartThings would only redeliver the whole
/// batch and duplicate the points that did land.
struct EventHandler {
    services: Arc<Services>,
}

impl EventHandler {
    async fn record_device_events(&self, request: &EventRequest) {
        let mut written = 0usize;
        let mut failed = 0usize;
        for (event, device) in request.event_data.device_events() {
            let Some(raw) = device.value.as_f64() else {
                warn!(
                    device = %device.device_id,
                    attribute = %device.attribute,
                    "skipping non-numeric reading"
                );
                failed += 1;
                continue;
            };
            // readings are stored in Fahrenheit regardless of device scale
            let value = match device.unit.as_deref() {
                Some("C") => celsius_to_fahrenheit(raw),
                _ => raw,
            };
            let timestamp = event
                .event_time
                .unwrap_or_else(Utc::now)
                .timestamp_millis();
            let point = Point::new("sensor", timestamp)
                .tag("location", &device.location_id)
                .tag("device", &device.device_id)
                .field(&device.attribute, FieldValue::Float(value));
            match self.services.influx.write(&point).await {
                Ok(()) => written += 1,
                Err(error) => {
                    warn!(
                        device = %device.device_id,
                        attribute = %device.attribute,
                        error = %error,
                        "failed to record sensor reading"
                    );
                    failed += 1;
                }
            }
        }
        if written > 0 || failed > 0 {
            info!(written, failed, "recorded sensor readings");
        }
    }

    /// One lookup per request, no matter how many timer events fired.
    async fn record_weather(&self, request: &EventRequest) -> anyhow::Result<()> {
        let data = &request.event_data;
        let smartthings = self
            .services
            .smartthings(&data.auth_token, &data.installed_app);
        let location = smartthings
            .retrieve_location()
            .await
            .context("location lookup failed")?;

        // the weather API only covers U.S. locations
        let eligible = location.country_code.as_deref() == Some("USA");
        let (Some(latitude), Some(longitude)) = (location.latitude, location.longitude) else {
            debug!(location = %location.location_id, "location has no coordinates, skipping weather");
            return Ok(());
        };
        if !eligible {
            debug!(location = %location.location_id, "location not eligible for weather lookups");
            return Ok(());
        }

        let conditions = self
            .services
            .weather
            .current_conditions(latitude, longitude)
            .await?;
        let point = Point::new("weather", Utc::now().timestamp_millis())
            .tag("location", &location.location_id)
            .field("temperature", FieldValue::Float(conditions.temperature))
            .field("humidity", FieldValue::Float(conditions.humidity));
        self.services
            .influx
            .write(&point)
            .await
            .context("weather write failed")?;
        Ok(())
    }
}

#[async_trait]
impl PhaseHandler for EventHandler {
    async fn handle(&self, request: &LifecycleRequest) -> Result<LifecycleResponse, DispatchError> {
        let LifecycleRequest::Event(request) = request else {
            return Err(wrong_phase(request));
        };
        if request
            .event_data
            .timer_events(WEATHER_LOOKUP)
            .next()
            .is_some()
        {
            // weather is auxiliary; a failed lookup never blocks the ack
            if let Err(error) = self.record_weather(request).await {
                warn!(error = format!("{error:#}"), "weather lookup failed");
            }
        }
        self.record_device_events(request).await;
        Ok(LifecycleResponse::event())
    }
}

/// OAUTH_CALLBACK: exchange the authorization code with the configured
/// provider. Grants are single-use, so the exchange is never retried.
struct OauthCallbackHandler {
    http: reqwest::Client,
    oauth: Option<OauthSettings>,
}

fn query_param<'a>(url_path: &'a str, key: &str) -> Option<&'a str> {
    let (_, query) = url_path.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}

#[async_trait]
impl PhaseHandler for OauthCallbackHandler {
    async fn handle(&self, request: &LifecycleRequest) -> Result<LifecycleResponse, DispatchError> {
        let LifecycleRequest::OauthCallback(request) = request else {
            return Err(wrong_phase(request));
        };
        let data = &request.o_auth_callback_data;
        let Some(oauth) = &self.oauth else {
            debug!(installed_app_id = %data.installed_app_id, "no oauth provider configured");
            return Ok(LifecycleResponse::oauth_callback());
        };
        let code = query_param(&data.url_path, "code")
            .ok_or_else(|| anyhow!("callback carried no authorization code"))
            .map_err(DispatchError::HandlerFailed)?;
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", oauth.client_id.as_str()),
            ("client_secret", oauth.client_secret.as_str()),
        ];
        retry::call(&RetryPolicy::none(), || async {
            let response = self.http.post(&oauth.token_url).form(&params).send().await?;
            if !response.status().is_success() {
                return Err(CallError::from_response(response).await);
            }
            Ok(())
        })
        .await
        .context("authorization code exchange failed")?;
        info!(installed_app_id = %data.installed_app_id, "authorization code exchanged");
        Ok(LifecycleResponse::oauth_callback())
    }
}

/// UNINSTALL: nothing to tear down — the platform removes subscriptions
/// and schedules with the installation, and readings are kept.
struct UninstallHandler;

#[async_trait]
impl PhaseHandler for UninstallHandler {
    async fn handle(&self, request: &LifecycleRequest) -> Result<LifecycleResponse, DispatchError> {
        let LifecycleRequest::Uninstall(request) = request else {
            return Err(wrong_phase(request));
        };
        info!(
            installed_app_id = %request.uninstall_data.installed_app.installed_app_id,
            "uninstalled"
        );
        Ok(LifecycleResponse::uninstall())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{decode, testdata};
    use serde_json::{json, Value};
    use wiremock::matchers::{body_string, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn services(st: &MockServer, weather: &MockServer, influx: &MockServer) -> Arc<Services> {
        let http = reqwest::Client::new();
        let retry = RetryPolicy::none();
        Arc::new(Services {
            http: http.clone(),
            retry,
            smartthings_base_url: st.uri(),
            weather: Weather::new(weather.uri(), http.clone(), retry),
            influx: Influx::new(
                influx.uri(),
                "org".to_string(),
                "bucket".to_string(),
                "token".to_string(),
                http,
                retry,
            ),
        })
    }

    fn map(services: Arc<Services>, oauth: Option<OauthSettings>) -> HandlerMap {
        let definition = Arc::new(crate::definition::load().unwrap());
        handler_map(definition, services, oauth)
    }

    async fn run(
        handlers: &HandlerMap,
        request: &LifecycleRequest,
    ) -> Result<LifecycleResponse, DispatchError> {
        handlers
            .get(&request.phase())
            .expect("handler registered")
            .handle(request)
            .await
    }

    fn with_weather_config(mut body: Value, enabled: &str, cron: &str) -> Value {
        let config = &mut body["installData"]["installedApp"]["config"];
        config["retrieve-weather-enabled"] =
            json!([{"valueType": "STRING", "stringConfig": {"value": enabled}}]);
        config["retrieve-weather-cron"] =
            json!([{"valueType": "STRING", "stringConfig": {"value": cron}}]);
        body
    }

    fn decoded(body: Value) -> LifecycleRequest {
        decode(body.to_string().as_bytes()).unwrap()
    }

    fn event_with(events: Vec<Value>) -> LifecycleRequest {
        let mut body = testdata::body(LifecyclePhase::Event);
        body["eventData"]["events"] = Value::Array(events);
        decoded(body)
    }

    fn timer_event(name: &str) -> Value {
        json!({
            "eventType": "TIMER_EVENT",
            "timerEvent": {"name": name, "expression": "0/15 * * * ? *"}
        })
    }

    #[tokio::test]
    async fn install_subscribes_and_schedules() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/installedapps/installed-one/subscriptions"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&st)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/installedapps/installed-one/schedules/weather-lookup"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&st)
            .await;
        Mock::given(method("POST"))
            .and(path("/installedapps/installed-one/schedules"))
            .and(body_string_contains("0/15 * * * ? *"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&st)
            .await;

        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &testdata::request(LifecyclePhase::Install))
            .await
            .unwrap();
        assert_eq!(response, LifecycleResponse::install());
    }

    #[tokio::test]
    async fn update_reschedules_without_resubscribing() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/installedapps/installed-one/schedules/weather-lookup"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&st)
            .await;
        Mock::given(method("POST"))
            .and(path("/installedapps/installed-one/schedules"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&st)
            .await;

        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &testdata::request(LifecyclePhase::Update))
            .await
            .unwrap();
        assert_eq!(response, LifecycleResponse::update());
        // delete + create only, no subscription calls
        assert_eq!(st.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn disabling_weather_clears_the_schedule() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/installedapps/installed-one/subscriptions"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&st)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/installedapps/installed-one/schedules/weather-lookup"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&st)
            .await;

        let body = with_weather_config(
            testdata::body(LifecyclePhase::Install),
            "false",
            "0/15 * * * ? *",
        );
        let handlers = map(services(&st, &weather, &influx), None);
        run(&handlers, &decoded(body)).await.unwrap();
        // two subscriptions plus the delete; no schedule was created
        assert_eq!(st.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unrecognized_cron_expression_fails_the_install() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/installedapps/installed-one/subscriptions"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&st)
            .await;

        let body = with_weather_config(
            testdata::body(LifecyclePhase::Install),
            "true",
            "* * * * * *",
        );
        let handlers = map(services(&st, &weather, &influx), None);
        let result = run(&handlers, &decoded(body)).await;
        assert!(matches!(result, Err(DispatchError::HandlerFailed(_))));
        // rejected before any schedule call was made
        assert_eq!(st.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn device_readings_are_written_one_point_per_event() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        // the third reading fails; the other four must still land
        Mock::given(method("POST"))
            .and(body_string_contains("device=device-3"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&influx)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(4)
            .mount(&influx)
            .await;

        let events = (1..=5)
            .map(|i| {
                testdata::device_event(&format!("device-{i}"), "temperature", 20.0 + i as f64, "F")
            })
            .collect();
        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &event_with(events)).await.unwrap();
        assert_eq!(response, LifecycleResponse::event());
    }

    #[tokio::test]
    async fn celsius_readings_are_stored_in_fahrenheit() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string(
                "sensor,location=location-one,device=device-1 temperature=84.92 1755058692469",
            ))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&influx)
            .await;

        let events = vec![testdata::device_event("device-1", "temperature", 29.4, "C")];
        let handlers = map(services(&st, &weather, &influx), None);
        run(&handlers, &event_with(events)).await.unwrap();
    }

    #[tokio::test]
    async fn weather_timer_triggers_a_single_lookup() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/locations/location-one"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "locationId": "location-one",
                "name": "My House",
                "countryCode": "USA",
                "latitude": 41.024654,
                "longitude": -97.37219,
                "temperatureScale": "F"
            })))
            .expect(1)
            .mount(&st)
            .await;
        Mock::given(method("GET"))
            .and(path("/points/41.0247,-97.3722/stations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [{ "id": format!("{}/stations/KOLU", weather.uri()) }]
            })))
            .expect(1)
            .mount(&weather)
            .await;
        Mock::given(method("GET"))
            .and(path("/stations/KOLU/observations/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "properties": {
                    "temperature": {"value": 29.4},
                    "relativeHumidity": {"value": 57.3}
                }
            })))
            .expect(1)
            .mount(&weather)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains(
                "weather,location=location-one temperature=84.92,humidity=57.3",
            ))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&influx)
            .await;

        // two timer firings in one batch still mean one lookup
        let events = vec![timer_event(WEATHER_LOOKUP), timer_event(WEATHER_LOOKUP)];
        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &event_with(events)).await.unwrap();
        assert_eq!(response, LifecycleResponse::event());
    }

    #[tokio::test]
    async fn non_us_locations_skip_the_weather_lookup() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/locations/location-one"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "locationId": "location-one",
                "name": "My House",
                "countryCode": "GBR",
                "latitude": 51.5,
                "longitude": -0.1
            })))
            .expect(1)
            .mount(&st)
            .await;

        let handlers = map(services(&st, &weather, &influx), None);
        run(&handlers, &event_with(vec![timer_event(WEATHER_LOOKUP)]))
            .await
            .unwrap();
        assert!(weather.received_requests().await.unwrap().is_empty());
        assert!(influx.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_weather_lookup_still_acknowledges() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&st)
            .await;

        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &event_with(vec![timer_event(WEATHER_LOOKUP)]))
            .await
            .unwrap();
        assert_eq!(response, LifecycleResponse::event());
    }

    #[tokio::test]
    async fn unrelated_timers_are_ignored() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;

        let handlers = map(services(&st, &weather, &influx), None);
        run(&handlers, &event_with(vec![timer_event("bogus")]))
            .await
            .unwrap();
        assert!(st.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn configuration_initialize_describes_the_app() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;

        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &testdata::request(LifecyclePhase::Configuration))
            .await
            .unwrap();
        let body = serde_json::to_value(response).unwrap();
        assert_eq!(body["configurationData"]["initialize"]["id"], "sensor-track");
        assert_eq!(
            body["configurationData"]["initialize"]["firstPageId"],
            "1"
        );
    }

    #[tokio::test]
    async fn configuration_page_renders_the_single_page() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;

        let mut body = testdata::body(LifecyclePhase::Configuration);
        body["configurationData"]["phase"] = json!("PAGE");
        body["configurationData"]["pageId"] = json!("1");

        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &decoded(body)).await.unwrap();
        let rendered = serde_json::to_value(response).unwrap();
        let page = &rendered["configurationData"]["page"];
        assert_eq!(page["pageId"], "1");
        assert_eq!(page["name"], "Sensor Tracking");
        assert_eq!(page["previousPageId"], Value::Null);
        assert_eq!(page["nextPageId"], Value::Null);
        assert_eq!(page["complete"], true);
        assert_eq!(page["sections"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn out_of_range_and_malformed_page_ids_are_rejected() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        let handlers = map(services(&st, &weather, &influx), None);

        for page_id in ["0", "2", "bogus"] {
            let mut body = testdata::body(LifecyclePhase::Configuration);
            body["configurationData"]["phase"] = json!("PAGE");
            body["configurationData"]["pageId"] = json!(page_id);
            let result = run(&handlers, &decoded(body)).await;
            assert!(
                matches!(result, Err(DispatchError::UnknownPage(ref id)) if id == page_id),
                "pageId {page_id:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn confirmation_fetches_the_url_once_and_returns_the_target() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        let confirm = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/confirm"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&confirm)
            .await;

        let mut body = testdata::body(LifecyclePhase::Confirmation);
        body["confirmationData"]["confirmationUrl"] =
            json!(format!("{}/confirm?token=xyz", confirm.uri()));

        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &decoded(body)).await.unwrap();
        assert_eq!(
            response,
            LifecycleResponse::Confirmation(ConfirmationResponse {
                target_url: "https://sensortrack.example.com/smartapp".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn failed_confirmation_fetch_still_returns_the_target() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        let confirm = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&confirm)
            .await;

        let mut body = testdata::body(LifecyclePhase::Confirmation);
        body["confirmationData"]["confirmationUrl"] = json!(format!("{}/confirm", confirm.uri()));

        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &decoded(body)).await.unwrap();
        assert!(matches!(response, LifecycleResponse::Confirmation(_)));
    }

    #[tokio::test]
    async fn oauth_code_is_exchanged_with_the_provider() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        let provider = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc123"))
            .and(body_string_contains("client_id=client"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "granted",
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(&provider)
            .await;

        let oauth = OauthSettings {
            token_url: format!("{}/token", provider.uri()),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        };
        let handlers = map(services(&st, &weather, &influx), Some(oauth));
        let response = run(&handlers, &testdata::request(LifecyclePhase::OauthCallback))
            .await
            .unwrap();
        assert_eq!(response, LifecycleResponse::oauth_callback());
    }

    #[tokio::test]
    async fn oauth_callback_without_a_provider_is_acknowledged() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;

        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &testdata::request(LifecyclePhase::OauthCallback))
            .await
            .unwrap();
        assert_eq!(response, LifecycleResponse::oauth_callback());
    }

    #[tokio::test]
    async fn failed_code_exchange_is_a_handler_error() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;
        let provider = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&provider)
            .await;

        let oauth = OauthSettings {
            token_url: format!("{}/token", provider.uri()),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        };
        let handlers = map(services(&st, &weather, &influx), Some(oauth));
        let result = run(&handlers, &testdata::request(LifecyclePhase::OauthCallback)).await;
        assert!(matches!(result, Err(DispatchError::HandlerFailed(_))));
    }

    #[tokio::test]
    async fn uninstall_acknowledges() {
        let st = MockServer::start().await;
        let weather = MockServer::start().await;
        let influx = MockServer::start().await;

        let handlers = map(services(&st, &weather, &influx), None);
        let response = run(&handlers, &testdata::request(LifecyclePhase::Uninstall))
            .await
            .unwrap();
        assert_eq!(response, LifecycleResponse::uninstall());
    }

    #[test]
    fn query_params_are_extracted_from_the_callback_path() {
        assert_eq!(
            query_param("/oauth/callback?code=abc&state=x", "code"),
            Some("abc")
        );
        assert_eq!(query_param("/oauth/callback?state=x", "code"), None);
        assert_eq!(query_param("/oauth/callback", "code"), None);
    }
}
