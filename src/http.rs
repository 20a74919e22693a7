//! HTTP adapters for the routing service and the remote store.
//!
//! - [`MapboxRouting`] talks to the Mapbox Directions and Map Matching APIs
//! - [`RestStore`] talks to a PostgREST endpoint (`/rest/v1`)
//!
//! Both share one pooled `reqwest::Client` each, with a request timeout
//! taken from configuration. Nothing is retried here: a failed call comes
//! back as an error and the user decides whether to try again.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::{RoutingConfig, StoreConfig};
use crate::error::{RideError, Result};
use crate::routing::{downsample, Directions, MatchedRoutes, RoutingService};
use crate::store::{Filter, PersistenceStore};
use crate::LngLat;

fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| RideError::config(format!("Failed to create HTTP client: {}", e)))
}

/// `lng,lat;lng,lat;...` as used in Mapbox URL paths.
fn coordinate_path(coordinates: &[LngLat]) -> String {
    coordinates
        .iter()
        .map(|[lng, lat]| format!("{},{}", lng, lat))
        .collect::<Vec<_>>()
        .join(";")
}

// ============================================================================
// Routing
// ============================================================================

/// Mapbox-backed [`RoutingService`].
#[derive(Debug, Clone)]
pub struct MapboxRouting {
    client: Client,
    config: RoutingConfig,
}

impl MapboxRouting {
    pub fn new(config: &RoutingConfig) -> Result<Self> {
        if config.access_token.is_empty() {
            return Err(RideError::config("routing.access_token is required"));
        }
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            config: config.clone(),
        })
    }

    /// Directions request URL, without the access token.
    pub fn directions_url(&self, origin: LngLat, destination: LngLat) -> String {
        format!(
            "{}/directions/v5/mapbox/{}/{}?alternatives=true&geometries=geojson&overview=full&steps=true",
            self.config.base_url.trim_end_matches('/'),
            self.config.profile,
            coordinate_path(&[origin, destination])
        )
    }

    /// Map matching request URL, without the access token.
    ///
    /// Traces longer than the service accepts are downsampled first.
    pub fn matching_url(&self, coordinates: &[LngLat]) -> String {
        let sampled = downsample(coordinates, self.config.max_match_coordinates);
        format!(
            "{}/matching/v5/mapbox/{}/{}?geometries=geojson&overview=full",
            self.config.base_url.trim_end_matches('/'),
            self.config.profile,
            coordinate_path(&sampled)
        )
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .query(&[("access_token", self.config.access_token.as_str())])
            .send()
            .await
            .map_err(|e| RideError::routing(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("[MapboxRouting] HTTP {} from routing service", status);
            return Err(RideError::RoutingService {
                message: error_detail(status, &body),
                status_code: Some(status.as_u16()),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| RideError::routing(format!("malformed response: {}", e)))
    }
}

#[async_trait]
impl RoutingService for MapboxRouting {
    async fn directions(&self, origin: LngLat, destination: LngLat) -> Result<Directions> {
        let url = self.directions_url(origin, destination);
        debug!("[MapboxRouting] Directions {:?} -> {:?}", origin, destination);
        self.get(&url).await
    }

    async fn match_route(&self, coordinates: &[LngLat]) -> Result<MatchedRoutes> {
        if coordinates.len() < 2 {
            return Err(RideError::validation("map matching needs at least 2 coordinates"));
        }
        let url = self.matching_url(coordinates);
        debug!(
            "[MapboxRouting] Matching {} coordinates (limit {})",
            coordinates.len(),
            self.config.max_match_coordinates
        );
        self.get(&url).await
    }
}

/// Short description of a failed response, preferring the service's own
/// `message` field when the body is JSON.
fn error_detail(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        })
}

// ============================================================================
// Store
// ============================================================================

/// PostgREST-backed [`PersistenceStore`].
#[derive(Debug, Clone)]
pub struct RestStore {
    client: Client,
    config: StoreConfig,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(RideError::config("store.base_url is required"));
        }
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            config: config.clone(),
        })
    }

    /// Replace the signed-in user's token, e.g. after a refresh.
    pub fn set_access_token(&mut self, token: Option<String>) {
        self.config.access_token = token;
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base_url.trim_end_matches('/'), table)
    }

    pub fn procedure_url(&self, name: &str) -> String {
        format!(
            "{}/rest/v1/rpc/{}",
            self.config.base_url.trim_end_matches('/'),
            name
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let bearer = self
            .config
            .access_token
            .as_deref()
            .unwrap_or(&self.config.api_key);
        request
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", bearer))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| RideError::persistence(format!("{} failed: {}", what, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("[RestStore] HTTP {} on {}", status, what);
            return Err(RideError::persistence(format!(
                "{} failed ({}): {}",
                what,
                status.as_u16(),
                error_detail(status, &body)
            )));
        }
        Ok(response)
    }

    async fn rows(response: Response, what: &str) -> Result<Vec<Value>> {
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| RideError::persistence(format!("{} returned malformed rows: {}", what, e)))
    }
}

/// PostgREST query parameters for a list of filters.
pub fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| match filter {
            Filter::Eq(column, Value::String(s)) => (column.clone(), format!("eq.{}", s)),
            Filter::Eq(column, value) => (column.clone(), format!("eq.{}", value)),
            Filter::IsNull(column) => (column.clone(), "is.null".to_string()),
        })
        .collect()
}

#[async_trait]
impl PersistenceStore for RestStore {
    async fn insert(&self, table: &str, record: Value) -> Result<Value> {
        let what = format!("insert into {}", table);
        let request = self
            .client
            .post(self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&record);
        let response = self.send(request, &what).await?;
        Self::rows(response, &what)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RideError::persistence(format!("{} returned no row", what)))
    }

    async fn update(&self, table: &str, patch: Value, id: i64) -> Result<()> {
        let what = format!("update of {} {}", table, id);
        let request = self
            .client
            .patch(self.table_url(table))
            .query(&[("id", format!("eq.{}", id))])
            .json(&patch);
        self.send(request, &what).await?;
        Ok(())
    }

    async fn select_one(&self, table: &str, filters: &[Filter]) -> Result<Option<Value>> {
        let what = format!("lookup in {}", table);
        let mut params = filter_params(filters);
        params.push(("limit".to_string(), "1".to_string()));
        let request = self.client.get(self.table_url(table)).query(&params);
        let response = self.send(request, &what).await?;
        Ok(Self::rows(response, &what).await?.into_iter().next())
    }

    async fn call_procedure(&self, name: &str, args: Value) -> Result<Vec<Value>> {
        let what = format!("procedure {}", name);
        let request = self.client.post(self.procedure_url(name)).json(&args);
        let response = self.send(request, &what).await?;
        Self::rows(response, &what).await
    }
}
