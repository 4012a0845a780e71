//! HTTP-backed climate and insurance lookups.
//!
//! Successful responses are cached for the UTC day. Any failure (no endpoint,
//! network error, bad status, bad JSON) serves the offline snapshot, which is
//! never cached so the next call retries the service.

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use super::cache::DailyCache;
use super::{
    ClimateRiskLookup, ClimateRiskSnapshot, FarmProfile, InsuranceLookup,
    InsurancePolicySnapshot, offline_climate_snapshot, offline_insurance_snapshot,
};
use crate::error::ToolError;

pub struct HttpClimateService {
    client: reqwest::Client,
    endpoint: Option<String>,
    cache: DailyCache<ClimateRiskSnapshot>,
}

impl HttpClimateService {
    /// `endpoint` of `None` (or empty) runs permanently offline.
    pub fn new(client: reqwest::Client, endpoint: Option<String>) -> Self {
        Self::with_cache(client, endpoint, DailyCache::new())
    }

    pub fn with_cache(
        client: reqwest::Client,
        endpoint: Option<String>,
        cache: DailyCache<ClimateRiskSnapshot>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
            cache,
        }
    }

    async fn fetch(&self, endpoint: &str, location: &str) -> anyhow::Result<ClimateRiskSnapshot> {
        let mut url = Url::parse(endpoint)?;
        url.query_pairs_mut().append_pair("location", location);

        let snapshot = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<ClimateRiskSnapshot>()
            .await?;
        Ok(snapshot)
    }
}

#[async_trait]
impl ClimateRiskLookup for HttpClimateService {
    async fn climate_risk(&self, location: &str) -> Result<ClimateRiskSnapshot, ToolError> {
        let key = format!("climate:{}", location);
        if let Some(hit) = self.cache.get(&key) {
            log::debug!("Climate risk for {} served from cache", location);
            return Ok(hit);
        }

        let Some(endpoint) = self.endpoint.as_deref() else {
            return Ok(offline_climate_snapshot(self.cache.today()));
        };

        match self.fetch(endpoint, location).await {
            Ok(snapshot) => {
                self.cache.insert(&key, snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                log::warn!("Climate service error, returning offline data: {:#}", e);
                Ok(offline_climate_snapshot(self.cache.today()))
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicyQuery<'a> {
    farmer_name: &'a str,
    location: &'a str,
    crop: &'a str,
}

pub struct HttpInsuranceService {
    client: reqwest::Client,
    endpoint: Option<String>,
    cache: DailyCache<InsurancePolicySnapshot>,
}

impl HttpInsuranceService {
    pub fn new(client: reqwest::Client, endpoint: Option<String>) -> Self {
        Self::with_cache(client, endpoint, DailyCache::new())
    }

    pub fn with_cache(
        client: reqwest::Client,
        endpoint: Option<String>,
        cache: DailyCache<InsurancePolicySnapshot>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
            cache,
        }
    }

    async fn fetch(
        &self,
        endpoint: &str,
        farm: &FarmProfile,
    ) -> anyhow::Result<InsurancePolicySnapshot> {
        let query = PolicyQuery {
            farmer_name: &farm.farmer_name,
            location: &farm.location,
            crop: farm.crops.first().map(String::as_str).unwrap_or("Maize"),
        };

        let policy = self
            .client
            .post(endpoint)
            .json(&query)
            .send()
            .await?
            .error_for_status()?
            .json::<InsurancePolicySnapshot>()
            .await?;
        Ok(policy)
    }
}

#[async_trait]
impl InsuranceLookup for HttpInsuranceService {
    async fn insurance_policy(
        &self,
        farm: &FarmProfile,
    ) -> Result<InsurancePolicySnapshot, ToolError> {
        let key = format!("insurance:{}", farm.farmer_name);
        if let Some(hit) = self.cache.get(&key) {
            log::debug!("Insurance policy for {} served from cache", farm.farmer_name);
            return Ok(hit);
        }

        let Some(endpoint) = self.endpoint.as_deref() else {
            return Ok(offline_insurance_snapshot(farm));
        };

        match self.fetch(endpoint, farm).await {
            Ok(policy) => {
                self.cache.insert(&key, policy.clone());
                Ok(policy)
            }
            Err(e) => {
                log::warn!("Insurance service error, returning offline data: {:#}", e);
                Ok(offline_insurance_snapshot(farm))
            }
        }
    }
}
