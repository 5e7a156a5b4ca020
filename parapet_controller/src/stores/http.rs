//! HTTP client for the filtering engine's management API
//!
//! Implements the policy, address-set and sampling collaborators against the
//! engine's REST surface. Lock tokens travel in the request body; the engine
//! answers a stale token with 409, which maps to [`StoreError::Conflict`].

use super::{AddressSetStore, PolicyStore, SamplingService, StoreResult};
use async_trait::async_trait;
use parapet_common::{
    AddressSet, AddressSetRef, LockToken, MetricWindow, PolicyRef, ProtectionPolicy,
    SampledRequest, StoreError, Versioned,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FilterEngineClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct PolicyDocument {
    policy: ProtectionPolicy,
    lock_token: String,
}

#[derive(Deserialize)]
struct AddressSetDocument {
    address_set: AddressSet,
    lock_token: String,
}

#[derive(Serialize)]
struct RateLimitUpdate<'a> {
    limit: u64,
    lock_token: &'a str,
    scope: &'a str,
}

#[derive(Serialize)]
struct AddressSetUpdate<'a> {
    addresses: &'a BTreeSet<String>,
    lock_token: &'a str,
    scope: &'a str,
}

#[derive(Deserialize)]
struct SampleDocument {
    samples: Vec<SampledRequest>,
}

impl FilterEngineClient {
    pub fn new(base_url: String, token: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        resource: &str,
    ) -> StoreResult<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        match response.status() {
            StatusCode::CONFLICT => Err(StoreError::Conflict(resource.to_string())),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(resource.to_string())),
            status if status.is_success() => Ok(response),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Backend(format!(
                    "{}: {} {}",
                    resource, status, body
                )))
            }
        }
    }
}

#[async_trait]
impl PolicyStore for FilterEngineClient {
    async fn get(&self, policy: &PolicyRef) -> StoreResult<Versioned<ProtectionPolicy>> {
        let resource = format!("policy/{}", policy.name);
        let response = self
            .send(
                self.request(
                    reqwest::Method::GET,
                    &format!("/v1/policies/{}", policy.id),
                )
                .query(&[("scope", policy.scope.as_str())]),
                &resource,
            )
            .await?;

        let doc: PolicyDocument = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("{}: invalid body: {}", resource, e)))?;
        Ok(Versioned {
            value: doc.policy,
            lock_token: LockToken(doc.lock_token),
        })
    }

    async fn update_rate_limit(
        &self,
        policy: &PolicyRef,
        rule_name: &str,
        new_limit: u64,
        lock_token: LockToken,
    ) -> StoreResult<()> {
        let resource = format!("policy/{}", policy.name);
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!(
                    "/v1/policies/{}/rules/{}/rate-limit",
                    policy.id, rule_name
                ),
            )
            .json(&RateLimitUpdate {
                limit: new_limit,
                lock_token: lock_token.as_str(),
                scope: policy.scope.as_str(),
            }),
            &resource,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AddressSetStore for FilterEngineClient {
    async fn get(&self, set: &AddressSetRef) -> StoreResult<Versioned<AddressSet>> {
        let resource = format!("address-set/{}", set.name);
        let response = self
            .send(
                self.request(
                    reqwest::Method::GET,
                    &format!("/v1/address-sets/{}", set.id),
                )
                .query(&[("scope", set.scope.as_str())]),
                &resource,
            )
            .await?;

        let doc: AddressSetDocument = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("{}: invalid body: {}", resource, e)))?;
        Ok(Versioned {
            value: doc.address_set,
            lock_token: LockToken(doc.lock_token),
        })
    }

    async fn update(
        &self,
        set: &AddressSetRef,
        addresses: BTreeSet<String>,
        lock_token: LockToken,
    ) -> StoreResult<()> {
        let resource = format!("address-set/{}", set.name);
        self.send(
            self.request(
                reqwest::Method::PUT,
                &format!("/v1/address-sets/{}", set.id),
            )
            .json(&AddressSetUpdate {
                addresses: &addresses,
                lock_token: lock_token.as_str(),
                scope: set.scope.as_str(),
            }),
            &resource,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SamplingService for FilterEngineClient {
    async fn sample(
        &self,
        policy: &PolicyRef,
        rule_name: &str,
        window: &MetricWindow,
        max_items: u32,
    ) -> StoreResult<Vec<SampledRequest>> {
        let resource = format!("samples/{}/{}", policy.name, rule_name);
        let response = self
            .send(
                self.request(
                    reqwest::Method::GET,
                    &format!(
                        "/v1/policies/{}/rules/{}/samples",
                        policy.id, rule_name
                    ),
                )
                .query(&[
                    ("scope", policy.scope.as_str().to_string()),
                    ("start", window.start.to_rfc3339()),
                    ("end", window.end.to_rfc3339()),
                    ("max_items", max_items.to_string()),
                ]),
                &resource,
            )
            .await?;

        let doc: SampleDocument = response
            .json()
            .await
            .map_err(|e| StoreError::Backend(format!("{}: invalid body: {}", resource, e)))?;
        Ok(doc.samples)
    }
}
