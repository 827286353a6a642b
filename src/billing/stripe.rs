use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::config;

/// Outbound billing-provider surface. Injected where it is needed so tests
/// can substitute a fake; webhook handling itself never depends on it
/// beyond session expansion.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    /// Retrieve a checkout session with its subscription and customer
    /// expanded.
    async fn retrieve_checkout_session(&self, session_id: &str) -> Result<Value>;
    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<Value>;
    /// Create a hosted, embedded-mode checkout session and return the raw
    /// session object (the caller only needs `client_secret`).
    async fn create_checkout_session(
        &self,
        line_items: &[(String, i64)],
        customer_email: &str,
        metadata: &[(String, String)],
    ) -> Result<Value>;
}

pub struct StripeClient {
    base: String,
    secret_key: String,
    client: Client,
}

impl StripeClient {
    pub fn from_env() -> Self {
        Self::new(
            config::STRIPE_API_BASE.as_str(),
            config::STRIPE_SECRET_KEY.as_str(),
        )
    }

    pub fn new(base: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("client build"),
        }
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = format!("{}/v1/{}", self.base, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .query(query)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("stripe GET {path} failed ({status}): {body}"));
        }
        Ok(response.json().await?)
    }

    async fn post_form(&self, path: &str, form: &[(String, String)]) -> Result<Value> {
        let url = format!("{}/v1/{}", self.base, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("stripe POST {path} failed ({status}): {body}"));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn retrieve_checkout_session(&self, session_id: &str) -> Result<Value> {
        self.get(
            &format!("checkout/sessions/{session_id}"),
            &[("expand[]", "subscription"), ("expand[]", "customer")],
        )
        .await
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<Value> {
        self.get(
            &format!("subscriptions/{subscription_id}"),
            &[("expand[]", "items.data.price")],
        )
        .await
    }

    async fn create_checkout_session(
        &self,
        line_items: &[(String, i64)],
        customer_email: &str,
        metadata: &[(String, String)],
    ) -> Result<Value> {
        let mut form: Vec<(String, String)> = vec![
            ("ui_mode".to_string(), "embedded".to_string()),
            ("mode".to_string(), "subscription".to_string()),
            ("customer_email".to_string(), customer_email.to_string()),
            (
                "return_url".to_string(),
                format!(
                    "{}?session_id={{CHECKOUT_SESSION_ID}}",
                    config::CHECKOUT_RETURN_URL.as_str()
                ),
            ),
        ];
        for (index, (price_id, quantity)) in line_items.iter().enumerate() {
            form.push((format!("line_items[{index}][price]"), price_id.clone()));
            form.push((format!("line_items[{index}][quantity]"), quantity.to_string()));
        }
        for (key, value) in metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }
        self.post_form("checkout/sessions", &form).await
    }
}
