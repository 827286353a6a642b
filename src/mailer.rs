use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;

use crate::config;

/// Outbound notification sender. Failures are errors so the job worker
/// retries them; they never run inline with webhook handling.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, text: &str, html: &str) -> Result<()>;
}

pub struct MailgunMailer {
    base: String,
    domain: String,
    api_key: String,
    client: Client,
}

impl MailgunMailer {
    pub fn from_env() -> Self {
        Self::new(
            config::MAILGUN_API_BASE.as_str(),
            config::MAILGUN_DOMAIN.as_str(),
            config::MAILGUN_API_KEY.as_str(),
        )
    }

    pub fn new(
        base: impl Into<String>,
        domain: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            domain: domain.into(),
            api_key: api_key.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("client build"),
        }
    }
}

#[async_trait]
impl Mailer for MailgunMailer {
    async fn send(&self, to: &str, subject: &str, text: &str, html: &str) -> Result<()> {
        let url = format!("{}/v3/{}/messages", self.base, self.domain);
        let from = format!("Dashboard <no-reply@{}>", self.domain);
        let response = self
            .client
            .post(&url)
            .basic_auth("api", Some(&self.api_key))
            .form(&[
                ("from", from.as_str()),
                ("to", to),
                ("subject", subject),
                ("text", text),
                ("html", html),
            ])
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::error!(%status, %body, "mailgun send failed");
        Err(anyhow!("mailgun send failed ({status})"))
    }
}

pub fn canceled_subject() -> &'static str {
    "Your subscription has been canceled"
}

pub fn canceled_body(first_name: &str) -> (String, String) {
    let name = if first_name.is_empty() { "there" } else { first_name };
    let dashboard = config::DASHBOARD_URL.as_str();
    let text = format!(
        "Hi {name},\n\nYour subscription has been canceled and your access has been \
         suspended.\n\nIf this was a mistake or you'd like to resubscribe, visit {dashboard} \
         to get started again.\n\nIf you have any questions, reply to this email and we'll help."
    );
    let html = format!(
        "<p>Hi {name},</p><p>Your subscription has been canceled and your access has been \
         suspended.</p><p>If this was a mistake or you'd like to resubscribe, \
         <a href=\"{dashboard}\">visit your dashboard</a> to get started again.</p>"
    );
    (text, html)
}

pub fn payment_failed_subject() -> &'static str {
    "Action required: payment failed"
}

pub fn payment_failed_body(first_name: &str) -> (String, String) {
    let name = if first_name.is_empty() { "there" } else { first_name };
    let dashboard = config::DASHBOARD_URL.as_str();
    let text = format!(
        "Hi {name},\n\nWe were unable to process your latest payment. Your access has been \
         temporarily suspended until this is resolved.\n\nPlease update your payment method at \
         {dashboard} to restore access."
    );
    let html = format!(
        "<p>Hi {name},</p><p>We were unable to process your latest payment. Your access has \
         been temporarily suspended until this is resolved.</p><p>Please \
         <a href=\"{dashboard}\">update your payment method</a> to restore access.</p>"
    );
    (text, html)
}
