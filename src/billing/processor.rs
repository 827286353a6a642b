use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};

use super::events::{self, WebhookEvent};
use super::stripe::BillingProvider;
use crate::job_queue::{self, Job};
use crate::keycloak::IdentityProvider;
use crate::models::UserProfile;
use crate::reconciler::EntitlementReconciler;
use crate::store::EntitlementStore;

/// key: billing-event-processor -> webhook dispatch table
///
/// Every handler is keyed off durable external ids and uses upsert/replace
/// semantics, so replaying an event reproduces the same end state, and no
/// handler assumes delivery order.
#[derive(Clone)]
pub struct BillingEventProcessor {
    store: EntitlementStore,
    reconciler: EntitlementReconciler,
    idp: Arc<dyn IdentityProvider>,
    billing: Arc<dyn BillingProvider>,
    jobs: Sender<Job>,
}

impl BillingEventProcessor {
    pub fn new(
        store: EntitlementStore,
        reconciler: EntitlementReconciler,
        idp: Arc<dyn IdentityProvider>,
        billing: Arc<dyn BillingProvider>,
        jobs: Sender<Job>,
    ) -> Self {
        Self {
            store,
            reconciler,
            idp,
            billing,
            jobs,
        }
    }

    pub async fn handle_event(&self, event: WebhookEvent) -> Result<()> {
        info!(event_id = %event.id, kind = %event.kind, "billing event received");
        match event.kind.as_str() {
            "checkout.session.completed" => self.handle_checkout_completed(event.data.object).await,
            "customer.subscription.updated" => {
                self.handle_subscription_updated(event.data.object).await
            }
            "customer.subscription.deleted" => {
                self.handle_subscription_deleted(event.data.object).await
            }
            "invoice.payment_failed" => self.handle_payment_failed(event.data.object).await,
            other => {
                // The provider retries on non-2xx indefinitely; unknown
                // types are acknowledged, never failed.
                warn!(kind = %other, "unhandled billing event type");
                Ok(())
            }
        }
    }

    /// Re-pull the subscription from the provider and rebuild the local
    /// cache from it. Recovery path for webhooks that were dropped or
    /// delivered while the service was down.
    pub async fn refresh_subscription_items(&self, profile: &UserProfile) -> Result<()> {
        let subscription = self
            .billing
            .retrieve_subscription(&profile.stripe_subscription_id)
            .await?;

        if let Some(status) = subscription.get("status").and_then(|v| v.as_str()) {
            self.store.set_subscription_status(profile.id, status).await?;
        }
        self.store
            .replace_subscription_items(profile.id, &events::extract_line_items(&subscription))
            .await?;
        self.reconciler.sync_entitlements(profile.id).await?;

        info!(
            profile_id = profile.id,
            subscription_id = %profile.stripe_subscription_id,
            "subscription cache refreshed from provider"
        );
        Ok(())
    }

    /// Critical path runs synchronously: expand the session, resolve or
    /// create the identity-provider account, persist the profile with its
    /// billing ids, fill the line-item cache. The follow-ups (welcome
    /// email, entitlement sync) are independent fire-and-forget jobs
    /// submitted only after the state they depend on is committed.
    async fn handle_checkout_completed(&self, session: Value) -> Result<()> {
        let session_id = session
            .get("id")
            .and_then(|v| v.as_str())
            .context("checkout session payload missing id")?
            .to_string();
        let session = self.billing.retrieve_checkout_session(&session_id).await?;

        if session.get("mode").and_then(|v| v.as_str()) != Some("subscription") {
            info!(%session_id, "skipping non-subscription checkout session");
            return Ok(());
        }

        let Some(email) = events::extract_session_email(&session) else {
            warn!(%session_id, "checkout session has no customer email");
            return Ok(());
        };
        let metadata = session.get("metadata").cloned().unwrap_or(Value::Null);
        let meta = |key: &str| {
            metadata
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let mut username = meta("username");
        if username.is_empty() {
            username = email.split('@').next().unwrap_or(&email).to_string();
        }

        // Account creation is the critical path: a failure here aborts the
        // handler and surfaces as a 500 so the provider retries the event.
        let (keycloak_id, is_new_user) = match self.idp.get_user_by_email(&email).await? {
            Some(user) => {
                let id = user
                    .get("id")
                    .and_then(|v| v.as_str())
                    .context("identity-provider user missing id")?
                    .to_string();
                info!(keycloak_id = %id, %email, "found existing identity-provider account");
                (id, false)
            }
            None => {
                let id = self
                    .idp
                    .create_user(&email, &username, &meta("first_name"), &meta("last_name"))
                    .await?;
                (id, true)
            }
        };

        let profile = self
            .store
            .upsert_profile(&email, &username, &meta("first_name"), &meta("last_name"))
            .await?;
        let customer_id = session
            .get("customer")
            .and_then(events::extract_object_id)
            .unwrap_or_default();
        let subscription = session.get("subscription").cloned().unwrap_or(Value::Null);
        let subscription_id = events::extract_object_id(&subscription).unwrap_or_default();
        let profile = self
            .store
            .attach_billing_identity(
                profile.id,
                &keycloak_id,
                &customer_id,
                &subscription_id,
                "active",
            )
            .await?;

        self.store
            .replace_subscription_items(profile.id, &events::extract_line_items(&subscription))
            .await?;

        if is_new_user {
            job_queue::submit(
                self.store.pool(),
                &self.jobs,
                Job::SendPasswordReset {
                    keycloak_id: keycloak_id.clone(),
                },
            )
            .await;
        }
        job_queue::submit(
            self.store.pool(),
            &self.jobs,
            Job::SyncEntitlements {
                profile_id: profile.id,
            },
        )
        .await;

        info!(
            %session_id,
            profile_id = profile.id,
            %keycloak_id,
            "checkout session processed"
        );
        Ok(())
    }

    async fn handle_subscription_updated(&self, subscription: Value) -> Result<()> {
        let Some(subscription_id) = subscription.get("id").and_then(|v| v.as_str()) else {
            warn!("subscription update payload missing id");
            return Ok(());
        };
        // Duplicate and out-of-order deliveries are expected; a missing
        // profile is a no-op, never an error.
        let Some(profile) = self.store.profile_by_subscription_id(subscription_id).await? else {
            warn!(%subscription_id, "no profile for updated subscription");
            return Ok(());
        };

        let status = subscription
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("active");
        self.store.set_subscription_status(profile.id, status).await?;
        self.store
            .replace_subscription_items(profile.id, &events::extract_line_items(&subscription))
            .await?;
        self.reconciler.sync_entitlements(profile.id).await?;

        // A subscription back in good standing re-enables the account,
        // covering "payment method fixed after failure".
        if matches!(status, "active" | "trialing") && !profile.keycloak_id.is_empty() {
            if self.idp.set_user_enabled(&profile.keycloak_id, true).await? {
                info!(
                    keycloak_id = %profile.keycloak_id,
                    %status,
                    "re-enabled identity-provider account"
                );
            }
        }

        info!(%subscription_id, profile_id = profile.id, %status, "subscription updated");
        Ok(())
    }

    /// Entitlements and seat counts are intentionally left in place so a
    /// later resubscribe needs no re-provisioning; only the account is
    /// disabled.
    async fn handle_subscription_deleted(&self, subscription: Value) -> Result<()> {
        let Some(subscription_id) = subscription.get("id").and_then(|v| v.as_str()) else {
            warn!("subscription delete payload missing id");
            return Ok(());
        };
        let Some(profile) = self.store.profile_by_subscription_id(subscription_id).await? else {
            warn!(%subscription_id, "no profile for deleted subscription");
            return Ok(());
        };

        self.store
            .set_subscription_status(profile.id, "canceled")
            .await?;
        self.store.replace_subscription_items(profile.id, &[]).await?;

        if !profile.keycloak_id.is_empty() {
            self.idp.set_user_enabled(&profile.keycloak_id, false).await?;
            self.idp.logout_user_sessions(&profile.keycloak_id).await?;
            info!(
                keycloak_id = %profile.keycloak_id,
                "disabled account and cleared sessions after cancellation"
            );
        }

        job_queue::submit(
            self.store.pool(),
            &self.jobs,
            Job::NotifySubscriptionCanceled {
                email: profile.email.clone(),
                first_name: profile.first_name.clone(),
            },
        )
        .await;

        info!(%subscription_id, profile_id = profile.id, "subscription canceled");
        Ok(())
    }

    /// Mirrors the cancellation rationale: suspend access at the account
    /// level, leave entitlements and seats untouched until resolution.
    async fn handle_payment_failed(&self, invoice: Value) -> Result<()> {
        let Some(subscription_id) = invoice
            .get("subscription")
            .and_then(events::extract_object_id)
        else {
            return Ok(());
        };
        let Some(profile) = self
            .store
            .profile_by_subscription_id(&subscription_id)
            .await?
        else {
            warn!(%subscription_id, "no profile for failed payment");
            return Ok(());
        };

        self.store.set_subscription_status(profile.id, "past_due").await?;

        if !profile.keycloak_id.is_empty() {
            self.idp.set_user_enabled(&profile.keycloak_id, false).await?;
            self.idp.logout_user_sessions(&profile.keycloak_id).await?;
            info!(
                keycloak_id = %profile.keycloak_id,
                "disabled account and cleared sessions after failed payment"
            );
        }

        job_queue::submit(
            self.store.pool(),
            &self.jobs,
            Job::NotifyPaymentFailed {
                email: profile.email.clone(),
                first_name: profile.first_name.clone(),
            },
        )
        .await;

        info!(%subscription_id, profile_id = profile.id, "payment failure recorded");
        Ok(())
    }
}
