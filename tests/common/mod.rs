#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::PgPool;

use entitlements::billing::BillingProvider;
use entitlements::keycloak::{IdentityProvider, KeycloakResult};
use entitlements::mailer::Mailer;

/// In-memory identity provider recording every mutation so tests can
/// assert on side effects without a Keycloak server.
#[derive(Default)]
pub struct FakeIdentityProvider {
    /// email -> user id
    pub users: Mutex<HashMap<String, String>>,
    /// group name -> group id
    pub groups: Mutex<HashMap<String, String>>,
    /// (user id, group id) pairs currently in effect
    pub memberships: Mutex<Vec<(String, String)>>,
    pub attributes: Mutex<HashMap<String, HashMap<String, String>>>,
    pub enabled: Mutex<HashMap<String, bool>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(self, name: &str) -> Self {
        self.groups
            .lock()
            .unwrap()
            .insert(name.to_string(), format!("g-{name}"));
        self
    }

    pub fn with_user(self, email: &str, id: &str) -> Self {
        self.users
            .lock()
            .unwrap()
            .insert(email.to_string(), id.to_string());
        self
    }

    pub fn member_groups(&self, user_id: &str) -> Vec<String> {
        self.memberships
            .lock()
            .unwrap()
            .iter()
            .filter(|(uid, _)| uid == user_id)
            .map(|(_, gid)| gid.clone())
            .collect()
    }

    pub fn attributes_for(&self, user_id: &str) -> HashMap<String, String> {
        self.attributes
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn create_user(
        &self,
        email: &str,
        _username: &str,
        _first_name: &str,
        _last_name: &str,
    ) -> KeycloakResult<String> {
        let mut users = self.users.lock().unwrap();
        let id = format!("kc-{}", users.len() + 1);
        users.insert(email.to_string(), id.clone());
        drop(users);
        self.record(format!("create_user:{email}"));
        Ok(id)
    }

    async fn get_user_by_email(&self, email: &str) -> KeycloakResult<Option<Value>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(email)
            .map(|id| json!({ "id": id, "email": email })))
    }

    async fn get_user_by_username(&self, username: &str) -> KeycloakResult<Option<Value>> {
        self.get_user_by_email(username).await
    }

    async fn set_user_enabled(&self, user_id: &str, enabled: bool) -> KeycloakResult<bool> {
        self.enabled
            .lock()
            .unwrap()
            .insert(user_id.to_string(), enabled);
        self.record(format!("set_user_enabled:{user_id}:{enabled}"));
        Ok(true)
    }

    async fn logout_user_sessions(&self, user_id: &str) -> KeycloakResult<bool> {
        self.record(format!("logout_user_sessions:{user_id}"));
        Ok(true)
    }

    async fn get_group_by_name(&self, group_name: &str) -> KeycloakResult<Option<Value>> {
        Ok(self
            .groups
            .lock()
            .unwrap()
            .get(group_name)
            .map(|id| json!({ "id": id, "name": group_name })))
    }

    async fn add_user_to_group(&self, user_id: &str, group_id: &str) -> KeycloakResult<bool> {
        let mut memberships = self.memberships.lock().unwrap();
        let pair = (user_id.to_string(), group_id.to_string());
        if !memberships.contains(&pair) {
            memberships.push(pair);
        }
        drop(memberships);
        self.record(format!("add_user_to_group:{user_id}:{group_id}"));
        Ok(true)
    }

    async fn remove_user_from_group(&self, user_id: &str, group_id: &str) -> KeycloakResult<bool> {
        self.memberships
            .lock()
            .unwrap()
            .retain(|(uid, gid)| !(uid == user_id && gid == group_id));
        self.record(format!("remove_user_from_group:{user_id}:{group_id}"));
        Ok(true)
    }

    /// Mirrors `KeycloakAdmin`: merge into the stored representation, with
    /// an empty value removing the key.
    async fn update_user_attributes(
        &self,
        user_id: &str,
        attributes: &HashMap<String, String>,
    ) -> KeycloakResult<bool> {
        let mut all = self.attributes.lock().unwrap();
        let merged = all.entry(user_id.to_string()).or_default();
        for (key, value) in attributes {
            if value.is_empty() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        drop(all);
        self.record(format!("update_user_attributes:{user_id}"));
        Ok(true)
    }

    async fn send_reset_password_email(&self, user_id: &str) -> KeycloakResult<bool> {
        self.record(format!("send_reset_password_email:{user_id}"));
        Ok(true)
    }
}

/// Returns canned session/subscription objects keyed by id.
#[derive(Default)]
pub struct FakeBilling {
    pub sessions: Mutex<HashMap<String, Value>>,
    pub subscriptions: Mutex<HashMap<String, Value>>,
}

impl FakeBilling {
    pub fn with_session(self, id: &str, session: Value) -> Self {
        self.sessions.lock().unwrap().insert(id.to_string(), session);
        self
    }

    pub fn with_subscription(self, id: &str, subscription: Value) -> Self {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id.to_string(), subscription);
        self
    }
}

#[async_trait]
impl BillingProvider for FakeBilling {
    async fn retrieve_checkout_session(&self, session_id: &str) -> Result<Value> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| anyhow!("no such checkout session: {session_id}"))
    }

    async fn retrieve_subscription(&self, subscription_id: &str) -> Result<Value> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| anyhow!("no such subscription: {subscription_id}"))
    }

    async fn create_checkout_session(
        &self,
        _line_items: &[(String, i64)],
        _customer_email: &str,
        _metadata: &[(String, String)],
    ) -> Result<Value> {
        Ok(json!({ "id": "cs_test", "client_secret": "cs_test_secret" }))
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, _text: &str, _html: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string()));
        Ok(())
    }
}

pub async fn seed_product(
    pool: &PgPool,
    name: &str,
    slug: &str,
    requires_instance: bool,
    provisioner: Option<&str>,
) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO products (name, slug, requires_instance, provisioner) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(name)
    .bind(slug)
    .bind(requires_instance)
    .bind(provisioner)
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn seed_price(pool: &PgPool, product_id: i32, stripe_price_id: &str) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO product_prices (product_id, stripe_price_id, billing_period, amount_cents) \
         VALUES ($1, $2, 'monthly', 1900) RETURNING id",
    )
    .bind(product_id)
    .bind(stripe_price_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn seed_instance(
    pool: &PgPool,
    product_id: i32,
    name: &str,
    allocated_seats: i32,
    allocation_cap: i32,
) -> i32 {
    let instance_id: i32 = sqlx::query_scalar(
        "INSERT INTO instances (product_id, name, base_url, allocated_seats, allocation_cap) \
         VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(product_id)
    .bind(name)
    .bind(format!("https://{name}.example.com"))
    .bind(allocated_seats)
    .bind(allocation_cap)
    .fetch_one(pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO instance_groups (instance_id, group_name) VALUES ($1, $2)")
        .bind(instance_id)
        .bind(format!("{name}-users"))
        .execute(pool)
        .await
        .unwrap();
    instance_id
}

pub async fn seed_profile(pool: &PgPool, email: &str, keycloak_id: &str, status: &str) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO user_profiles (email, keycloak_id, subscription_status, stripe_subscription_id) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(email)
    .bind(keycloak_id)
    .bind(status)
    .bind(format!("sub_{}", email.split('@').next().unwrap()))
    .fetch_one(pool)
    .await
    .unwrap()
}

pub async fn cache_item(pool: &PgPool, profile_id: i32, product_id: i32, price_id: &str) {
    sqlx::query(
        "INSERT INTO subscription_items (profile_id, product_id, stripe_price_id) \
         VALUES ($1, $2, $3)",
    )
    .bind(profile_id)
    .bind(product_id)
    .bind(price_id)
    .execute(pool)
    .await
    .unwrap();
}

pub async fn allocated_seats(pool: &PgPool, instance_id: i32) -> i32 {
    sqlx::query_scalar("SELECT allocated_seats FROM instances WHERE id = $1")
        .bind(instance_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub async fn profile_group_names(pool: &PgPool, profile_id: i32) -> Vec<String> {
    sqlx::query_scalar(
        "SELECT group_name FROM profile_groups WHERE profile_id = $1 ORDER BY group_name",
    )
    .bind(profile_id)
    .fetch_all(pool)
    .await
    .unwrap()
}
