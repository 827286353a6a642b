use std::collections::HashMap;

use anyhow::{anyhow, Result};
use sqlx::PgPool;
use tracing::warn;

use crate::models::{Instance, Product, ProductPrice, SubscriptionItem, UserProfile};

/// Canonical billing line item. Produced once at the webhook boundary by
/// `billing::events`; nothing past that point branches on payload shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    pub price_id: String,
    pub product_id: Option<String>,
    pub quantity: i64,
}

/// key: entitlement-store -> durable product/instance/profile records
#[derive(Clone)]
pub struct EntitlementStore {
    pool: PgPool,
}

impl EntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn product_by_slug(&self, slug: &str) -> Result<Option<Product>> {
        let product = sqlx::query_as::<_, Product>("SELECT * FROM products WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(product)
    }

    pub async fn active_products(&self) -> Result<Vec<Product>> {
        let products = sqlx::query_as::<_, Product>(
            "SELECT * FROM products WHERE is_active = TRUE ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(products)
    }

    pub async fn active_prices(&self) -> Result<Vec<ProductPrice>> {
        let prices = sqlx::query_as::<_, ProductPrice>(
            "SELECT * FROM product_prices WHERE is_active = TRUE ORDER BY product_id, billing_period",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(prices)
    }

    /// Re-parent a product. The schema does not forbid cycles in the parent
    /// chain, so the mutation path has to.
    pub async fn set_product_parent(&self, product_id: i32, parent_id: Option<i32>) -> Result<()> {
        if let Some(parent_id) = parent_id {
            let mut cursor = Some(parent_id);
            while let Some(current) = cursor {
                if current == product_id {
                    return Err(anyhow!(
                        "product {product_id} cannot be parented to {parent_id}: cycle"
                    ));
                }
                cursor = sqlx::query_scalar("SELECT parent_id FROM products WHERE id = $1")
                    .bind(current)
                    .fetch_optional(&self.pool)
                    .await?
                    .flatten();
            }
        }
        sqlx::query("UPDATE products SET parent_id = $2 WHERE id = $1")
            .bind(product_id)
            .bind(parent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn profile_by_id(&self, id: i32) -> Result<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, UserProfile>("SELECT * FROM user_profiles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(profile)
    }

    pub async fn profile_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, UserProfile>(
            "SELECT * FROM user_profiles WHERE stripe_subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(profile)
    }

    /// Create the profile on first checkout, or update naming fields on an
    /// existing one. Keyed on email so duplicate checkout events converge.
    pub async fn upsert_profile(
        &self,
        email: &str,
        username: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<UserProfile> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"
            INSERT INTO user_profiles (email, username, first_name, last_name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email)
            DO UPDATE SET
                username = EXCLUDED.username,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(email)
        .bind(username)
        .bind(first_name)
        .bind(last_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(profile)
    }

    /// Attach external billing/identity ids after the external account is
    /// known to exist, so the profile never references an unset account.
    pub async fn attach_billing_identity(
        &self,
        profile_id: i32,
        keycloak_id: &str,
        customer_id: &str,
        subscription_id: &str,
        status: &str,
    ) -> Result<UserProfile> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"
            UPDATE user_profiles
            SET keycloak_id = $2,
                stripe_customer_id = $3,
                stripe_subscription_id = $4,
                subscription_status = $5,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(profile_id)
        .bind(keycloak_id)
        .bind(customer_id)
        .bind(subscription_id)
        .bind(status)
        .fetch_one(&self.pool)
        .await?;
        Ok(profile)
    }

    pub async fn set_subscription_status(&self, profile_id: i32, status: &str) -> Result<()> {
        sqlx::query(
            "UPDATE user_profiles SET subscription_status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(profile_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replace the profile's subscription-item cache wholesale.
    ///
    /// Price ids that resolve to no product are dropped with a warning; a
    /// mismatch between a product's expected Stripe product id and the
    /// payload's is logged but does not block caching. Delete-all plus
    /// insert-fresh runs in one transaction so readers never observe a
    /// partially-cleared cache.
    pub async fn replace_subscription_items(
        &self,
        profile_id: i32,
        items: &[LineItem],
    ) -> Result<()> {
        let price_ids: Vec<String> = items.iter().map(|item| item.price_id.clone()).collect();
        let resolved: Vec<(String, i32, Option<String>)> = sqlx::query_as(
            r#"
            SELECT pp.stripe_price_id, pp.product_id, p.stripe_product_id
            FROM product_prices pp
            JOIN products p ON p.id = pp.product_id
            WHERE pp.stripe_price_id = ANY($1)
            "#,
        )
        .bind(&price_ids)
        .fetch_all(&self.pool)
        .await?;
        let by_price: HashMap<&str, (i32, Option<&str>)> = resolved
            .iter()
            .map(|(price_id, product_id, expected)| {
                (price_id.as_str(), (*product_id, expected.as_deref()))
            })
            .collect();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM subscription_items WHERE profile_id = $1")
            .bind(profile_id)
            .execute(&mut tx)
            .await?;

        for item in items {
            let Some((product_id, expected_product)) = by_price.get(item.price_id.as_str()) else {
                warn!(
                    price_id = %item.price_id,
                    %profile_id,
                    "no product found for Stripe price; dropping line item"
                );
                continue;
            };
            if let (Some(expected), Some(actual)) = (expected_product, item.product_id.as_deref()) {
                if *expected != actual {
                    warn!(
                        price_id = %item.price_id,
                        %expected,
                        %actual,
                        "Stripe product id drift for cached line item"
                    );
                }
            }
            sqlx::query(
                r#"
                INSERT INTO subscription_items (profile_id, product_id, stripe_price_id, quantity)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (profile_id, stripe_price_id)
                DO UPDATE SET quantity = EXCLUDED.quantity
                "#,
            )
            .bind(profile_id)
            .bind(product_id)
            .bind(&item.price_id)
            .bind(item.quantity.clamp(0, i32::MAX as i64) as i32)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn subscription_items(&self, profile_id: i32) -> Result<Vec<SubscriptionItem>> {
        let items = sqlx::query_as::<_, SubscriptionItem>(
            "SELECT * FROM subscription_items WHERE profile_id = $1 ORDER BY stripe_price_id",
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Distinct active products reachable through the profile's cached
    /// items. A pure function of stored state; no external calls.
    pub async fn subscribed_products(&self, profile: &UserProfile) -> Result<Vec<Product>> {
        if !profile.has_entitled_status() {
            return Ok(Vec::new());
        }
        let products = sqlx::query_as::<_, Product>(
            r#"
            SELECT DISTINCT p.*
            FROM products p
            JOIN subscription_items si ON si.product_id = p.id
            WHERE si.profile_id = $1 AND p.is_active = TRUE
            ORDER BY p.id
            "#,
        )
        .bind(profile.id)
        .fetch_all(&self.pool)
        .await?;
        Ok(products)
    }

    /// Instance-requiring products the profile currently has group access
    /// to, inferred from group membership intersected with instance
    /// ownership.
    pub async fn provisioned_instance_products(&self, profile_id: i32) -> Result<Vec<Product>> {
        let products = sqlx::query_as::<_, Product>(
            r#"
            SELECT DISTINCT p.*
            FROM products p
            JOIN instances i ON i.product_id = p.id
            JOIN instance_groups ig ON ig.instance_id = i.id
            JOIN profile_groups pg
                ON pg.group_name = ig.group_name AND pg.profile_id = $1
            WHERE p.requires_instance = TRUE
            ORDER BY p.id
            "#,
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(products)
    }

    /// Active instances of a product the profile can reach through its
    /// groups. Used to pick the `<slug>_instance` attribute value.
    pub async fn accessible_instances(
        &self,
        profile_id: i32,
        product_id: i32,
    ) -> Result<Vec<Instance>> {
        let instances = sqlx::query_as::<_, Instance>(
            r#"
            SELECT DISTINCT i.*
            FROM instances i
            JOIN instance_groups ig ON ig.instance_id = i.id
            JOIN profile_groups pg
                ON pg.group_name = ig.group_name AND pg.profile_id = $1
            WHERE i.product_id = $2 AND i.is_active = TRUE
            ORDER BY i.name
            "#,
        )
        .bind(profile_id)
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(instances)
    }
}
