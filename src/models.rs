use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// key: entitlement-models -> products,prices,instances,cache
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Product {
    pub id: i32,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub is_active: bool,
    pub parent_id: Option<i32>,
    pub requires_instance: bool,
    pub standalone_url: String,
    /// Expected Stripe product id; drift between this and webhook payloads
    /// is logged but never blocks caching.
    pub stripe_product_id: Option<String>,
    /// Provisioner-kind tag for the registry. Unmapped tags use the
    /// configured default variant.
    pub provisioner: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProductPrice {
    pub id: i32,
    pub product_id: i32,
    pub stripe_price_id: String,
    pub billing_period: String,
    pub amount_cents: i32,
    pub currency: String,
    pub is_active: bool,
}

/// One capacity-bounded deployment of a product. `soft_cap` and `hard_cap`
/// are advisory thresholds for operators; only `allocation_cap` is enforced
/// by the allocator.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Instance {
    pub id: i32,
    pub product_id: i32,
    pub name: String,
    pub base_url: String,
    pub soft_cap: i32,
    pub allocation_cap: i32,
    pub hard_cap: i32,
    pub allocated_seats: i32,
    pub is_active: bool,
    pub auto_allocate: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i32,
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub keycloak_id: String,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub subscription_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// Statuses that still grant access. `past_due` keeps grace-period
    /// access; `canceled` grants none.
    pub fn has_entitled_status(&self) -> bool {
        matches!(
            self.subscription_status.as_str(),
            "active" | "trialing" | "past_due"
        )
    }
}

/// Local mirror of one Stripe subscription line item. Rebuilt wholesale by
/// `EntitlementStore::replace_subscription_items`, never patched in place.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: i32,
    pub profile_id: i32,
    pub product_id: i32,
    pub stripe_price_id: String,
    pub quantity: i32,
}
