use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::billing::{BillingEventProcessor, BillingProvider};
use crate::error::{AppError, AppResult};
use crate::models::{Product, ProductPrice};
use crate::reconciler::EntitlementReconciler;
use crate::store::EntitlementStore;

#[derive(Debug, Serialize)]
pub struct CatalogEntry {
    pub product: Product,
    pub prices: Vec<ProductPrice>,
}

/// Active catalog with prices, grouped per product.
pub async fn list_products(
    Extension(pool): Extension<PgPool>,
) -> AppResult<Json<Vec<CatalogEntry>>> {
    let store = EntitlementStore::new(pool);
    let products = store.active_products().await?;
    let mut prices_by_product: HashMap<i32, Vec<ProductPrice>> = HashMap::new();
    for price in store.active_prices().await? {
        prices_by_product.entry(price.product_id).or_default().push(price);
    }
    let catalog = products
        .into_iter()
        .map(|product| {
            let prices = prices_by_product.remove(&product.id).unwrap_or_default();
            CatalogEntry { product, prices }
        })
        .collect();
    Ok(Json(catalog))
}

/// Products the profile is currently entitled to, from the local cache.
pub async fn subscribed_products(
    Extension(pool): Extension<PgPool>,
    Path(profile_id): Path<i32>,
) -> AppResult<Json<Vec<Product>>> {
    let store = EntitlementStore::new(pool);
    let profile = store
        .profile_by_id(profile_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let products = store.subscribed_products(&profile).await?;
    Ok(Json(products))
}

/// Manual reconciliation trigger for operators and recovery tooling.
pub async fn sync_entitlements(
    Extension(pool): Extension<PgPool>,
    Extension(reconciler): Extension<EntitlementReconciler>,
    Path(profile_id): Path<i32>,
) -> AppResult<StatusCode> {
    let store = EntitlementStore::new(pool);
    if store.profile_by_id(profile_id).await?.is_none() {
        return Err(AppError::NotFound);
    }
    reconciler.sync_entitlements(profile_id).await?;
    Ok(StatusCode::OK)
}

/// Re-pull the profile's subscription from the billing provider and
/// rebuild the local cache, for profiles whose webhooks were missed.
pub async fn refresh_subscription(
    Extension(pool): Extension<PgPool>,
    Extension(processor): Extension<BillingEventProcessor>,
    Path(profile_id): Path<i32>,
) -> AppResult<StatusCode> {
    let store = EntitlementStore::new(pool);
    let profile = store
        .profile_by_id(profile_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if profile.stripe_subscription_id.is_empty() {
        return Err(AppError::BadRequest(
            "profile has no subscription on record".into(),
        ));
    }
    processor.refresh_subscription_items(&profile).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub username: String,
    pub plan: String,
    #[serde(default = "default_billing_cycle")]
    pub billing_cycle: String,
    #[serde(default)]
    pub addons: Vec<String>,
}

fn default_billing_cycle() -> String {
    "monthly".to_string()
}

#[derive(Debug, Serialize)]
pub struct CreateCheckoutResponse {
    pub client_secret: Option<String>,
}

/// Create a hosted checkout session for a plan plus optional add-ons.
/// The plan slug must name a live product; add-on slugs with no active
/// price for the requested cycle are skipped.
pub async fn create_checkout_session(
    Extension(pool): Extension<PgPool>,
    Extension(billing): Extension<Arc<dyn BillingProvider>>,
    Json(request): Json<CreateCheckoutRequest>,
) -> AppResult<Json<CreateCheckoutResponse>> {
    if request.email.is_empty() {
        return Err(AppError::BadRequest("email is required".into()));
    }

    let store = EntitlementStore::new(pool);
    if !store
        .product_by_slug(&request.plan)
        .await?
        .map(|product| product.is_active)
        .unwrap_or(false)
    {
        return Err(AppError::BadRequest(format!(
            "unknown plan: {}",
            request.plan
        )));
    }

    let products = store.active_products().await?;
    let prices = store.active_prices().await?;
    let slug_by_product: HashMap<i32, &str> = products
        .iter()
        .map(|product| (product.id, product.slug.as_str()))
        .collect();
    let mut price_for_slug: HashMap<(&str, &str), &str> = HashMap::new();
    for price in &prices {
        if let Some(slug) = slug_by_product.get(&price.product_id) {
            price_for_slug.insert(
                (*slug, price.billing_period.as_str()),
                price.stripe_price_id.as_str(),
            );
        }
    }

    let mut line_items: Vec<(String, i64)> = Vec::new();
    for slug in std::iter::once(request.plan.as_str())
        .chain(request.addons.iter().map(String::as_str))
    {
        if let Some(price_id) = price_for_slug.get(&(slug, request.billing_cycle.as_str())) {
            line_items.push((price_id.to_string(), 1));
        }
    }
    if line_items.is_empty() {
        return Err(AppError::BadRequest(
            "no valid plan or add-ons for the requested billing cycle".into(),
        ));
    }

    let metadata = vec![
        ("first_name".to_string(), request.first_name.clone()),
        ("last_name".to_string(), request.last_name.clone()),
        ("username".to_string(), request.username.clone()),
        ("email".to_string(), request.email.clone()),
    ];
    let session = billing
        .create_checkout_session(&line_items, &request.email, &metadata)
        .await?;

    Ok(Json(CreateCheckoutResponse {
        client_secret: session
            .get("client_secret")
            .and_then(|v| v.as_str())
            .map(String::from),
    }))
}
