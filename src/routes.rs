use axum::{
    routing::{get, post},
    Router,
};

use crate::{api, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/products", get(api::list_products))
        .route(
            "/api/profiles/:id/products",
            get(api::subscribed_products),
        )
        .route(
            "/api/profiles/:id/entitlements/sync",
            post(api::sync_entitlements),
        )
        .route(
            "/api/profiles/:id/subscription/refresh",
            post(api::refresh_subscription),
        )
        .route("/api/checkout/session", post(api::create_checkout_session))
        .route("/webhooks/stripe", post(webhooks::stripe_webhook))
}
