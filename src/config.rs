use once_cell::sync::Lazy;

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// Shared secret used to verify inbound Stripe webhook signatures.
/// Must be set via `STRIPE_WEBHOOK_SECRET`.
pub static STRIPE_WEBHOOK_SECRET: Lazy<String> = Lazy::new(|| {
    std::env::var("STRIPE_WEBHOOK_SECRET").expect("STRIPE_WEBHOOK_SECRET must be set")
});

/// API key for outbound Stripe calls.
pub static STRIPE_SECRET_KEY: Lazy<String> =
    Lazy::new(|| std::env::var("STRIPE_SECRET_KEY").unwrap_or_default());

/// Stripe API base URL, overridable for tests.
pub static STRIPE_API_BASE: Lazy<String> = Lazy::new(|| {
    std::env::var("STRIPE_API_BASE").unwrap_or_else(|_| "https://api.stripe.com".to_string())
});

/// URL the hosted checkout redirects back to on completion.
pub static CHECKOUT_RETURN_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("CHECKOUT_RETURN_URL")
        .unwrap_or_else(|_| "https://dash.example.com/onboarding/success/".to_string())
});

/// Keycloak server base URL, e.g. `https://id.example.com`.
pub static KEYCLOAK_SERVER_URL: Lazy<String> =
    Lazy::new(|| std::env::var("KEYCLOAK_SERVER_URL").unwrap_or_default());

/// Keycloak realm containing end-user accounts.
pub static KEYCLOAK_REALM: Lazy<String> =
    Lazy::new(|| std::env::var("KEYCLOAK_REALM").unwrap_or_else(|_| "master".to_string()));

/// Service-account client id used for the admin API.
pub static KEYCLOAK_ADMIN_CLIENT_ID: Lazy<String> =
    Lazy::new(|| std::env::var("KEYCLOAK_ADMIN_CLIENT_ID").unwrap_or_default());

/// Service-account client secret used for the admin API.
pub static KEYCLOAK_ADMIN_CLIENT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("KEYCLOAK_ADMIN_CLIENT_SECRET").unwrap_or_default());

/// Mailgun sending domain.
pub static MAILGUN_DOMAIN: Lazy<String> =
    Lazy::new(|| std::env::var("MAILGUN_DOMAIN").unwrap_or_default());

/// Mailgun API key.
pub static MAILGUN_API_KEY: Lazy<String> =
    Lazy::new(|| std::env::var("MAILGUN_API_KEY").unwrap_or_default());

/// Mailgun API base URL, overridable for tests.
pub static MAILGUN_API_BASE: Lazy<String> = Lazy::new(|| {
    std::env::var("MAILGUN_API_BASE").unwrap_or_else(|_| "https://api.mailgun.net".to_string())
});

/// Customer-facing dashboard URL used in notification copy.
pub static DASHBOARD_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("DASHBOARD_URL").unwrap_or_else(|_| "https://dash.example.com".to_string())
});

/// Provisioner variant used for products without an explicit mapping.
/// Accepts `group_based` or `standalone`; defaults to `standalone`.
pub static DEFAULT_PROVISIONER: Lazy<String> = Lazy::new(|| {
    std::env::var("DEFAULT_PROVISIONER").unwrap_or_else(|_| "standalone".to_string())
});

/// Maximum age (seconds) accepted for a webhook signature timestamp.
pub static WEBHOOK_SIGNATURE_TOLERANCE_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("WEBHOOK_SIGNATURE_TOLERANCE_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});
