pub mod allocator;
pub mod api;
pub mod billing;
pub mod config;
pub mod error;
pub mod job_queue;
pub mod keycloak;
pub mod mailer;
pub mod models;
pub mod provisioner;
pub mod reconciler;
pub mod routes;
pub mod store;
pub mod webhooks;
