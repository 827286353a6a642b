pub mod events;
pub mod processor;
pub mod stripe;

pub use events::{extract_line_items, extract_session_email, parse_event, WebhookEvent};
pub use processor::BillingEventProcessor;
pub use stripe::{BillingProvider, StripeClient};
