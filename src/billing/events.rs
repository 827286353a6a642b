use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::store::LineItem;

/// Inbound billing event envelope. Parsing happens exactly once, here at
/// the boundary; the core never branches on payload shape again.
#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: Value,
}

pub fn parse_event(body: &[u8]) -> Result<WebhookEvent> {
    serde_json::from_slice(body).context("malformed billing event payload")
}

/// Flatten a subscription object's line items into the canonical shape.
///
/// Payloads differ between real checkouts, CLI triggers, and expanded vs
/// unexpanded objects: `price` may be an object or a bare id string,
/// `quantity` may be missing, and an unexpanded subscription is just an id
/// string with no items at all.
pub fn extract_line_items(subscription: &Value) -> Vec<LineItem> {
    let Some(items) = subscription
        .get("items")
        .and_then(|items| items.get("data"))
        .and_then(|data| data.as_array())
    else {
        return Vec::new();
    };

    let mut line_items = Vec::new();
    for item in items {
        let price = item.get("price");
        let (price_id, product_id) = match price {
            Some(Value::String(id)) => (Some(id.clone()), None),
            Some(Value::Object(price)) => {
                let id = price.get("id").and_then(|v| v.as_str()).map(String::from);
                let product = match price.get("product") {
                    Some(Value::String(product)) => Some(product.clone()),
                    Some(Value::Object(product)) => product
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    _ => None,
                };
                (id, product)
            }
            _ => (None, None),
        };
        let Some(price_id) = price_id else {
            continue;
        };
        line_items.push(LineItem {
            price_id,
            product_id,
            quantity: item.get("quantity").and_then(|v| v.as_i64()).unwrap_or(1),
        });
    }
    line_items
}

/// Try several locations for the checkout customer email; payload shape
/// varies with how the session was created and expanded.
pub fn extract_session_email(session: &Value) -> Option<String> {
    if let Some(email) = session
        .get("customer_details")
        .and_then(|details| details.get("email"))
        .and_then(|v| v.as_str())
    {
        return Some(email.to_string());
    }
    if let Some(email) = session.get("customer_email").and_then(|v| v.as_str()) {
        return Some(email.to_string());
    }
    if let Some(email) = session
        .get("customer")
        .and_then(|customer| customer.get("email"))
        .and_then(|v| v.as_str())
    {
        return Some(email.to_string());
    }
    session
        .get("metadata")
        .and_then(|metadata| metadata.get("email"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// The customer/subscription fields of an expanded session may be bare id
/// strings or expanded objects.
pub fn extract_object_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Object(object) => object.get("id").and_then(|v| v.as_str()).map(String::from),
        _ => None,
    }
}
