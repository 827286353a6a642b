use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::config;

/// Raised when a Keycloak admin API call fails. "Not found" is not a
/// failure; lookups return `Ok(None)` for that case.
#[derive(Debug, Error)]
pub enum KeycloakError {
    #[error("keycloak request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("keycloak call failed ({status}): {message}")]
    Api { status: u16, message: String },
}

pub type KeycloakResult<T> = Result<T, KeycloakError>;

/// Synchronous identity-provider surface consumed by the reconciler and the
/// billing event processor. Injected as a handle so tests can substitute a
/// fake.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create an account and return its id. An existing username/email is
    /// surfaced as an API error, not a panic.
    async fn create_user(
        &self,
        email: &str,
        username: &str,
        first_name: &str,
        last_name: &str,
    ) -> KeycloakResult<String>;
    async fn get_user_by_email(&self, email: &str) -> KeycloakResult<Option<Value>>;
    async fn get_user_by_username(&self, username: &str) -> KeycloakResult<Option<Value>>;
    async fn set_user_enabled(&self, user_id: &str, enabled: bool) -> KeycloakResult<bool>;
    async fn logout_user_sessions(&self, user_id: &str) -> KeycloakResult<bool>;
    async fn get_group_by_name(&self, group_name: &str) -> KeycloakResult<Option<Value>>;
    async fn add_user_to_group(&self, user_id: &str, group_id: &str) -> KeycloakResult<bool>;
    async fn remove_user_from_group(&self, user_id: &str, group_id: &str) -> KeycloakResult<bool>;
    async fn update_user_attributes(
        &self,
        user_id: &str,
        attributes: &HashMap<String, String>,
    ) -> KeycloakResult<bool>;
    async fn send_reset_password_email(&self, user_id: &str) -> KeycloakResult<bool>;
}

/// Keycloak admin API client using service-account credentials.
pub struct KeycloakAdmin {
    server_url: String,
    realm: String,
    client_id: String,
    client_secret: String,
    client: Client,
    access_token: Mutex<Option<String>>,
}

impl KeycloakAdmin {
    pub fn from_env() -> Self {
        Self::new(
            config::KEYCLOAK_SERVER_URL.as_str(),
            config::KEYCLOAK_REALM.as_str(),
            config::KEYCLOAK_ADMIN_CLIENT_ID.as_str(),
            config::KEYCLOAK_ADMIN_CLIENT_SECRET.as_str(),
        )
    }

    pub fn new(
        server_url: impl Into<String>,
        realm: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            realm: realm.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("client build"),
            access_token: Mutex::new(None),
        }
    }

    /// Fetch a fresh access token via the client-credentials grant.
    async fn refresh_token(&self) -> KeycloakResult<String> {
        let url = format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.server_url, self.realm
        );
        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(KeycloakError::Api { status, message });
        }
        let body: Value = response.json().await?;
        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| KeycloakError::Api {
                status: 200,
                message: "token response missing access_token".to_string(),
            })?
            .to_string();
        *self.access_token.lock().await = Some(token.clone());
        Ok(token)
    }

    async fn token(&self) -> KeycloakResult<String> {
        if let Some(token) = self.access_token.lock().await.clone() {
            return Ok(token);
        }
        self.refresh_token().await
    }

    /// Make one authenticated admin request, refreshing the token and
    /// retrying once on 401.
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        query: Option<&[(&str, &str)]>,
        body: Option<&Value>,
    ) -> KeycloakResult<reqwest::Response> {
        let url = format!(
            "{}/admin/realms/{}{}",
            self.server_url, self.realm, endpoint
        );
        let mut token = self.token().await?;
        for attempt in 0..2 {
            let mut req = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&token);
            if let Some(query) = query {
                req = req.query(query);
            }
            if let Some(body) = body {
                req = req.json(body);
            }
            let response = req.send().await?;
            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                token = self.refresh_token().await?;
                continue;
            }
            return Ok(response);
        }
        unreachable!("authenticated request loop exits within two attempts")
    }

    async fn get_user_by_id(&self, user_id: &str) -> KeycloakResult<Option<Value>> {
        let response = self
            .request(Method::GET, &format!("/users/{user_id}"), None, None)
            .await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(KeycloakError::Api {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn search_users(
        &self,
        query: &[(&str, &str)],
    ) -> KeycloakResult<Option<Value>> {
        let response = self.request(Method::GET, "/users", Some(query), None).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(KeycloakError::Api { status, message });
        }
        let users: Vec<Value> = response.json().await?;
        Ok(users.into_iter().next())
    }
}

#[async_trait]
impl IdentityProvider for KeycloakAdmin {
    async fn create_user(
        &self,
        email: &str,
        username: &str,
        first_name: &str,
        last_name: &str,
    ) -> KeycloakResult<String> {
        let username = if username.is_empty() { email } else { username };
        let body = json!({
            "username": username,
            "email": email,
            "firstName": first_name,
            "lastName": last_name,
            "emailVerified": true,
            "enabled": true,
        });
        let response = self
            .request(Method::POST, "/users", None, Some(&body))
            .await?;
        if response.status() != StatusCode::CREATED {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(KeycloakError::Api { status, message });
        }
        // New user id comes back in the Location header.
        let user_id = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .and_then(|location| location.rsplit('/').next())
            .map(|id| id.to_string())
            .ok_or_else(|| KeycloakError::Api {
                status: 201,
                message: "user created but Location header missing".to_string(),
            })?;
        info!(%user_id, %email, "created keycloak user");
        Ok(user_id)
    }

    async fn get_user_by_email(&self, email: &str) -> KeycloakResult<Option<Value>> {
        self.search_users(&[("email", email), ("exact", "true")])
            .await
    }

    async fn get_user_by_username(&self, username: &str) -> KeycloakResult<Option<Value>> {
        self.search_users(&[("username", username), ("exact", "true")])
            .await
    }

    async fn set_user_enabled(&self, user_id: &str, enabled: bool) -> KeycloakResult<bool> {
        let Some(mut user) = self.get_user_by_id(user_id).await? else {
            return Ok(false);
        };
        user["enabled"] = Value::Bool(enabled);
        let response = self
            .request(Method::PUT, &format!("/users/{user_id}"), None, Some(&user))
            .await?;
        Ok(response.status() == StatusCode::NO_CONTENT)
    }

    async fn logout_user_sessions(&self, user_id: &str) -> KeycloakResult<bool> {
        let response = self
            .request(Method::POST, &format!("/users/{user_id}/logout"), None, None)
            .await?;
        Ok(response.status() == StatusCode::NO_CONTENT)
    }

    async fn get_group_by_name(&self, group_name: &str) -> KeycloakResult<Option<Value>> {
        let response = self
            .request(
                Method::GET,
                "/groups",
                Some(&[("search", group_name), ("exact", "true")]),
                None,
            )
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(KeycloakError::Api { status, message });
        }
        let groups: Vec<Value> = response.json().await?;
        // Search can be fuzzy in some Keycloak versions; require the exact name.
        Ok(groups
            .into_iter()
            .find(|group| group.get("name").and_then(|v| v.as_str()) == Some(group_name)))
    }

    async fn add_user_to_group(&self, user_id: &str, group_id: &str) -> KeycloakResult<bool> {
        let response = self
            .request(
                Method::PUT,
                &format!("/users/{user_id}/groups/{group_id}"),
                None,
                None,
            )
            .await?;
        Ok(response.status() == StatusCode::NO_CONTENT)
    }

    async fn remove_user_from_group(&self, user_id: &str, group_id: &str) -> KeycloakResult<bool> {
        let response = self
            .request(
                Method::DELETE,
                &format!("/users/{user_id}/groups/{group_id}"),
                None,
                None,
            )
            .await?;
        Ok(response.status() == StatusCode::NO_CONTENT)
    }

    /// Keycloak's PUT /users/{id} wants the full representation; sending
    /// only attributes can wipe other fields in some versions. GET the
    /// user, merge attributes, strip fields that trigger side effects when
    /// echoed back, then PUT.
    async fn update_user_attributes(
        &self,
        user_id: &str,
        attributes: &HashMap<String, String>,
    ) -> KeycloakResult<bool> {
        let Some(user) = self.get_user_by_id(user_id).await? else {
            return Ok(false);
        };

        let mut merged: serde_json::Map<String, Value> = user
            .get("attributes")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        for (key, value) in attributes {
            if value.is_empty() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), json!([value]));
            }
        }

        let mut payload = serde_json::Map::new();
        for (key, value) in user.as_object().into_iter().flatten() {
            if !matches!(key.as_str(), "attributes" | "requiredActions" | "credentials") {
                payload.insert(key.clone(), value.clone());
            }
        }
        payload.insert("attributes".to_string(), Value::Object(merged));

        let response = self
            .request(
                Method::PUT,
                &format!("/users/{user_id}"),
                None,
                Some(&Value::Object(payload)),
            )
            .await?;
        Ok(response.status() == StatusCode::NO_CONTENT)
    }

    async fn send_reset_password_email(&self, user_id: &str) -> KeycloakResult<bool> {
        let response = self
            .request(
                Method::PUT,
                &format!("/users/{user_id}/execute-actions-email"),
                None,
                Some(&json!(["UPDATE_PASSWORD"])),
            )
            .await?;
        Ok(response.status() == StatusCode::NO_CONTENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn admin(server: &MockServer) -> KeycloakAdmin {
        KeycloakAdmin::new(server.base_url(), "tenants", "svc", "secret")
    }

    fn mock_token(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST)
                .path("/realms/tenants/protocol/openid-connect/token");
            then.status(200)
                .json_body(serde_json::json!({ "access_token": "tok-1" }));
        })
    }

    #[tokio::test]
    async fn lookup_miss_is_not_an_error() {
        let server = MockServer::start();
        let _token = mock_token(&server);
        server.mock(|when, then| {
            when.method(GET)
                .path("/admin/realms/tenants/users")
                .query_param("email", "ghost@example.com");
            then.status(200).json_body(serde_json::json!([]));
        });

        let result = admin(&server)
            .get_user_by_email("ghost@example.com")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_once() {
        let server = MockServer::start();
        let token = mock_token(&server);
        let stale = server.mock(|when, then| {
            when.method(GET)
                .path("/admin/realms/tenants/users")
                .header("authorization", "Bearer tok-1");
            then.status(200)
                .json_body(serde_json::json!([{ "id": "u1", "email": "a@example.com" }]));
        });

        let kc = admin(&server);
        // Seed a stale token so the first call 401s and retries.
        *kc.access_token.lock().await = Some("stale".to_string());
        let unauthorized = server.mock(|when, then| {
            when.method(GET)
                .path("/admin/realms/tenants/users")
                .header("authorization", "Bearer stale");
            then.status(401);
        });

        let user = kc.get_user_by_email("a@example.com").await.unwrap();
        assert_eq!(
            user.unwrap().get("id").and_then(|v| v.as_str()),
            Some("u1")
        );
        unauthorized.assert();
        token.assert();
        stale.assert();
    }

    #[tokio::test]
    async fn server_failure_is_a_typed_error() {
        let server = MockServer::start();
        let _token = mock_token(&server);
        server.mock(|when, then| {
            when.method(GET).path("/admin/realms/tenants/users");
            then.status(500).body("boom");
        });

        let err = admin(&server)
            .get_user_by_username("someone")
            .await
            .unwrap_err();
        match err {
            KeycloakError::Api { status, .. } => assert_eq!(status, 500),
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_user_reads_location_header() {
        let server = MockServer::start();
        let _token = mock_token(&server);
        server.mock(|when, then| {
            when.method(POST).path("/admin/realms/tenants/users");
            then.status(201)
                .header("Location", "/admin/realms/tenants/users/abc-123");
        });

        let id = admin(&server)
            .create_user("new@example.com", "new", "New", "User")
            .await
            .unwrap();
        assert_eq!(id, "abc-123");
    }
}
