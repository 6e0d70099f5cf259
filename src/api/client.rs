//! Authenticated HTTP client for the backend APIs
//!
//! Wraps reqwest::Client with apikey/bearer injection and automatic
//! session refresh.

use anyhow::{bail, Context, Result};

use crate::auth::StoredSession;
use crate::config::Config;

/// Authenticated client covering the REST, RPC, storage and edge
/// function surfaces of the backend.
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    session: StoredSession,
}

impl BackendClient {
    /// Load config and build client. Attempts a session refresh if the
    /// stored session is expired.
    pub async fn new() -> Result<Self> {
        let mut config = Config::load()?;

        let needs_refresh = config.get_session().map_or(true, |s| s.is_expired());
        if needs_refresh {
            if config.get_session().is_some() {
                tracing::info!("Session expired, refreshing...");
                match crate::auth::refresh().await {
                    Ok(true) => {
                        config = Config::load()?;
                        tracing::info!("Session refreshed");
                    }
                    Ok(false) => {
                        bail!("Not signed in. Run 'huddle-cli login'.");
                    }
                    Err(e) => {
                        bail!("Session refresh failed: {:#}. Run 'huddle-cli login'.", e);
                    }
                }
            } else {
                bail!("Not signed in. Run 'huddle-cli login'.");
            }
        }

        let session = config.require_session()?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.backend_url()?,
            anon_key: config.anon_key()?,
            session,
        })
    }

    /// Id of the signed-in user.
    pub fn user_id(&self) -> &str {
        &self.session.user_id
    }

    /// Email of the signed-in user, when the token carried one.
    pub fn email(&self) -> Option<&str> {
        self.session.email.as_deref()
    }

    /// Access token of the signed-in session. Realtime channels carry it
    /// in their join payload.
    pub fn access_token(&self) -> &str {
        &self.session.access_token
    }

    /// Websocket URL of the realtime service.
    pub fn realtime_url(&self) -> String {
        let ws_base = self
            .base_url
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base, self.anon_key
        )
    }

    /// GET rows from a table (PostgREST query string).
    pub async fn rest_select(&self, table: &str, query: &str) -> Result<reqwest::Response> {
        let url = format!("{}/rest/v1/{}?{}", self.base_url, table, query);
        tracing::debug!("REST GET {}", url);

        let resp = self
            .http
            .get(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.session.access_token)
            .send()
            .await
            .with_context(|| format!("REST GET {} failed", url))?;

        check_response(resp, &url).await
    }

    /// INSERT rows into a table, returning the created representation.
    pub async fn rest_insert(
        &self,
        table: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/rest/v1/{}", self.base_url, table);
        tracing::debug!("REST POST {}", url);

        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .header("Prefer", "return=representation")
            .bearer_auth(&self.session.access_token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("REST POST {} failed", url))?;

        check_response(resp, &url).await
    }

    /// UPDATE rows matching a PostgREST filter.
    pub async fn rest_update(
        &self,
        table: &str,
        filter: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/rest/v1/{}?{}", self.base_url, table, filter);
        tracing::debug!("REST PATCH {}", url);

        let resp = self
            .http
            .patch(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.session.access_token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("REST PATCH {} failed", url))?;

        check_response(resp, &url).await
    }

    /// Call a database function via the RPC endpoint.
    pub async fn rpc(&self, function: &str, args: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        tracing::debug!("RPC {}", url);

        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.session.access_token)
            .json(args)
            .send()
            .await
            .with_context(|| format!("RPC {} failed", url))?;

        check_response(resp, &url).await
    }

    /// Invoke an edge function.
    pub async fn invoke_function(
        &self,
        name: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/functions/v1/{}", self.base_url, name);
        tracing::debug!("Function POST {}", url);

        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.session.access_token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Function {} failed", url))?;

        check_response(resp, &url).await
    }

    /// Upload an object to a storage bucket. Returns the public URL.
    pub async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path);
        tracing::debug!("Storage POST {} ({} bytes)", url, bytes.len());

        let resp = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .header("Content-Type", content_type)
            .bearer_auth(&self.session.access_token)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("Storage POST {} failed", url))?;

        check_response(resp, &url).await?;
        Ok(self.public_object_url(bucket, path))
    }

    /// Public URL of an object in a public bucket.
    pub fn public_object_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, bucket, path
        )
    }
}

/// Check HTTP response status code and return a clear error on failure.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Session may be invalid -- run 'huddle-cli login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
