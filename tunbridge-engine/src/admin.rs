//! HTTP client for the proxy core's REST controller
//!
//! Every administrative call crossing the control channel ends up here as a
//! plain `method + path + body` request against the loopback controller.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};

use crate::config::CoreConfig;
use crate::error::{Error, Result};

/// Response from the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
    /// HTTP status code
    pub status: u16,
    /// Raw response body
    pub body: String,
}

impl AdminResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_no_content(&self) -> bool {
        self.status == StatusCode::NO_CONTENT.as_u16()
    }
}

/// Client for the proxy core's controller API
#[derive(Debug, Clone)]
pub struct AdminClient {
    http: reqwest::Client,
    base_url: String,
    secret: Option<String>,
}

impl AdminClient {
    /// Create a client for `base_url` (e.g. `http://127.0.0.1:9090`)
    pub fn new(base_url: impl Into<String>, secret: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
        })
    }

    /// Create a client from the `[core]` section
    pub fn from_config(core: &CoreConfig) -> Result<Self> {
        Self::new(core.controller_url(), core.secret.clone(), core.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue a request with a textual method
    ///
    /// An empty body sends no body at all; anything else is sent as JSON.
    pub async fn request(&self, method: &str, path: &str, body: &str) -> Result<AdminResponse> {
        let method = Method::from_bytes(method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Control(format!("invalid HTTP method: {}", method)))?;
        self.send(method, path, body.to_string()).await
    }

    /// Issue a request with a JSON body
    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        value: &serde_json::Value,
    ) -> Result<AdminResponse> {
        self.send(method, path, value.to_string()).await
    }

    /// GET a JSON document
    pub async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let response = self.send(Method::GET, path, String::new()).await?;
        if !response.is_success() {
            return Err(Error::Control(format!(
                "GET {} returned {}: {}",
                path, response.status, response.body
            )));
        }
        Ok(serde_json::from_str(&response.body)?)
    }

    async fn send(&self, method: Method, path: &str, body: String) -> Result<AdminResponse> {
        let url = self.url(path);
        log::debug!("Controller request: {} {}", method, url);

        let mut request = self.http.request(method, &url);
        if let Some(ref secret) = self.secret {
            request = request.header(AUTHORIZATION, format!("Bearer {}", secret));
        }
        if !body.is_empty() {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        log::trace!("Controller response: {} ({} bytes)", status, body.len());
        Ok(AdminResponse { status, body })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let client =
            AdminClient::new("http://127.0.0.1:9090/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9090");
        assert_eq!(client.url("/version"), "http://127.0.0.1:9090/version");
        assert_eq!(client.url("proxies"), "http://127.0.0.1:9090/proxies");
    }

    #[tokio::test]
    async fn test_invalid_method_rejected() {
        let client =
            AdminClient::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        let err = client.request("GE T", "/version", "").await.unwrap_err();
        assert!(matches!(err, Error::Control(_)));
    }

    #[test]
    fn test_response_classes() {
        let ok = AdminResponse { status: 204, body: String::new() };
        assert!(ok.is_success());
        assert!(ok.is_no_content());

        let missing = AdminResponse { status: 404, body: "{}".into() };
        assert!(!missing.is_success());
    }
}
