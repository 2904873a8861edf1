//! Conduit Manifest Client
//!
//! HTTP client for the manifest attach protocol. Once the attach job of a flow is ready,
//! its pod serves the repository's Mario manifest on `GET http://<pod-ip>:<port>/`,
//! guarded by a bearer token.
//!
//! # Example
//!
//! ```no_run
//! use conduit_client::{ManifestClient, ManifestSource};
//!
//! #[tokio::main]
//! async fn main() -> conduit_client::Result<()> {
//!     let client = ManifestClient::new(8080, "conduit");
//!     let mario = client.fetch_manifest("10.0.0.12").await?;
//!     println!("{} actions", mario.spec.actions.len());
//!     Ok(())
//! }
//! ```

pub mod error;
mod manifest;

pub use error::{ClientError, Result};
pub use manifest::{ManifestSource, decode_manifest};

use reqwest::Client;

/// HTTP client for the attach server running in a flow's attach pod
#[derive(Debug, Clone)]
pub struct ManifestClient {
    /// Port the attach server listens on
    port: u16,
    /// Bearer token expected by the attach server
    token: String,
    /// HTTP client instance
    client: Client,
}

impl ManifestClient {
    /// Create a new manifest client
    ///
    /// # Arguments
    /// * `port` - Port the attach server listens on
    /// * `token` - Bearer token passed to the attach server
    pub fn new(port: u16, token: impl Into<String>) -> Self {
        Self::with_client(port, token, Client::new())
    }

    /// Create a new manifest client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, etc.
    ///
    /// # Example
    /// ```
    /// use conduit_client::ManifestClient;
    /// use reqwest::Client;
    /// use std::time::Duration;
    ///
    /// let http_client = Client::builder()
    ///     .timeout(Duration::from_secs(10))
    ///     .build()
    ///     .unwrap();
    ///
    /// let client = ManifestClient::with_client(8080, "conduit", http_client);
    /// ```
    pub fn with_client(port: u16, token: impl Into<String>, client: Client) -> Self {
        Self {
            port,
            token: token.into(),
            client,
        }
    }

    /// URL the manifest is served on for a pod IP
    pub fn endpoint(&self, pod_ip: &str) -> String {
        if pod_ip.contains(':') {
            format!("http://[{}]:{}/", pod_ip, self.port)
        } else {
            format!("http://{}:{}/", pod_ip, self.port)
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and return the raw body
    async fn handle_response(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        let client = ManifestClient::new(8080, "conduit");
        assert_eq!(client.endpoint("10.0.0.12"), "http://10.0.0.12:8080/");
    }

    #[test]
    fn test_endpoint_ipv6() {
        let client = ManifestClient::new(9000, "conduit");
        assert_eq!(client.endpoint("fd00::12"), "http://[fd00::12]:9000/");
    }
}
