//! Manifest attach protocol

use async_trait::async_trait;
use conduit_core::Mario;
use tracing::debug;

use crate::ManifestClient;
use crate::error::{ClientError, Result};

/// Source of the manifest served by a ready attach pod
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetch and decode the manifest served by the pod at `pod_ip`
    async fn fetch_manifest(&self, pod_ip: &str) -> Result<Mario>;
}

#[async_trait]
impl ManifestSource for ManifestClient {
    async fn fetch_manifest(&self, pod_ip: &str) -> Result<Mario> {
        let url = self.endpoint(pod_ip);
        debug!(%url, "fetching manifest");
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .bearer_auth(&self.token)
            .send()
            .await?;

        let body = self.handle_response(response).await?;
        decode_manifest(&body)
    }
}

/// Decode a response body into a Mario document
///
/// Anything that is not a `Mario` of `conduit.dev/v1alpha1` is rejected.
pub fn decode_manifest(body: &[u8]) -> Result<Mario> {
    let mario: Mario = serde_json::from_slice(body)
        .map_err(|e| ClientError::ParseError(format!("Failed to parse manifest: {}", e)))?;

    if !mario.is_mario() {
        return Err(ClientError::InvalidManifest(format!(
            "unexpected {}/{}",
            mario.api_version, mario.kind
        )));
    }
    Ok(mario)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const BODY: &str = r#"{"apiVersion":"conduit.dev/v1alpha1","kind":"Mario","spec":{"actions":[{"name":"make"}]}}"#;

    /// Serve a single HTTP response and hand back the raw request
    async fn serve_once(status: &'static str, body: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (port, handle)
    }

    #[test]
    fn test_decode_manifest() {
        let mario = decode_manifest(BODY.as_bytes()).unwrap();
        assert!(mario.action("make").is_some());
    }

    #[test]
    fn test_decode_rejects_other_kinds() {
        let body = r#"{"apiVersion":"v1","kind":"ConfigMap"}"#;
        let err = decode_manifest(body.as_bytes()).unwrap_err();
        assert!(matches!(err, ClientError::InvalidManifest(_)));

        let err = decode_manifest(b"not json").unwrap_err();
        assert!(matches!(err, ClientError::ParseError(_)));
    }

    #[tokio::test]
    async fn test_fetch_manifest_sends_token() {
        let (port, server) = serve_once("200 OK", BODY).await;
        let client = ManifestClient::new(port, "secret");

        let mario = client.fetch_manifest("127.0.0.1").await.unwrap();
        assert_eq!(mario.spec.actions.len(), 1);

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("get / http/1.1"));
        assert!(request.contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_fetch_manifest_error_status() {
        let (port, server) = serve_once("503 Service Unavailable", "cloning").await;
        let client = ManifestClient::new(port, "secret");

        let err = client.fetch_manifest("127.0.0.1").await.unwrap_err();
        assert!(matches!(err, ClientError::ApiError { status: 503, .. }));
        server.await.unwrap();
    }
}
