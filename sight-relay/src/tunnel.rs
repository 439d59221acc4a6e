use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to build tunnel client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("tunnel request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("tunnel at {url} answered {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// Local consumer of payloads addressed to this node.
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn forward(&self, payload: &Value) -> Result<(), TunnelError>;
}

/// Posts payloads as JSON to a fixed URL. One attempt per payload.
#[derive(Clone, Debug)]
pub struct HttpTunnel {
    client: reqwest::Client,
    url: String,
}

impl HttpTunnel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TunnelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(TunnelError::Client)?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Tunnel for HttpTunnel {
    async fn forward(&self, payload: &Value) -> Result<(), TunnelError> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|source| TunnelError::Request {
                url: self.url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TunnelError::Status {
                url: self.url.clone(),
                status,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    async fn spawn_tunnel(status: StatusCode) -> (SocketAddr, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/libp2p/message",
                post(
                    move |State(seen): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>| async move {
                        seen.lock().unwrap().push(body);
                        status
                    },
                ),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, seen)
    }

    #[tokio::test]
    async fn posts_payload_as_json() {
        let (addr, seen) = spawn_tunnel(StatusCode::OK).await;
        let tunnel =
            HttpTunnel::new(format!("http://{addr}/libp2p/message"), Duration::from_secs(2)).unwrap();
        assert_eq!(tunnel.url(), format!("http://{addr}/libp2p/message"));
        tunnel.forward(&json!({"text": "hi"})).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![json!({"text": "hi"})]);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (addr, seen) = spawn_tunnel(StatusCode::SERVICE_UNAVAILABLE).await;
        let tunnel =
            HttpTunnel::new(format!("http://{addr}/libp2p/message"), Duration::from_secs(2)).unwrap();
        let err = tunnel.forward(&json!(null)).await.unwrap_err();
        assert!(matches!(err, TunnelError::Status { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_tunnel_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let tunnel = HttpTunnel::new(format!("http://{addr}/x"), Duration::from_secs(2)).unwrap();
        let err = tunnel.forward(&json!({})).await.unwrap_err();
        assert!(matches!(err, TunnelError::Request { .. }));
    }
}
