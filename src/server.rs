//! HTTP endpoints: health checks, relay info, and telemetry.

use anyhow::Result;
use axum::{http::header, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr};

use crate::metrics::metrics;

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Start an HTTP server exposing `/healthz`, `/metrics`, and relay info.
pub async fn serve_http(
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics));
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    software: String,
    version: String,
    supported_nips: Vec<u32>,
}

/// Basic NIP-11 relay information document.
async fn relay_info() -> impl IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "quern".into(),
            software: "quern".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            supported_nips: vec![1, 9, 77],
        }),
    )
}

/// Prometheus text exposition of the process counters.
async fn render_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics().render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task;

    async fn spawn_http() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route("/", get(relay_info))
            .route("/healthz", get(healthz))
            .route("/metrics", get(render_metrics));
        task::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_endpoint() {
        let base = spawn_http().await;
        let body: serde_json::Value = reqwest::get(format!("{base}/healthz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn relay_info_document() {
        let base = spawn_http().await;
        let resp = reqwest::get(format!("{base}/")).await.unwrap();
        assert_eq!(
            resp.headers()
                .get(reqwest::header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["software"], "quern");
        assert!(body["supported_nips"]
            .as_array()
            .unwrap()
            .contains(&serde_json::json!(77)));
    }

    #[tokio::test]
    async fn metrics_are_rendered_as_text() {
        metrics().client_messages.inc("EVENT");
        let base = spawn_http().await;
        let resp = reqwest::get(format!("{base}/metrics")).await.unwrap();
        assert!(resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        let text = resp.text().await.unwrap();
        assert!(text.contains("nostr_client_messages_total"));
        assert!(text.contains("# TYPE nostr_events_stored_total counter"));
    }

    #[tokio::test]
    async fn serve_http_bind_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(serve_http(addr, std::future::pending()).await.is_err());
    }
}
