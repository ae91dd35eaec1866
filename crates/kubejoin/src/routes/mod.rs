//! HTTP route handlers for the discovery server.

use std::time::Duration;

use axum::{Router, http::StatusCode, routing::get};
use kubejoin_common::constants::DISCOVERY_PATH;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::state::DiscoveryState;

mod cluster_info;
mod health;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Create the discovery server router
pub fn create_router(state: DiscoveryState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(DISCOVERY_PATH, get(cluster_info::get_cluster_info))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(timeout_layer(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}

fn timeout_layer(after: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{
        DiscoverySettings, HttpClusterInfoSource, bundle::tests::complete_bundle,
        parse_and_verify, perform_tls_bootstrap,
    };
    use crate::pki::CertificateStore;
    use axum::body::Body;
    use axum::http::Request;
    use kubejoin_common::BootstrapToken;
    use kubejoin_common::constants::cert_names;
    use std::sync::Arc;
    use tower::ServiceExt;

    const TOKEN: &str = "abcdef.0123456789abcdef";

    fn state() -> DiscoveryState {
        DiscoveryState::new(complete_bundle(), [BootstrapToken::parse(TOKEN).unwrap()])
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn known_token_gets_signed_bundle() {
        let state = state();
        let (status, body) =
            get(create_router(state.clone()), "/cluster-info/v1?token-id=abcdef").await;

        assert_eq!(status, StatusCode::OK);
        let bundle = parse_and_verify(&body, "0123456789abcdef").unwrap();
        assert_eq!(&bundle, state.bundle.as_ref());
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let (status, _) = get(create_router(state()), "/cluster-info/v1?token-id=zzzzzz").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_token_id_is_bad_request() {
        for uri in ["/cluster-info/v1", "/cluster-info/v1?token-id="] {
            let (status, _) = get(create_router(state()), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn health_reports_token_count() {
        let (status, body) = get(create_router(state()), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["tokens"], 1);
    }

    #[tokio::test]
    async fn slow_handler_times_out_with_408() {
        let app = Router::new()
            .route(
                "/slow",
                axum::routing::get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            )
            .layer(timeout_layer(Duration::from_millis(50)));

        let (status, _) = get(app, "/slow").await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    }

    #[tokio::test]
    async fn joiner_bootstraps_against_live_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server_state = state();
        let app = create_router(server_state.clone());
        tokio::spawn(async move { axum::serve(listener, app).await });

        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path());
        let settings = DiscoverySettings {
            port,
            retry_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(10),
        };
        // The second candidate has nothing listening on the discovery port
        let endpoints = vec!["127.0.0.1:6443".to_string(), "127.0.0.2:6443".to_string()];

        let outcome = perform_tls_bootstrap(
            TOKEN,
            &endpoints,
            &settings,
            Arc::new(HttpClusterInfoSource::new()),
            &store,
        )
        .await
        .unwrap();

        assert_eq!(outcome.endpoint, format!("127.0.0.1:{port}"));
        assert_eq!(
            store.load_cert(cert_names::ETCD_CA).unwrap(),
            server_state.bundle.etcd_certificate_authority
        );
        assert!(store.cert_path(cert_names::ETCD_CLIENT).exists());
    }
}
