//! Cross-origin resource sharing.
//!
//! The filter wraps the whole router, so its headers are present on every
//! response (401s included) and browser preflights are answered before
//! authentication runs.

use http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};
use tracing::warn;

use crate::config::CorsConfig;

const WILDCARD: &str = "*";

fn is_wildcard(values: &[String]) -> bool {
    values.iter().any(|value| value == WILDCARD)
}

/// Builds the CORS layer described by the `cors` config section.
pub fn cors_layer(config: &CorsConfig) -> CorsLayer {
    // A literal `*` cannot be combined with credentials; mirror the
    // request origin in that case.
    let origin = if is_wildcard(&config.allowed_hosts) {
        if config.credentials {
            AllowOrigin::mirror_request()
        } else {
            AllowOrigin::any()
        }
    } else {
        AllowOrigin::list(config.allowed_hosts.iter().filter_map(|host| {
            match HeaderValue::from_str(host) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = host.as_str(), "invalid cors origin");
                    None
                }
            }
        }))
    };

    let methods = if is_wildcard(&config.allowed_methods) {
        if config.credentials {
            AllowMethods::mirror_request()
        } else {
            AllowMethods::any()
        }
    } else {
        AllowMethods::list(config.allowed_methods.iter().filter_map(|method| {
            match Method::from_bytes(method.as_bytes()) {
                Ok(method) => Some(method),
                Err(_) => {
                    warn!(method = method.as_str(), "invalid cors method");
                    None
                }
            }
        }))
    };

    let headers = if is_wildcard(&config.allowed_headers) {
        if config.credentials {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::any()
        }
    } else {
        AllowHeaders::list(config.allowed_headers.iter().filter_map(|header| {
            match HeaderName::from_bytes(header.as_bytes()) {
                Ok(name) => Some(name),
                Err(_) => {
                    warn!(header = header.as_str(), "invalid cors header");
                    None
                }
            }
        }))
    };

    let mut layer = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(config.credentials);

    if !config.exposed_headers.is_empty() {
        layer = layer.expose_headers(ExposeHeaders::list(
            config
                .exposed_headers
                .iter()
                .filter_map(|header| HeaderName::from_bytes(header.as_bytes()).ok()),
        ));
    }

    layer
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use http::{Request, StatusCode};
    use tower::ServiceExt;

    fn cors_config() -> CorsConfig {
        CorsConfig {
            enabled: true,
            credentials: false,
            allowed_headers: vec![WILDCARD.to_string()],
            allowed_hosts: vec![WILDCARD.to_string()],
            allowed_methods: vec![WILDCARD.to_string()],
            exposed_headers: vec![],
        }
    }

    fn app(config: &CorsConfig) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(cors_layer(config))
    }

    #[tokio::test]
    async fn wildcard_origin() {
        let response = app(&cors_config())
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/")
                    .header("origin", "http://example.com")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            WILDCARD
        );
    }

    #[tokio::test]
    async fn listed_origin_is_echoed() {
        let mut config = cors_config();
        config.allowed_hosts = vec!["http://localhost:8080".to_string()];

        let response = app(&config)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("origin", "http://localhost:8080")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:8080"
        );

        let response = app(&config)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("origin", "http://elsewhere")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response
            .headers()
            .get("access-control-allow-origin")
            .is_none());
    }

    #[tokio::test]
    async fn credentials_and_exposed_headers() {
        let mut config = cors_config();
        config.credentials = true;
        config.exposed_headers = vec!["Content-Length".to_string(), "Content-Range".to_string()];

        let response = app(&config)
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("origin", "http://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        // With credentials the wildcard mirrors the origin instead.
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://example.com"
        );
        assert_eq!(
            response.headers()["access-control-allow-credentials"],
            "true"
        );
        let exposed = response.headers()["access-control-expose-headers"]
            .to_str()
            .unwrap()
            .to_ascii_lowercase();
        assert!(exposed.contains("content-length"));
        assert!(exposed.contains("content-range"));
    }
}
