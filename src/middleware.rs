//! HTTP middleware adapters
//!
//! Two styles over the same engine: [`GuardLayer`] is a tower layer for any
//! stack built on `http` request/response types, and [`guard`] plugs into
//! `axum::middleware::from_fn_with_state`. Both answer rejections with the
//! verdict status and a JSON `{"error": …}` body, and echo the renewed
//! session/device cookies on every response.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tower::{Layer, Service};

use crate::{CheckResult, Guardian};

/// Axum middleware: `Router::layer(middleware::from_fn_with_state(guardian, guard))`.
///
/// The router must be served with connect info so the socket peer is
/// available (`into_make_service_with_connect_info::<SocketAddr>()`).
pub async fn guard(
    State(guardian): State<Arc<Guardian>>,
    req: Request,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let verdict = check_request(&guardian, req.headers(), peer).await;

    if verdict.success {
        let mut response = next.run(req).await;
        append_cookies(&mut response, &verdict.set_cookies);
        response
    } else {
        reject(&verdict)
    }
}

async fn check_request(
    guardian: &Guardian,
    headers: &HeaderMap,
    peer: Option<std::net::IpAddr>,
) -> CheckResult {
    guardian.check(headers, peer).await
}

fn reject(verdict: &CheckResult) -> Response {
    let status =
        StatusCode::from_u16(verdict.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(serde_json::json!({
        "error": verdict.error.clone().unwrap_or_default(),
    }));

    let mut response = (status, body).into_response();
    append_cookies(&mut response, &verdict.set_cookies);
    response
}

fn append_cookies(response: &mut Response, cookies: &[String]) {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
}

/// Tower layer wrapping a service with the admission check.
#[derive(Clone)]
pub struct GuardLayer {
    guardian: Arc<Guardian>,
}

impl GuardLayer {
    pub fn new(guardian: Arc<Guardian>) -> Self {
        Self { guardian }
    }
}

impl<S> Layer<S> for GuardLayer {
    type Service = GuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GuardService {
            inner,
            guardian: self.guardian.clone(),
        }
    }
}

/// Service produced by [`GuardLayer`].
#[derive(Clone)]
pub struct GuardService<S> {
    inner: S,
    guardian: Arc<Guardian>,
}

impl<S> Service<Request> for GuardService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let guardian = self.guardian.clone();
        // take the ready service, leave a fresh clone behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        let headers = req.headers().clone();

        Box::pin(async move {
            let verdict = check_request(&guardian, &headers, peer).await;

            if verdict.success {
                let mut response = inner.call(req).await?;
                append_cookies(&mut response, &verdict.set_cookies);
                Ok(response)
            } else {
                Ok(reject(&verdict))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reject_serializes_error_json() {
        let verdict = CheckResult {
            success: false,
            status_code: 403,
            error: Some("IP 1.2.3.4 is banned".into()),
            set_cookies: vec!["conn.sess.id=s:a.b; Path=/".into()],
        };

        let response = reject(&verdict);
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().contains_key(header::SET_COOKIE));
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_append_cookies_skips_invalid_values() {
        let mut response = ().into_response();
        append_cookies(
            &mut response,
            &["good=1; Path=/".to_string(), "bad\nvalue".to_string()],
        );
        let cookies: Vec<_> = response.headers().get_all(header::SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 1);
    }
}
