use super::bucket::TokenBucket;
use super::pacer::paced_body;
use super::service::RateLimitService;
use super::types::RateSignal;
use crate::error::AppError;
use axum::{
    body::{Body, Bytes},
    extract::Request,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use http::{request::Parts, uri::PathAndQuery, Uri};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, info, warn};

/// Token bucket attached to a re-dispatched request
#[derive(Clone)]
pub struct BucketAttachment(pub Arc<TokenBucket>);

/// Marks a request built by [`AccelRedirectService`] for the second pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalRedirect {
    /// Path of the client request that triggered the redirect
    pub original_path: String,
}

/// Which pass of the two-pass dispatch a request belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPass {
    /// Client request; its response is inspected for a redirect signal
    Observing,
    /// Derived request; its response is final
    Redispatched,
}

impl DispatchPass {
    pub fn of<B>(request: &http::Request<B>) -> Self {
        if request.extensions().get::<InternalRedirect>().is_some() {
            DispatchPass::Redispatched
        } else {
            DispatchPass::Observing
        }
    }
}

/// Bucket attached to a request, if any
pub fn attached_bucket<B>(request: &http::Request<B>) -> Option<&Arc<TokenBucket>> {
    request
        .extensions()
        .get::<BucketAttachment>()
        .map(|attachment| &attachment.0)
}

/// Layer intercepting `X-Accel-Redirect` responses and re-dispatching the request
#[derive(Clone)]
pub struct AccelRedirectLayer {
    limiter: Arc<RateLimitService>,
}

impl AccelRedirectLayer {
    pub fn new(limiter: Arc<RateLimitService>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for AccelRedirectLayer {
    type Service = AccelRedirectService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccelRedirectService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Two-pass dispatcher.
///
/// Pass 1 sends the client request through the inner service and inspects the
/// response. A response without a redirect signal is returned untouched. A signal
/// discards that response and sends a derived request for the redirect target
/// through the same inner service, with the user's bucket attached when the signal
/// carries a usable limit. The pass-2 response is returned as is.
#[derive(Clone)]
pub struct AccelRedirectService<S> {
    inner: S,
    limiter: Arc<RateLimitService>,
}

impl<S> Service<Request> for AccelRedirectService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let limiter = self.limiter.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            if DispatchPass::of(&request) == DispatchPass::Redispatched {
                return inner.oneshot(request).await;
            }

            let (parts, body) = request.into_parts();
            let limit = limiter.max_body_bytes();
            let body = match Limited::new(body, limit).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) if e.is::<LengthLimitError>() => {
                    warn!(path = %parts.uri.path(), limit, "Request body too large to replay");
                    return Ok(AppError::PayloadTooLarge(limit).into_response());
                }
                Err(e) => {
                    warn!(path = %parts.uri.path(), error = %e, "Failed to buffer request body");
                    return Ok(AppError::Body(e.to_string()).into_response());
                }
            };

            let observed = Request::from_parts(parts.clone(), Body::from(body.clone()));
            let response = inner.clone().oneshot(observed).await?;

            let Some(signal) = limiter.signal(response.headers()) else {
                return Ok(response);
            };
            drop(response);

            let bucket = limiter.bucket_for(&signal).await;
            crate::metrics::record_redirect(bucket.is_some());

            info!(
                path = %parts.uri.path(),
                redirect = %signal.redirect_path,
                user_id = signal.user_id.as_deref().unwrap_or("-"),
                rate = signal.rate_bytes_per_sec.unwrap_or(0),
                limited = bucket.is_some(),
                "Internal redirect"
            );

            let derived = match derive_request(parts, body, &signal, bucket) {
                Ok(derived) => derived,
                Err(e) => {
                    warn!(redirect = %signal.redirect_path, error = %e, "Invalid redirect target");
                    return Ok(AppError::Backend(format!(
                        "invalid redirect target '{}'",
                        signal.redirect_path
                    ))
                    .into_response());
                }
            };

            inner.oneshot(derived).await
        })
    }
}

/// Build the pass-2 request: the original method, headers, extensions and body
/// addressed to the redirect target
fn derive_request(
    mut parts: Parts,
    body: Bytes,
    signal: &RateSignal,
    bucket: Option<Arc<TokenBucket>>,
) -> Result<Request, http::Error> {
    let original_path = parts.uri.path().to_string();
    parts.uri = redirect_uri(&parts.uri, &signal.redirect_path)?;

    parts.extensions.insert(InternalRedirect { original_path });
    if let Some(bucket) = bucket {
        parts.extensions.insert(BucketAttachment(bucket));
    }

    Ok(Request::from_parts(parts, Body::from(body)))
}

/// Target URI for a redirect; the original query survives unless the target has its own
fn redirect_uri(original: &Uri, target: &str) -> Result<Uri, http::Error> {
    let mut path = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{}", target)
    };

    if !path.contains('?') {
        if let Some(query) = original.query() {
            path.push('?');
            path.push_str(query);
        }
    }

    let mut uri_parts = original.clone().into_parts();
    uri_parts.path_and_query = Some(path.parse::<PathAndQuery>()?);
    Ok(Uri::from_parts(uri_parts)?)
}

/// Layer pacing the response body of requests that carry a [`BucketAttachment`]
#[derive(Clone, Default)]
pub struct PaceLayer;

impl PaceLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for PaceLayer {
    type Service = PaceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PaceService { inner }
    }
}

/// Limit applier: requests without an attachment pass through unchanged
#[derive(Clone)]
pub struct PaceService<S> {
    inner: S,
}

impl<S> Service<Request> for PaceService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        let attachment = request.extensions_mut().remove::<BucketAttachment>();
        let future = self.inner.call(request);

        let Some(BucketAttachment(bucket)) = attachment else {
            return Box::pin(future);
        };

        Box::pin(async move {
            let response = future.await?;
            debug!(user_id = bucket.user_id(), status = %response.status(), "Pacing response body");

            let (parts, body) = response.into_parts();
            Ok(Response::from_parts(parts, paced_body(body, bucket)))
        })
    }
}
