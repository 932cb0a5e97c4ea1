//! Transport-security and credential-presence checks.
//!
//! None of these validate credentials. They only refuse requests that carry
//! none, and hand what they found to the handler through
//! [`Context::extensions`](crate::context::Context::extensions).

use futures::future::LocalBoxFuture;

use crate::{
    context::Context,
    middleware::{Middleware, Next},
    normalized::NormalizedResponse,
};

const API_KEY_REQUIRED_BODY: &str = r#"{"error":"Authentication required (API key)"}"#;
const JWT_REQUIRED_BODY: &str = r#"{"error":"Authentication required (JWT)"}"#;

/// Redirects plain-HTTP requests to HTTPS.
///
/// A request counts as secure when `x-forwarded-proto` or
/// `x-forwarded-protocol` is `https`. Anything else is answered with
/// `301 Location: https://{host}{url}`. Requests without a `Host` header
/// have nowhere to be redirected to and pass through.
pub struct HttpsRedirect;

impl Middleware for HttpsRedirect {
    fn handle(&self, ctx: Context, next: Next) -> LocalBoxFuture<'static, NormalizedResponse> {
        Box::pin(async move {
            let req = ctx.request();
            let secure = ["x-forwarded-proto", "x-forwarded-protocol"]
                .iter()
                .filter_map(|name| req.header_value(name))
                .any(|proto| proto.eq_ignore_ascii_case("https"));
            if secure {
                return next.run(ctx).await;
            }

            let Some(host) = req.header_value("host") else {
                return next.run(ctx).await;
            };
            let location = format!("https://{}{}", host, req.url());
            tracing::debug!(%location, "redirecting to https");
            NormalizedResponse::new(301).with_header("location", location)
        })
    }
}

/// The raw credential [`RequireApiKey`] found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey(pub String);

/// Refuses requests that carry neither `x-api-key` nor `authorization`.
///
/// `x-api-key` wins when both are present.
pub struct RequireApiKey;

impl Middleware for RequireApiKey {
    fn handle(&self, mut ctx: Context, next: Next) -> LocalBoxFuture<'static, NormalizedResponse> {
        Box::pin(async move {
            let key = ctx
                .request()
                .header_value("x-api-key")
                .or_else(|| ctx.request().header_value("authorization"))
                .filter(|key| !key.is_empty())
                .map(str::to_owned);

            match key {
                Some(key) => {
                    ctx.extensions_mut().insert(ApiKey(key));
                    next.run(ctx).await
                }
                None => NormalizedResponse::text(401, API_KEY_REQUIRED_BODY)
                    .with_header("content-type", "application/json"),
            }
        })
    }
}

/// The token after `Bearer ` in the `authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken(pub String);

/// Refuses requests without an `authorization: Bearer <token>` header.
pub struct RequireBearer;

impl Middleware for RequireBearer {
    fn handle(&self, mut ctx: Context, next: Next) -> LocalBoxFuture<'static, NormalizedResponse> {
        Box::pin(async move {
            let token = ctx
                .request()
                .header_value("authorization")
                .and_then(bearer_token)
                .map(str::to_owned);

            match token {
                Some(token) => {
                    ctx.extensions_mut().insert(BearerToken(token));
                    next.run(ctx).await
                }
                None => NormalizedResponse::text(401, JWT_REQUIRED_BODY)
                    .with_header("content-type", "application/json"),
            }
        })
    }
}

fn bearer_token(authorization: &str) -> Option<&str> {
    let (scheme, token) = authorization.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
