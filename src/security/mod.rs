//! Security middleware.
//!
//! - [`HttpsRedirect`] sends plain-HTTP requests to their HTTPS URL.
//! - [`RequireApiKey`] and [`RequireBearer`] refuse requests without
//!   credentials and expose the ones they find as [`ApiKey`] and
//!   [`BearerToken`] extensions.

mod middleware;

pub use middleware::{ApiKey, BearerToken, HttpsRedirect, RequireApiKey, RequireBearer};
