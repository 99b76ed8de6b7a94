//! HTTP admission middleware and server.

mod layer;
mod response;
mod server;

pub use layer::{
    build_admission_layer, AdmissionLayer, AdmissionService, RemoteAddr, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, X_RATE_LIMIT_ACTIVE_IPS, X_RATE_LIMIT_IP,
};
pub use response::{AccessDenied, ErrorBody, RateLimited};
pub use server::HttpServer;
