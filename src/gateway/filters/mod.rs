//! Request filters. Each one is an axum `from_fn` middleware of the shape
//! `(request, next) -> response` and may pass, mutate or short-circuit.

pub mod authenticate;
pub mod rate_limit;
pub mod threat;

pub use crate::middleware::trace::trace_tag;
pub use authenticate::{authenticate, AuthenticateFilter};
pub use rate_limit::rate_limit;
pub use threat::threat_screen;
