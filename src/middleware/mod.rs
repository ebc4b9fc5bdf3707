pub mod auth;
pub mod client_ip;
pub mod json;
pub mod rate_limit;
pub mod trace;
