// Gateway modules: backend lifecycle engine plus the admin HTTP surface

pub mod backend;
pub mod config;
pub mod lifecycle;
pub mod request_parsing;
pub mod response_helpers;
pub mod routes;
