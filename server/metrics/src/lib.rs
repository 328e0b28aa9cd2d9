pub mod config;
pub mod http;
pub mod pipeline;

pub use config::MetricsConfig;
pub use http::MetricsServer;
pub use pipeline::PrometheusSink;
