//! # Exchange Pipeline
//!
//! The request pipeline shared by cryptocurrency exchange integrations.
//!
//! ## Features
//!
//! - Request signing for the common exchange authentication schemes, selected
//!   per exchange from static configuration
//! - Weighted sliding-window rate limiting per exchange and API key
//! - Per-exchange circuit breaker for transport failures
//! - Rate-limit header parsing across the major header families
//! - One error taxonomy for transport, HTTP status and body-level errors,
//!   including HTML access-restriction pages
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use exchange_pipeline::{Exchange, Pipeline, RequestOptions};
//! use exchange_pipeline::signing::CustomSigners;
//! use reqwest::Method;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let exchange = Exchange::from_json(
//!         r#"{ "id": "kraken", "urls": { "api": { "rest": "https://api.kraken.com" } } }"#,
//!         &CustomSigners::new(),
//!     )?;
//!     let pipeline = Pipeline::new();
//!     let time = pipeline
//!         .request(&exchange, Method::GET, "/0/public/Time", RequestOptions::new())
//!         .await?;
//!     println!("Server time: {:?}", time.json());
//!     Ok(())
//! }
//! ```
//!
//! Rate-limit buckets and circuit state live in process memory. Several
//! processes talking to the same exchange do not share them.

pub mod auth;
pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod error;
pub mod exchange;
pub mod rate_limit;
pub mod response;
pub mod signing;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use auth::Credentials;
pub use client::{Pipeline, PipelineBuilder, RequestOptions, RetryMode};
pub use error::{ConfigError, ErrorKind, NormalizedError};
pub use exchange::{Exchange, ExchangeSpec};
pub use response::Response;

/// Result type alias using NormalizedError
pub type Result<T> = std::result::Result<T, NormalizedError>;
