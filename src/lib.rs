//! Icon Conversion Worker Library
//!
//! This library runs SVG/PNG to ICO/ICNS conversions off the request path.
//! Requests are validated, queued in a bounded job queue and executed by a
//! fixed-size worker pool with per-job timeouts, cancellation and failure
//! isolation.
//!
//! ## Module Overview
//!
//! - `config`: Queue, pool and limit settings
//! - `converter`: The conversion routine contract and the resvg-based icon converter
//! - `error`: Validation, queue and conversion errors
//! - `format`: Icon formats and conversion options
//! - `job`: Job models and state management
//! - `pool`: Worker pool executing queued jobs
//! - `queue`: Bounded in-process job queue
//! - `service`: Public conversion façade
//! - `telemetry`: Metrics events, OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use worker_convert::{
//!     config::ServiceConfig,
//!     converter::IconConverter,
//!     format::{ConversionOptions, IconFormat},
//!     service::ConversionService,
//!     telemetry::TelemetryCollector,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = ConversionService::new(
//!         ServiceConfig::default(),
//!         Arc::new(IconConverter::new()),
//!         Arc::new(TelemetryCollector),
//!     )
//!     .unwrap();
//!
//!     let svg = r#"<svg xmlns="http://www.w3.org/2000/svg" width="64" height="64">
//!         <circle cx="32" cy="32" r="30" fill="teal"/>
//!     </svg>"#;
//!
//!     let icon = service
//!         .convert(svg.as_bytes().to_vec(), IconFormat::Svg, IconFormat::Ico, ConversionOptions::default(), None)
//!         .await;
//!     assert!(icon.is_ok());
//!
//!     service.shutdown().await;
//! }
//! ```

pub mod config;
pub mod converter;
pub mod error;
pub mod format;
pub mod job;
pub mod pool;
pub mod queue;
pub mod service;
pub mod telemetry;
