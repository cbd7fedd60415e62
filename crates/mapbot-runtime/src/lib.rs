//! `mapbot-runtime` – The Bridge Core
//!
//! Wires the device link, fusion unit, occupancy mapper and frame relay into
//! one running pipeline.
//!
//! # Modules
//!
//! - [`mapper`] – [`OccupancyMapper`][mapper::OccupancyMapper]: mapping
//!   session lifecycle on top of the occupancy grid, persisting finished
//!   sessions through a [`MapStore`][mapbot_memory::MapStore] and exporting
//!   stored maps as PNG.
//! - [`pipeline`] – [`AppContext`][pipeline::AppContext]: explicit service
//!   construction, the telemetry / frame / map-push tasks, and the validated
//!   operator actions every front end goes through.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to Jaeger, Grafana Tempo, or any OTLP-compatible collector.

pub mod mapper;
pub mod pipeline;
pub mod telemetry;

pub use mapper::{MapperConfig, MappingSession, OccupancyMapper, export_map_image};
pub use pipeline::{AppContext, PipelineConfig, PipelineHandle, PoseReport, SystemStatus};
pub use telemetry::{LogFormat, TelemetryConfig, TracerProviderGuard, init_tracing};
