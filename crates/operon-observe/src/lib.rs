//! Tracing and OpenTelemetry wiring shared by the Operon orchestration engine.

pub mod tracing_setup;
