//! Ingestion pipeline: normalization, fetch gating and the per-source
//! scheduler.

pub mod config;
pub mod gate;
pub mod normalize;
pub mod scheduler;

pub use config::{default_schedules, load_schedules, ConfigError, IngestConfig, SourceSchedule};
pub use gate::{ashare_sessions, FetchGate, GateDecision, GateReason, SessionWindow, TradingSessionGate};
pub use normalize::{sanitize_text, truncate_chars, NormalizeOutcome, Normalizer, DEFAULT_DESCRIPTION_LIMIT};
pub use scheduler::{assemble_jobs, CycleOutcome, CycleReport, IngestScheduler, SourceJob};

pub const CRATE_NAME: &str = "thub-ingest";
