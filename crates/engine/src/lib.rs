//! File ingestion engine for Depot.
//!
//! This crate provides the upload pipeline:
//! - Per-user admission and quota gating
//! - Resumable chunked uploads with idempotent re-sends
//! - Content-hash dedup against already-stored files
//! - Chunk assembly and commit to object storage
//! - Media post-processing (HLS video, image thumbnails)
//! - Background maintenance sweeps

pub mod admission;
pub mod assembler;
pub mod dedup;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod state;
pub mod sweep;
pub mod tracker;
pub mod transcode;

pub use admission::{AdmissionControl, PermitGuard, QuotaGate};
pub use dedup::DedupIndex;
pub use error::{EngineError, EngineResult};
pub use orchestrator::{ChunkUpload, UploadOrchestrator, UploadOutcome};
pub use state::EngineState;
pub use sweep::{MaintenanceSweeps, SweepStats};
pub use tracker::UploadTracker;
pub use transcode::TranscodePipeline;
