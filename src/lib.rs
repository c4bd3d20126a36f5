//! Key-pooling reverse proxy for the Tavily API.
//!
//! Clients authenticate with a single master key; the proxy multiplexes
//! their traffic across a pool of upstream keys, each carrying a monthly
//! credit quota. The crate tracks per-key usage, hides exhausted or invalid
//! keys, reconciles usage against the upstream's `/usage` endpoint, and
//! keeps time-bucketed request statistics.

pub mod config;
pub mod error;
pub mod jobs;
pub mod master_key;
pub mod mcp;
pub mod proxy;
pub mod quota_sync;
pub mod server;
pub mod stats;
pub mod store;
pub mod sync_job;

pub use config::Config;
pub use error::{classify_status, ProxyError, UpstreamFailure};
pub use master_key::MasterKey;
pub use proxy::{Dispatcher, ProxyRequest, ProxyResponse};
pub use quota_sync::{QuotaReconciler, SyncItemResult, SyncReport};
pub use stats::{StatsAggregator, StatsSnapshot, TimeSeries};
pub use store::{mask_key, ApiKey, KeyPatch, KeyStore, RequestLog};
pub use sync_job::{SyncJobStatus, SyncJobSupervisor};
