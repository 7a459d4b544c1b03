//! # trendstream-core
//!
//! Core library for TrendStream - a session-aware analytics event collector.
//!
//! This library provides:
//! - Session and user identity over pluggable storage
//! - Page context enrichment (path, UTM parameters, device class)
//! - Event envelopes and fire-and-forget delivery with a transport fallback
//! - Auto-tracking observers for pageviews, clicks, scroll depth, searches and exits
//! - Configuration management and logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trendstream_core::{payload, CollectorConfig, PageContext, Tracker};
//!
//! # async fn run() -> trendstream_core::Result<()> {
//! let tracker = Arc::new(
//!     Tracker::builder(CollectorConfig::default())
//!         .page(PageContext::new("https://blog.example.com/?utm_source=ads"))
//!         .build()?,
//! );
//!
//! let _auto = tracker.auto_track();
//! tracker.track("signup", payload([("plan", "pro")]));
//! tracker.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::{CollectorConfig, Config, ConfigOverride};
pub use context::{build_context, classify_device, Context, DeviceClass, PageContext};
pub use envelope::{payload, EventBatch, EventEnvelope, Payload};
pub use error::{Error, Result};
pub use identity::{IdentityResolver, SessionId, UserId};
pub use observers::{AutoTracker, Emitter, PageEvent, Signal};
pub use tracker::{Tracker, TrackerBuilder, DEFAULT_CURRENCY};

// Public modules
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod logging;
pub mod observers;
pub mod storage;
pub mod tracker;
pub mod transport;
