//! The event collector
//!
//! A [`Tracker`] owns everything one page context needs:
//! - its configuration
//! - the current page snapshot
//! - the identity stores
//! - the transports
//!
//! Several trackers can live side by side with different configurations.
//!
//! ## Emission
//!
//! `emit` builds an envelope from identity, context and the caller's payload. It then
//! hands `{"events": [envelope]}` to the beacon transport. If the beacon is disabled
//! or refuses the batch, the keep-alive transport takes it. Nothing is awaited,
//! retried or returned: telemetry must never disturb the host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::{CollectorConfig, ConfigOverride};
use crate::context::{build_context, Context, PageContext};
use crate::envelope::{payload, EventBatch, EventEnvelope, Payload};
use crate::error::Result;
use crate::identity::{IdentityResolver, SessionId, UserId};
use crate::observers::{AutoTracker, Emitter, Signal};
use crate::storage::{DurableStore, MemoryStore, SessionStore};
use crate::transport::{BeaconTransport, HttpSender, KeepaliveTransport, Transport};

/// Currency used by [`Tracker::conversion`] when none is given
pub const DEFAULT_CURRENCY: &str = "KRW";

/// Time source
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// HTTP transports that need draining on shutdown
struct HttpTransports {
    beacon: Option<Arc<BeaconTransport>>,
    keepalive: Arc<KeepaliveTransport>,
}

/// Session-aware event collector
pub struct Tracker {
    config: RwLock<CollectorConfig>,
    page: RwLock<PageContext>,
    identity: Mutex<IdentityResolver>,
    primary: Option<Arc<dyn Transport>>,
    fallback: Arc<dyn Transport>,
    http: Option<HttpTransports>,
    debug: Arc<AtomicBool>,
    clock: Clock,
}

/// Builder for [`Tracker`]
pub struct TrackerBuilder {
    config: CollectorConfig,
    page: PageContext,
    session_store: Option<Box<dyn SessionStore>>,
    durable_store: Option<Box<dyn DurableStore>>,
    transports: Option<(Option<Arc<dyn Transport>>, Arc<dyn Transport>)>,
    clock: Option<Clock>,
}

impl TrackerBuilder {
    pub fn page(mut self, page: PageContext) -> Self {
        self.page = page;
        self
    }

    pub fn session_store(mut self, store: Box<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn durable_store(mut self, store: Box<dyn DurableStore>) -> Self {
        self.durable_store = Some(store);
        self
    }

    /// Replace the HTTP transports, e.g. with [`MemoryTransport`](crate::transport::MemoryTransport)
    pub fn transports(
        mut self,
        primary: Option<Arc<dyn Transport>>,
        fallback: Arc<dyn Transport>,
    ) -> Self {
        self.transports = Some((primary, fallback));
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the tracker.
    ///
    /// Without explicit transports this starts the HTTP transports and therefore
    /// must run inside a Tokio runtime.
    pub fn build(self) -> Result<Tracker> {
        let debug = Arc::new(AtomicBool::new(self.config.debug));

        let (primary, fallback, http) = match self.transports {
            Some((primary, fallback)) => (primary, fallback, None),
            None => {
                let sender = Arc::new(HttpSender::new(&self.config)?);
                let beacon = if self.config.beacon {
                    Some(Arc::new(BeaconTransport::spawn(
                        Arc::clone(&sender),
                        self.config.beacon_queue_size,
                        Arc::clone(&debug),
                    )?))
                } else {
                    None
                };
                let keepalive = Arc::new(KeepaliveTransport::new(sender, Arc::clone(&debug))?);

                let primary = beacon.clone().map(|b| b as Arc<dyn Transport>);
                let fallback: Arc<dyn Transport> = keepalive.clone();
                (primary, fallback, Some(HttpTransports { beacon, keepalive }))
            }
        };

        let identity = IdentityResolver::new(
            self.session_store
                .unwrap_or_else(|| Box::new(MemoryStore::new()) as Box<dyn SessionStore>),
            self.durable_store
                .unwrap_or_else(|| Box::new(MemoryStore::new()) as Box<dyn DurableStore>),
        );

        tracing::debug!(
            api_url = %self.config.api_url,
            beacon = primary.is_some(),
            "Tracker initialized"
        );

        Ok(Tracker {
            config: RwLock::new(self.config),
            page: RwLock::new(self.page),
            identity: Mutex::new(identity),
            primary,
            fallback,
            http,
            debug,
            clock: self.clock.unwrap_or_else(|| Arc::new(Utc::now) as Clock),
        })
    }
}

impl Tracker {
    pub fn builder(config: CollectorConfig) -> TrackerBuilder {
        TrackerBuilder {
            config,
            page: PageContext::default(),
            session_store: None,
            durable_store: None,
            transports: None,
            clock: None,
        }
    }

    // ============================================
    // Public surface
    // ============================================

    /// Track an arbitrary event
    pub fn track(&self, event_type: &str, data: Payload) {
        self.emit_event(event_type, data);
    }

    /// Track a conversion worth `value` in `currency` (default KRW)
    pub fn conversion(&self, value: f64, currency: Option<&str>) {
        let value = serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number);
        self.emit_event(
            "conversion",
            payload([
                ("value", value),
                ("currency", Value::from(currency.unwrap_or(DEFAULT_CURRENCY))),
            ]),
        );
    }

    /// Track an explicit search
    pub fn search(&self, keyword: &str) {
        self.emit_event("search", payload([("keyword", keyword)]));
    }

    /// Track a post view
    pub fn view_post(&self, post_id: &str, post_title: &str, keywords: &[String]) {
        self.emit_event(
            "view_post",
            payload([
                ("post_id", Value::from(post_id)),
                ("post_title", Value::from(post_title)),
                ("keywords", Value::from(keywords.to_vec())),
            ]),
        );
    }

    /// Turn on verbose delivery diagnostics
    pub fn enable_debug(&self) {
        self.debug.store(true, Ordering::Relaxed);
        self.write_config().debug = true;
        tracing::info!("Debug mode enabled");
    }

    /// Merge a partial configuration. Values are not validated.
    pub fn config(&self, patch: ConfigOverride) {
        let mut config = self.write_config();
        config.merge(patch);
        self.debug.store(config.debug, Ordering::Relaxed);
    }

    pub fn current_config(&self) -> CollectorConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the page snapshot (navigation)
    pub fn set_page(&self, page: PageContext) {
        *self
            .page
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = page;
    }

    pub fn page(&self) -> PageContext {
        self.page
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Context that the next envelope would carry
    pub fn build_context(&self) -> Context {
        build_context(&self.page(), &self.current_config())
    }

    /// Stored identifiers, without refreshing activity or minting new ones
    pub fn identity(&self) -> (Option<SessionId>, Option<UserId>) {
        let now = (self.clock)();
        self.identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .peek(now)
    }

    /// Attach auto-tracking observers for the current page
    pub fn auto_track(self: &Arc<Self>) -> AutoTracker {
        let page = self.page();
        let emitter: Arc<dyn Emitter> = Arc::clone(self) as Arc<dyn Emitter>;
        AutoTracker::attach(emitter, &page)
    }

    /// Drain queued and in-flight deliveries
    pub async fn shutdown(&self) {
        if let Some(http) = &self.http {
            if let Some(beacon) = &http.beacon {
                beacon.close().await;
            }
            http.keepalive.close().await;
        }
        tracing::debug!("Tracker shut down");
    }

    // ============================================
    // Emission
    // ============================================

    fn write_config(&self) -> std::sync::RwLockWriteGuard<'_, CollectorConfig> {
        self.config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit_event(&self, event_type: &str, data: Payload) {
        let now = (self.clock)();
        let config = self.current_config();
        let page = self.page();

        let (session_id, user_id) = {
            let mut identity = self
                .identity
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let session_id = identity.resolve_session_id(now, config.session_timeout());
            let user_id = identity.resolve_user_id(now, config.user_id_ttl(), &page.user_agent);
            (session_id, user_id)
        };

        let context = build_context(&page, &config);
        let envelope = EventEnvelope::new(now, &session_id, &user_id, context, event_type, data);

        if self.debug.load(Ordering::Relaxed) {
            tracing::info!(
                event_type = %envelope.event_type,
                session_id = %session_id,
                data = ?envelope.event_data,
                "Tracking event"
            );
        }

        self.deliver(&config.api_url, EventBatch::single(envelope));
    }

    fn deliver(&self, endpoint: &str, batch: EventBatch) {
        if let Some(primary) = &self.primary {
            if primary.dispatch(endpoint, batch.clone()) {
                return;
            }
            tracing::debug!("Beacon refused batch, using keep-alive transport");
        }

        if !self.fallback.dispatch(endpoint, batch) {
            tracing::debug!(endpoint = %endpoint, "Event dropped: no transport accepted it");
        }
    }
}

impl Emitter for Tracker {
    fn emit(&self, event_type: &str, payload: Payload) {
        self.emit_event(event_type, payload);
    }

    fn tracks(&self, signal: Signal) -> bool {
        let config = self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match signal {
            Signal::Pageview => config.auto_track.pageview,
            Signal::Click => config.auto_track.click,
            Signal::Scroll => config.auto_track.scroll,
            Signal::Search => config.auto_track.search,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}
