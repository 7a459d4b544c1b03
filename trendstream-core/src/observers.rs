//! Auto-tracking observers
//!
//! Each observer turns one kind of page interaction into an emission. Observers
//! only depend on an [`Emitter`], so they can be attached, detached and tested
//! without a tracker or a real page. Toggles are checked when the interaction
//! happens, not when the observer is built, so configuration changes apply to
//! every later interaction.
//!
//! | Observer | Signal | Event type |
//! |----------|--------|------------|
//! | [`PageviewObserver`] | pageview | `pageview` |
//! | [`ClickObserver`] | click | `click` |
//! | [`ScrollObserver`] | scroll | `scroll_depth` |
//! | [`SearchObserver`] | search | `search` |
//! | [`ExitObserver`] | always on | `page_exit` |

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::PageContext;
use crate::envelope::{payload, Payload};

/// Scroll thresholds in percent, each reported at most once per page view
pub const SCROLL_THRESHOLDS: [u8; 4] = [25, 50, 75, 100];

/// Visible characters of a clicked element's text that are reported
pub const CLICK_TEXT_LIMIT: usize = 100;

/// Auto-tracking toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Pageview,
    Click,
    Scroll,
    Search,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Pageview => "pageview",
            Signal::Click => "click",
            Signal::Scroll => "scroll",
            Signal::Search => "search",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for observer emissions
pub trait Emitter: Send + Sync {
    /// Emit one event. Never fails from the caller's point of view.
    fn emit(&self, event_type: &str, payload: Payload);

    /// Whether auto-tracking for `signal` is currently enabled
    fn tracks(&self, _signal: Signal) -> bool {
        true
    }

    /// Current time as seen by the emitter
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================
// Interaction model
// ============================================

/// An element in the click target's ancestor chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Tag name, any case (`A`, `button`, ...)
    pub tag: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    /// Visible text content
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub parent: Option<Box<Element>>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent: Element) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Nearest element, starting with `self`, that matches `pred`
    pub fn closest(&self, pred: impl Fn(&Element) -> bool) -> Option<&Element> {
        let mut current = Some(self);
        while let Some(el) = current {
            if pred(el) {
                return Some(el);
            }
            current = el.parent.as_deref();
        }
        None
    }

    fn is_link_or_button(&self) -> bool {
        self.tag.eq_ignore_ascii_case("a") || self.tag.eq_ignore_ascii_case("button")
    }
}

/// Scroll position of the page
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollMetrics {
    pub scroll_y: f64,
    pub viewport_height: f64,
    pub document_height: f64,
}

impl ScrollMetrics {
    /// `(scroll_y + viewport_height) / document_height * 100`, clamped to 0..=100.
    ///
    /// A document without height counts as fully seen.
    pub fn percent(&self) -> f64 {
        if self.document_height <= 0.0 {
            return 100.0;
        }
        let percent = (self.scroll_y + self.viewport_height) / self.document_height * 100.0;
        if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        }
    }
}

/// One input of a submitted form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormInput {
    #[serde(default, rename = "type")]
    pub input_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub value: String,
}

impl FormInput {
    fn looks_like_search(&self) -> bool {
        let by_type = self
            .input_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("search"));
        let by_class = self.classes.iter().any(|c| c == "search-input");
        let by_name = self.name.as_deref().is_some_and(|n| {
            let n = n.to_ascii_lowercase();
            n.contains("search") || n.contains("query") || n.contains("keyword")
        });
        by_type || by_class || by_name
    }
}

/// A submitted form
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Form {
    #[serde(default)]
    pub inputs: Vec<FormInput>,
}

/// Raw page interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PageEvent {
    Click { target: Element },
    Scroll(ScrollMetrics),
    Submit { form: Form },
    Unload {
        #[serde(default)]
        scroll: Option<ScrollMetrics>,
    },
}

// ============================================
// Observers
// ============================================

/// Emits one `pageview` per page view
pub struct PageviewObserver {
    emitter: Arc<dyn Emitter>,
    fired: bool,
}

impl PageviewObserver {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self {
            emitter,
            fired: false,
        }
    }

    /// Report the page load. Only the first call can emit.
    pub fn on_load(&mut self, page: &PageContext) {
        if std::mem::replace(&mut self.fired, true) {
            return;
        }
        if self.emitter.tracks(Signal::Pageview) {
            self.emitter.emit(
                "pageview",
                payload([
                    ("title", page.title.as_str()),
                    ("url", page.url.as_str()),
                ]),
            );
        }
    }
}

/// Emits `click` for clicks on links and buttons
pub struct ClickObserver {
    emitter: Arc<dyn Emitter>,
}

impl ClickObserver {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self { emitter }
    }

    pub fn on_click(&self, target: &Element) {
        if !self.emitter.tracks(Signal::Click) {
            return;
        }
        let Some(el) = target.closest(Element::is_link_or_button) else {
            return;
        };

        let text: String = el.text.trim().chars().take(CLICK_TEXT_LIMIT).collect();
        let class = if el.classes.is_empty() {
            Value::Null
        } else {
            Value::String(el.classes.join(" "))
        };

        let mut data = Payload::new();
        data.insert("element".into(), Value::String(el.tag.to_ascii_lowercase()));
        data.insert("id".into(), el.id.clone().map_or(Value::Null, Value::String));
        data.insert("class".into(), class);
        data.insert("text".into(), Value::String(text));
        if let Some(href) = &el.href {
            data.insert("href".into(), Value::String(href.clone()));
        }

        self.emitter.emit("click", data);
    }
}

/// Emits `scroll_depth` once per crossed threshold
pub struct ScrollObserver {
    emitter: Arc<dyn Emitter>,
    reached: [bool; SCROLL_THRESHOLDS.len()],
}

impl ScrollObserver {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self {
            emitter,
            reached: [false; SCROLL_THRESHOLDS.len()],
        }
    }

    pub fn on_scroll(&mut self, metrics: ScrollMetrics) {
        if !self.emitter.tracks(Signal::Scroll) {
            return;
        }
        let percent = metrics.percent();

        for (latch, threshold) in self.reached.iter_mut().zip(SCROLL_THRESHOLDS) {
            if *latch || percent < f64::from(threshold) {
                continue;
            }
            *latch = true;
            self.emitter.emit("scroll_depth", payload([("depth", threshold)]));
        }
    }

    /// Thresholds reported so far
    pub fn reached(&self) -> Vec<u8> {
        SCROLL_THRESHOLDS
            .iter()
            .zip(self.reached)
            .filter_map(|(t, hit)| hit.then_some(*t))
            .collect()
    }
}

/// Emits `search` for submitted search forms
pub struct SearchObserver {
    emitter: Arc<dyn Emitter>,
}

impl SearchObserver {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self { emitter }
    }

    /// Inspect a submitted form. Submission itself is never blocked.
    pub fn on_submit(&self, form: &Form) {
        if !self.emitter.tracks(Signal::Search) {
            return;
        }
        let Some(input) = form.inputs.iter().find(|i| i.looks_like_search()) else {
            return;
        };
        let keyword = input.value.trim();
        if keyword.is_empty() {
            return;
        }
        self.emitter.emit("search", payload([("keyword", keyword)]));
    }
}

/// Emits `page_exit` with time on page and final scroll depth
pub struct ExitObserver {
    emitter: Arc<dyn Emitter>,
    started_at: DateTime<Utc>,
}

impl ExitObserver {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        let started_at = emitter.now();
        Self {
            emitter,
            started_at,
        }
    }

    pub fn on_unload(&self, scroll: Option<ScrollMetrics>) {
        let elapsed_ms = (self.emitter.now() - self.started_at).num_milliseconds().max(0);
        let seconds = elapsed_ms as f64 / 1000.0;
        let depth = scroll.map(|m| m.percent()).unwrap_or(0.0);

        self.emitter.emit(
            "page_exit",
            payload([
                ("time_on_page", seconds.round() as i64),
                ("scroll_depth", depth.round() as i64),
            ]),
        );
    }
}

// ============================================
// AutoTracker
// ============================================

/// All observers for one page view
///
/// Observers are attached for the signals enabled at construction time; the
/// pageview fires immediately. Events after `Unload` are ignored.
pub struct AutoTracker {
    click: Option<ClickObserver>,
    scroll: Option<ScrollObserver>,
    search: Option<SearchObserver>,
    exit: ExitObserver,
    last_scroll: Option<ScrollMetrics>,
    unloaded: bool,
}

impl AutoTracker {
    pub fn attach(emitter: Arc<dyn Emitter>, page: &PageContext) -> Self {
        if emitter.tracks(Signal::Pageview) {
            PageviewObserver::new(Arc::clone(&emitter)).on_load(page);
        }

        let enabled = |signal| emitter.tracks(signal);
        let tracker = Self {
            click: enabled(Signal::Click).then(|| ClickObserver::new(Arc::clone(&emitter))),
            scroll: enabled(Signal::Scroll).then(|| ScrollObserver::new(Arc::clone(&emitter))),
            search: enabled(Signal::Search).then(|| SearchObserver::new(Arc::clone(&emitter))),
            exit: ExitObserver::new(Arc::clone(&emitter)),
            last_scroll: None,
            unloaded: false,
        };

        tracing::debug!(
            url = %page.url,
            click = tracker.click.is_some(),
            scroll = tracker.scroll.is_some(),
            search = tracker.search.is_some(),
            "Auto-tracking attached"
        );
        tracker
    }

    /// Stop observing `signal` for the rest of this page view
    pub fn detach(&mut self, signal: Signal) {
        match signal {
            Signal::Click => self.click = None,
            Signal::Scroll => self.scroll = None,
            Signal::Search => self.search = None,
            Signal::Pageview => {}
        }
    }

    pub fn is_attached(&self, signal: Signal) -> bool {
        match signal {
            Signal::Click => self.click.is_some(),
            Signal::Scroll => self.scroll.is_some(),
            Signal::Search => self.search.is_some(),
            Signal::Pageview => true,
        }
    }

    pub fn handle(&mut self, event: &PageEvent) {
        if self.unloaded {
            return;
        }
        match event {
            PageEvent::Click { target } => {
                if let Some(observer) = &self.click {
                    observer.on_click(target);
                }
            }
            PageEvent::Scroll(metrics) => {
                self.last_scroll = Some(*metrics);
                if let Some(observer) = &mut self.scroll {
                    observer.on_scroll(*metrics);
                }
            }
            PageEvent::Submit { form } => {
                if let Some(observer) = &self.search {
                    observer.on_submit(form);
                }
            }
            PageEvent::Unload { scroll } => {
                self.unloaded = true;
                self.exit.on_unload(scroll.or(self.last_scroll));
            }
        }
    }
}
