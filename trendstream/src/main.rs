//! trendstream - emit analytics events to a TrendStream collection endpoint
//!
//! This tool provides commands for:
//! - Tracking custom events, conversions, searches and post views
//! - Replaying recorded page interactions through the auto-tracking observers
//! - Inspecting configuration and the stored identity
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/trendstream/config.toml (~/.config/trendstream/config.toml)
//! - User id: $XDG_DATA_HOME/trendstream/identity.json (~/.local/share/trendstream/identity.json)
//! - Session: $XDG_STATE_HOME/trendstream/session.json (~/.local/state/trendstream/session.json)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use trendstream_core::storage::FileStore;
use trendstream_core::transport::MemoryTransport;
use trendstream_core::{
    logging, CollectorConfig, Config, ConfigOverride, PageContext, PageEvent, Payload, Tracker,
    DEFAULT_CURRENCY,
};

#[derive(Parser)]
#[command(name = "trendstream")]
#[command(about = "Emit analytics events to a TrendStream collection endpoint")]
#[command(version)]
struct Args {
    /// Write logs to the state directory
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log every emitted event and delivery failures
    #[arg(long, global = true)]
    debug: bool,

    /// Print event batches as JSON lines instead of sending them
    #[arg(long, global = true)]
    dry_run: bool,

    /// Collection endpoint (overrides config)
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(flatten)]
    page: PageArgs,

    #[command(subcommand)]
    command: Command,
}

/// Page the events are attributed to
#[derive(clap::Args)]
struct PageArgs {
    /// Page URL, including any utm_* query parameters
    #[arg(long, global = true, default_value = "/")]
    url: String,

    /// Page title
    #[arg(long, global = true, default_value = "")]
    title: String,

    /// Referrer URL
    #[arg(long, global = true)]
    referrer: Option<String>,

    /// User-agent string used for device classification
    #[arg(long, global = true)]
    user_agent: Option<String>,

    /// Locale, e.g. ko-KR
    #[arg(long, global = true)]
    locale: Option<String>,
}

impl PageArgs {
    fn into_page(self) -> PageContext {
        PageContext {
            url: self.url,
            title: self.title,
            referrer: self.referrer,
            user_agent: self
                .user_agent
                .unwrap_or_else(|| concat!("trendstream-cli/", env!("CARGO_PKG_VERSION")).to_string()),
            locale: self.locale,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, file locations and the stored identity
    Status,

    /// Track a custom event
    Track {
        /// Event type tag
        event_type: String,

        /// Event payload as a JSON object
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Track a conversion
    Conversion {
        value: f64,

        #[arg(short, long, default_value = DEFAULT_CURRENCY)]
        currency: String,
    },

    /// Track a search
    Search { keyword: String },

    /// Track a post view
    ViewPost {
        post_id: String,
        post_title: String,

        /// Post keyword (repeatable)
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,
    },

    /// Replay page interactions (JSON lines) through auto-tracking
    Replay { file: PathBuf },
}

/// Options shared by every emitting command
struct EmitOptions {
    debug: bool,
    dry_run: bool,
    api_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        verbose,
        debug,
        dry_run,
        api_url,
        page,
        command,
    } = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if verbose {
        Some(logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    let opts = EmitOptions {
        debug,
        dry_run,
        api_url,
    };
    let page = page.into_page();

    match command {
        Command::Status => cmd_status(config.collector, &opts, page),
        command => cmd_emit(config.collector, &opts, page, command).await,
    }
}

fn build_tracker(
    mut collector: CollectorConfig,
    opts: &EmitOptions,
    page: PageContext,
) -> Result<(Arc<Tracker>, Option<Arc<MemoryTransport>>)> {
    collector.merge(ConfigOverride {
        api_url: opts.api_url.clone(),
        ..Default::default()
    });

    let builder = Tracker::builder(collector)
        .page(page)
        .session_store(Box::new(FileStore::new(Config::session_store_path())))
        .durable_store(Box::new(FileStore::new(Config::durable_store_path())));

    let (builder, sink) = if opts.dry_run {
        let sink = Arc::new(MemoryTransport::new());
        (builder.transports(None, sink.clone()), Some(sink))
    } else {
        (builder, None)
    };

    let tracker = builder.build().context("failed to create tracker")?;
    if opts.debug {
        tracker.enable_debug();
    }
    Ok((Arc::new(tracker), sink))
}

fn cmd_status(collector: CollectorConfig, opts: &EmitOptions, page: PageContext) -> Result<()> {
    let dry = EmitOptions {
        debug: false,
        dry_run: true,
        api_url: opts.api_url.clone(),
    };
    let (tracker, _) = build_tracker(collector, &dry, page)?;
    let config = tracker.current_config();

    println!("TrendStream Collector");
    println!("=====================");
    println!();
    println!("Endpoint:          {}", config.api_url);
    println!(
        "Session Timeout:   {}m",
        config.session_duration / 60_000
    );
    println!("Country:           {}", config.country);
    println!("User Id Expiry:    {}d", config.user_id_expiry_days);
    println!("Beacon:            {}", config.beacon);
    println!("Timeout:           {}s", config.timeout_secs);
    println!(
        "Auto-track:        pageview={} click={} scroll={} search={}",
        config.auto_track.pageview,
        config.auto_track.click,
        config.auto_track.scroll,
        config.auto_track.search
    );

    println!();
    println!("Config:            {}", Config::config_path().display());
    println!("Identity Store:    {}", Config::durable_store_path().display());
    println!("Session Store:     {}", Config::session_store_path().display());
    println!("Log File:          {}", logging::log_file_path().display());

    let (session_id, user_id) = tracker.identity();
    println!();
    println!(
        "User Id:           {}",
        user_id.map_or_else(|| "<none>".to_string(), |id| id.to_string())
    );
    println!(
        "Session Id:        {}",
        session_id.map_or_else(|| "<none>".to_string(), |id| id.to_string())
    );

    Ok(())
}

async fn cmd_emit(
    collector: CollectorConfig,
    opts: &EmitOptions,
    page: PageContext,
    command: Command,
) -> Result<()> {
    let (tracker, sink) = build_tracker(collector, opts, page)?;

    let emitted = match command {
        Command::Status => bail!("status does not emit events"),
        Command::Track { event_type, data } => {
            let data = match data {
                Some(raw) => parse_payload(&raw)?,
                None => Payload::new(),
            };
            tracker.track(&event_type, data);
            1
        }
        Command::Conversion { value, currency } => {
            tracker.conversion(value, Some(&currency));
            1
        }
        Command::Search { keyword } => {
            tracker.search(&keyword);
            1
        }
        Command::ViewPost {
            post_id,
            post_title,
            keywords,
        } => {
            tracker.view_post(&post_id, &post_title, &keywords);
            1
        }
        Command::Replay { file } => {
            let events = read_page_events(&file)?;
            let mut auto = tracker.auto_track();
            for event in &events {
                auto.handle(event);
            }
            events.len()
        }
    };

    tracker.shutdown().await;

    match sink {
        Some(sink) => {
            for (_, batch) in sink.take() {
                println!("{}", serde_json::to_string(&batch)?);
            }
        }
        None => {
            tracing::info!(count = emitted, "Dispatched events");
            eprintln!(
                "Dispatched {} interaction(s) to {}",
                emitted,
                tracker.current_config().api_url
            );
        }
    }

    Ok(())
}

fn parse_payload(raw: &str) -> Result<Payload> {
    match serde_json::from_str::<serde_json::Value>(raw).context("--data is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(map),
        other => bail!("--data must be a JSON object, got {}", other),
    }
}

/// Read page events, one JSON object per line. Blank lines and `#` comments are skipped.
fn read_page_events(path: &Path) -> Result<Vec<PageEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid page event", path.display(), idx + 1))
        })
        .collect()
}
