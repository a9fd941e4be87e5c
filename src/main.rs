use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use listing_harvester::core::{HarvestConfig, Harvester, SiteConfig, TraversalMode};
use listing_harvester::proxy::{
    HttpProber, ProxyConfig, ProxyPool, ProxySource, RemoteProxyList, StaticProxySource,
};
use listing_harvester::session::ReqwestBackendFactory;
use listing_harvester::storage::{DiskCheckpointStore, JsonLinesSink, RawArchive};
use listing_harvester::taxonomy::{CategoryId, SourceId, Taxonomy};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Every page until an empty one or the page cap
    Full,
    /// Stop at the newest item seen by the previous pass
    Delta,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Brand/collection id whose listings are harvested
    #[arg(long)]
    source: String,

    /// JSON array of {category_id, category_name, parent_id?}
    #[arg(long)]
    taxonomy: PathBuf,

    /// Comma-separated category ids, or `all`
    #[arg(long, default_value = "all")]
    categories: String,

    /// Page cap per category
    #[arg(long, default_value_t = 10)]
    pages: u32,

    #[arg(long, value_enum, default_value_t = Mode::Full)]
    mode: Mode,

    #[arg(long, default_value_t = 1)]
    workers: usize,

    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// JSON-lines file receiving the harvested items
    #[arg(long, default_value = "items.jsonl")]
    output: PathBuf,

    /// Keep every successful API body under this directory
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Start a fresh pass instead of resuming from the last checkpoint
    #[arg(long)]
    no_resume: bool,

    /// Only establish a session and report on it
    #[arg(long)]
    check: bool,

    #[arg(long, env = "HARVEST_BASE_URL")]
    base_url: Option<String>,

    /// Comma-separated proxy URLs
    #[arg(long, env = "HARVEST_PROXIES")]
    proxies: Option<String>,

    /// URL of a plain-text proxy list, one per line
    #[arg(long, env = "HARVEST_PROXY_LIST_URL")]
    proxy_list_url: Option<Url>,

    #[arg(long, default_value_t = 300)]
    proxy_ttl_secs: u64,

    /// Connect directly while that works; proxies only as fallback
    #[arg(long)]
    prefer_direct: bool,

    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Disable every randomized pause
    #[arg(long)]
    no_delays: bool,

    /// Offer the headless-browser strategy
    #[cfg(feature = "browser")]
    #[arg(long)]
    browser: bool,
}

fn parse_categories(raw: &str) -> anyhow::Result<Option<Vec<CategoryId>>> {
    if raw.trim().eq_ignore_ascii_case("all") {
        return Ok(None);
    }
    let ids = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<CategoryId>()
                .with_context(|| format!("invalid category id `{}`", s))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    if ids.is_empty() {
        bail!("--categories needs at least one id or `all`");
    }
    Ok(Some(ids))
}

fn build_config(cli: &Cli) -> HarvestConfig {
    let mut site = SiteConfig::default();
    if let Some(base_url) = &cli.base_url {
        site = site.with_base_url(base_url.clone());
    }
    let mode = match cli.mode {
        Mode::Full => TraversalMode::Exhaustive,
        Mode::Delta => TraversalMode::Delta,
    };
    let config = HarvestConfig::default()
        .with_site(site)
        .with_mode(mode)
        .with_page_cap(cli.pages)
        .with_workers(cli.workers)
        .with_timeout(Duration::from_secs(cli.timeout_secs))
        .with_resume(!cli.no_resume);
    if cli.no_delays {
        config.without_delays()
    } else {
        config
    }
}

fn build_proxy_pool(cli: &Cli) -> anyhow::Result<ProxyPool> {
    let mut sources: Vec<Box<dyn ProxySource>> = Vec::new();
    if let Some(list) = &cli.proxies {
        let source = StaticProxySource::from_list(list);
        if !source.is_empty() {
            sources.push(Box::new(source));
        }
    }
    if let Some(url) = &cli.proxy_list_url {
        sources.push(Box::new(RemoteProxyList::new(
            url.clone(),
            Duration::from_secs(cli.timeout_secs),
        )?));
    }
    if sources.is_empty() {
        return Ok(ProxyPool::direct());
    }
    Ok(ProxyPool::new(
        ProxyConfig::default()
            .with_ttl(Duration::from_secs(cli.proxy_ttl_secs))
            .with_prefer_direct(cli.prefer_direct),
        sources,
        Arc::new(HttpProber::with_defaults()?),
    ))
}

#[cfg(feature = "browser")]
async fn close_browser(driver: Option<Arc<listing_harvester::scrapers::ChromiumDriver>>) {
    use listing_harvester::scrapers::BrowserDriver;
    if let Some(driver) = driver {
        driver.shutdown().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .filter_module("selectors", log::LevelFilter::Warn)
        .filter_module("html5ever", log::LevelFilter::Warn)
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli);

    let mut taxonomy = Taxonomy::load(&cli.taxonomy)
        .with_context(|| format!("loading taxonomy {}", cli.taxonomy.display()))?;
    if let Some(ids) = parse_categories(&cli.categories)? {
        taxonomy = taxonomy.select(&ids)?;
    }
    if taxonomy.is_empty() {
        bail!("no categories selected");
    }

    let factory = ReqwestBackendFactory::new(&config);
    #[cfg(feature = "browser")]
    let (factory, driver) = if cli.browser {
        let driver = Arc::new(
            listing_harvester::scrapers::ChromiumDriver::launch(
                listing_harvester::scrapers::ChromiumConfig::default(),
            )
            .await
            .context("launching Chromium")?,
        );
        (factory.with_browser(driver.clone()), Some(driver))
    } else {
        (factory, None)
    };

    let checkpoints = Arc::new(
        DiskCheckpointStore::new(&cli.checkpoint_dir)
            .with_context(|| format!("opening {}", cli.checkpoint_dir.display()))?,
    );
    let sink = Arc::new(
        JsonLinesSink::open(&cli.output)
            .await
            .with_context(|| format!("opening {}", cli.output.display()))?,
    );

    let cancel = CancellationToken::new();
    let mut harvester = Harvester::new(
        config,
        SourceId::new(cli.source.clone()),
        taxonomy,
        Arc::new(factory),
        checkpoints,
        sink,
    )
    .with_proxies(Arc::new(build_proxy_pool(&cli)?))
    .with_cancellation(cancel.clone());
    if let Some(dir) = &cli.archive_dir {
        harvester = harvester.with_archive(RawArchive::new(dir)?);
    }

    if cli.check {
        let probe = harvester.probe_session().await?;
        println!(
            "Session OK: {} via {}, anon id {}, csrf token {}",
            probe.backend,
            probe.proxy.as_deref().unwrap_or("direct"),
            probe.anon_id,
            if probe.has_csrf_token { "present" } else { "absent" }
        );
        return Ok(());
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current request");
            cancel.cancel();
        }
    });

    let result = harvester.run().await;

    #[cfg(feature = "browser")]
    close_browser(driver).await;

    let report = result.context("harvest aborted")?;
    harvester.stats().print_summary();
    report.print_summary();
    info!("Done");
    Ok(())
}
