use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use browserless_client::BrowserlessClient;
use placecrawl_common::{load_config, Config, FileConfig};
use placecrawl_crawler::browser::{BrowserBackend, ChromeBrowser};
use placecrawl_crawler::search::BrowserCandidateSource;
use placecrawl_crawler::targets::{load_targets, missing_artifacts};
use placecrawl_crawler::{
    Acceptance, ContentLoader, ContextPool, Crawler, CrawlerDeps, Orchestrator, PhaseSettings,
    RetryPolicy, SelectorExtractor,
};
use placecrawl_store::{export_json, CsvStore};

#[derive(Parser)]
#[command(name = "placecrawl", about = "Resumable place and review crawler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan and crawl targets from the target list
    Crawl {
        /// Only these districts (comma separated)
        #[arg(long, value_delimiter = ',')]
        districts: Vec<String>,
        /// Stop after this many targets
        #[arg(long)]
        limit_targets: Option<usize>,
    },
    /// Re-attempt every entity in the failure logs
    RetryFailed,
    /// List targets missing place_info or reviews output
    Missing {
        #[arg(long, value_delimiter = ',')]
        districts: Vec<String>,
    },
    /// Convert every CSV artifact to a JSON array
    ExportJson {
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("placecrawl=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    config.log_redacted();

    match cli.command {
        Command::Crawl {
            districts,
            limit_targets,
        } => {
            let mut targets = load_targets(&config.targets_path, &districts)?;
            if let Some(limit) = limit_targets {
                targets.truncate(limit);
            }
            info!(targets = targets.len(), "Targets loaded");
            with_crawler(&config, |crawler| async move {
                crawler.run(&targets).await;
                Ok(())
            })
            .await?;
        }
        Command::RetryFailed => {
            with_crawler(&config, |crawler| async move {
                crawler.reprocess_failed().await?;
                Ok(())
            })
            .await?;
        }
        Command::Missing { districts } => {
            let targets = load_targets(&config.targets_path, &districts)?;
            let store = CsvStore::new(&config.data_dir);
            let missing = missing_artifacts(&targets, &store).await?;
            for entry in &missing {
                let kinds: Vec<&str> = entry.kinds.iter().map(|k| k.dir()).collect();
                info!(
                    target_id = %entry.target.id,
                    search_key = entry.target.search_key.as_str(),
                    missing = kinds.join(",").as_str(),
                    "Missing output"
                );
            }
            info!(checked = targets.len(), missing = missing.len(), "Audit complete");
        }
        Command::ExportJson { out } => {
            let data_dir = config.data_dir.clone();
            let summary = tokio::task::spawn_blocking(move || export_json(&data_dir, &out))
                .await
                .context("Export task panicked")??;
            info!(files = summary.files, rows = summary.rows, "Export complete");
        }
    }

    Ok(())
}

/// Build the browser-backed crawler, hand it to `f`, then shut the browser
/// down whatever `f` returned.
async fn with_crawler<F, Fut>(config: &Config, f: F) -> Result<()>
where
    F: FnOnce(Crawler) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut file_config = load_config(&config.config_path)?;
    let backend = match &config.browserless_url {
        Some(url) => {
            let client = BrowserlessClient::new(url, config.browserless_token.as_deref())?;
            apply_remote_ceiling(&client, &mut file_config).await;
            BrowserBackend::Remote {
                ws_url: client.devtools_endpoint()?,
            }
        }
        None => BrowserBackend::Local {
            chrome_bin: config.chrome_bin.clone(),
            headless: config.headless,
        },
    };
    file_config.validate()?;

    let browser = Arc::new(ChromeBrowser::launch(&backend).await?);
    let crawler = build_crawler(config, &file_config, browser.clone())?;

    let result = f(crawler).await;

    if let Err(e) = browser.shutdown().await {
        warn!(error = %e, "Browser shutdown failed");
    }
    result
}

/// Lower the context limit to what the remote deployment allows.
async fn apply_remote_ceiling(client: &BrowserlessClient, file_config: &mut FileConfig) {
    let phases = file_config.site.phases().len();
    match client.pressure().await {
        Ok(pressure) => {
            if !pressure.is_available {
                warn!(reason = pressure.reason.as_str(), "Remote browser reports unavailable");
            }
            let ceiling = pressure.max_concurrent as usize;
            if file_config.crawl.cap_contexts(ceiling, phases) {
                warn!(
                    ceiling,
                    context_limit = file_config.crawl.context_limit,
                    item_capacity = file_config.crawl.item_capacity,
                    "Capped concurrency to remote browser limit"
                );
            }
            let free = pressure.free_slots() as usize;
            if free < file_config.crawl.context_limit {
                warn!(
                    free,
                    running = pressure.running,
                    context_limit = file_config.crawl.context_limit,
                    "Remote browser is shared; contexts beyond the free slots will queue"
                );
            }
        }
        Err(e) => warn!(error = %e, "Could not read remote browser pressure; using configured limits"),
    }
}

fn build_crawler(
    config: &Config,
    file_config: &FileConfig,
    browser: Arc<ChromeBrowser>,
) -> Result<Crawler> {
    let crawl = &file_config.crawl;
    let pool = ContextPool::new(browser, crawl.context_limit);
    let loader = ContentLoader::new(file_config.loader.clone());
    let settings = PhaseSettings::from_config(crawl);
    let site = Arc::new(file_config.site.clone());

    let extractor = Arc::new(SelectorExtractor::new(&site)?);
    let orchestrator = Orchestrator::new(
        pool.clone(),
        extractor,
        site.clone(),
        loader.clone(),
        settings.clone(),
    );
    let phases_per_item = orchestrator.phases().len();
    let candidates =
        BrowserCandidateSource::new(pool, loader, file_config.search.clone(), settings)?;
    let store = Arc::new(CsvStore::new(&config.data_dir));

    let deps = CrawlerDeps::builder()
        .sink(store.clone())
        .failures(store)
        .fetcher(Arc::new(orchestrator))
        .candidates(Arc::new(candidates))
        .policy(RetryPolicy::from_config(crawl))
        .item_capacity(crawl.item_capacity)
        .phases_per_item(phases_per_item)
        .context_limit(crawl.context_limit)
        .acceptance(Acceptance::from_config(&file_config.acceptance))
        .candidate_limit(crawl.candidate_limit())
        .build();

    Ok(Crawler::new(deps)?)
}
