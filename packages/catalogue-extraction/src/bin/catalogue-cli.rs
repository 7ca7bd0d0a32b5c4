//! Operator CLI for local recipe detection and crawl runs.
//!
//! Everything runs in process against the in-memory store and queue; results
//! are printed as JSON.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use catalogue_extraction::ai::OpenAiLlm;
use catalogue_extraction::{
    logging, CatalogueService, CatalogueType, DataItem, EngineConfig, Extraction, HttpBrowser,
    JobWorkerConfig, MemoryJobQueue, MemoryStore, PageType, Recipe, RecipeDetectionStatus,
};

#[derive(Parser)]
#[command(name = "catalogue-cli")]
#[command(about = "Detect and run catalogue extraction recipes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the recipe configuration of a catalogue
    Detect {
        url: String,
        #[arg(long, value_enum, default_value = "courses")]
        catalogue_type: CatalogueKind,
    },

    /// Detect a recipe, then crawl it and print the extracted items
    Crawl {
        url: String,
        #[arg(long, value_enum, default_value = "courses")]
        catalogue_type: CatalogueKind,
        /// Concurrent job loops
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },

    /// Detect the pagination of a single page
    PreviewPagination {
        url: String,
        #[arg(long, value_enum, default_value = "courses")]
        catalogue_type: CatalogueKind,
    },

    /// Detect the link pattern of a single index page
    PreviewRegexp {
        url: String,
        #[arg(long, value_enum, default_value = "courses")]
        catalogue_type: CatalogueKind,
        #[arg(long, value_enum, default_value = "detail-links")]
        page_type: PageKind,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CatalogueKind {
    Courses,
    LearningPrograms,
    Credentials,
    Competencies,
}

impl From<CatalogueKind> for CatalogueType {
    fn from(kind: CatalogueKind) -> Self {
        match kind {
            CatalogueKind::Courses => CatalogueType::Courses,
            CatalogueKind::LearningPrograms => CatalogueType::LearningPrograms,
            CatalogueKind::Credentials => CatalogueType::Credentials,
            CatalogueKind::Competencies => CatalogueType::Competencies,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PageKind {
    DetailLinks,
    CategoryLinks,
}

impl From<PageKind> for PageType {
    fn from(kind: PageKind) -> Self {
        match kind {
            PageKind::DetailLinks => PageType::DetailLinks,
            PageKind::CategoryLinks => PageType::CategoryLinks,
        }
    }
}

/// Settings loaded from the environment (and `.env`).
struct CliConfig {
    openai_api_key: String,
    openai_model: Option<String>,
    engine: EngineConfig,
}

impl CliConfig {
    fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        Ok(Self {
            openai_api_key: std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?,
            openai_model: std::env::var("OPENAI_MODEL").ok(),
            engine: EngineConfig::from_env().context("invalid CATALOGUE_* setting")?,
        })
    }
}

#[derive(Serialize)]
struct CrawlReport {
    recipe: Recipe,
    extraction: Extraction,
    items: Vec<DataItem>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_service(config: CliConfig) -> Result<CatalogueService> {
    let mut llm = OpenAiLlm::new(config.openai_api_key);
    if let Some(model) = config.openai_model {
        llm = llm.with_model(model);
    }
    let browser = HttpBrowser::new().context("failed to create HTTP browser")?;

    Ok(CatalogueService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryJobQueue::new()),
        Arc::new(browser),
        Arc::new(llm),
        config.engine,
    ))
}

async fn detect(service: &CatalogueService, url: &str, catalogue_type: CatalogueType) -> Result<Recipe> {
    let catalogue = service.create_catalogue(url, url, catalogue_type).await?;
    let recipe = service.create_recipe(catalogue.id, url).await?;
    Ok(service.detect_recipe(recipe.id).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let service = build_service(CliConfig::from_env()?)?;

    match cli.command {
        Commands::Detect { url, catalogue_type } => {
            let recipe = detect(&service, &url, catalogue_type.into()).await?;
            print_json(&recipe)?;
        }

        Commands::Crawl {
            url,
            catalogue_type,
            workers,
        } => {
            let recipe = detect(&service, &url, catalogue_type.into()).await?;
            if recipe.status != RecipeDetectionStatus::Success {
                print_json(&recipe)?;
                anyhow::bail!(
                    "recipe detection failed: {}",
                    recipe.failure_reason.as_deref().unwrap_or("unknown reason")
                );
            }

            let extraction = service.start_extraction(recipe.id).await?;
            let shutdown = CancellationToken::new();
            let ctrl_c = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, stopping workers");
                    ctrl_c.cancel();
                }
            });

            let worker_config = JobWorkerConfig::with_worker_id("catalogue-cli")
                .with_concurrency(workers)
                .with_poll_interval(Duration::from_millis(250));
            service.worker(worker_config).run_until_idle(shutdown).await;

            let report = CrawlReport {
                extraction: service.extraction_stats(extraction.id).await?,
                items: service.extraction_items(extraction.id).await?,
                recipe,
            };
            print_json(&report)?;
        }

        Commands::PreviewPagination { url, catalogue_type } => {
            let pagination = service.preview_pagination(&url, catalogue_type.into()).await?;
            print_json(&pagination)?;
        }

        Commands::PreviewRegexp {
            url,
            catalogue_type,
            page_type,
        } => {
            let preview = service
                .preview_url_regexp(&url, catalogue_type.into(), page_type.into())
                .await?;
            print_json(&preview)?;
        }
    }

    Ok(())
}
