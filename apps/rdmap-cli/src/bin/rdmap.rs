use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use rdmap_cli::{build_service, router, telemetry};
use rdmap_core::config::{Config, Settings};
use rdmap_core::corpus;
use rdmap_core::types::SearchRequest;
use rdmap_vector::{BuildOptions, IndexBuilder};

#[derive(Parser)]
#[command(name = "rdmap", version, about = "Semantic search over the R&D project map")]
struct Cli {
    /// Directory containing config.toml (defaults to the working directory)
    #[arg(long, global = true, env = "RDMAP_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Artifacts directory override
    #[arg(long, global = true)]
    artifacts: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract project records from per-center JSON files
    Prepare {
        #[arg(long)]
        centers_dir: Option<PathBuf>,
        #[arg(long)]
        metadata: Option<PathBuf>,
        #[arg(long)]
        search_text: Option<PathBuf>,
    },
    /// Embed the prepared corpus and publish a new snapshot
    Build {
        #[arg(long)]
        metadata: Option<PathBuf>,
        #[arg(long)]
        search_text: Option<PathBuf>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        no_progress: bool,
    },
    /// Run one search against the current snapshot
    Query {
        query: String,
        /// Results to return (default: search.default_top_k_results)
        #[arg(long)]
        limit: Option<usize>,
        /// Candidates to retrieve (default: search.default_top_k_candidates)
        #[arg(long)]
        candidates: Option<usize>,
        #[arg(long)]
        no_rewrite: bool,
        #[arg(long)]
        no_rerank: bool,
        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },
    /// Serve the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let config = match &cli.config_dir {
        Some(dir) => Config::load_from(dir),
        None => Config::load(),
    }
    .context("loading configuration")?;
    let mut settings = config.settings().context("invalid configuration")?;
    if let Some(dir) = &cli.artifacts {
        settings.data.artifacts_dir = dir.clone();
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    telemetry::init_logging("info");
    let cli = Cli::parse();
    let mut settings = load_settings(&cli)?;

    match cli.command {
        Command::Prepare { centers_dir, metadata, search_text } => {
            let centers = centers_dir.unwrap_or(settings.data.centers_dir);
            let metadata = metadata.unwrap_or(settings.data.metadata_path);
            let search_text = search_text.unwrap_or(settings.data.search_text_path);
            println!("📂 Centers: {}", centers.display());
            let entries = corpus::prepare_corpus(&centers)
                .with_context(|| format!("reading centers from {}", centers.display()))?;
            corpus::write_corpus(&entries, &metadata, &search_text).context("writing corpus")?;
            println!("✅ Prepared {} projects", entries.len());
            println!("   metadata:    {}", metadata.display());
            println!("   search text: {}", search_text.display());
        }
        Command::Build { metadata, search_text, batch_size, no_progress } => {
            if let Some(n) = batch_size {
                settings.build.batch_size = n;
            }
            let metadata = metadata.unwrap_or_else(|| settings.data.metadata_path.clone());
            let search_text = search_text.unwrap_or_else(|| settings.data.search_text_path.clone());
            let embedder = rdmap_embed::build_embedder(&settings.embedding).context("configuring embedder")?;
            let options = BuildOptions { show_progress: !no_progress, ..BuildOptions::from(&settings.build) };
            let builder = IndexBuilder::new(embedder, options);
            let report = builder
                .build_from_files(&metadata, &search_text, &settings.data.artifacts_dir)
                .await
                .context("building index")?;
            println!("✅ Snapshot {} published", report.snapshot_id);
            println!("📊 {} rows x {} dims in {:.1}s", report.rows, report.dim, report.elapsed.as_secs_f64());
            if !report.pruned.is_empty() {
                println!("🧹 Removed {} old snapshots", report.pruned.len());
            }
            if !report.placeholder_ids.is_empty() {
                println!(
                    "⚠️  {} rows have zero-vector placeholders ({} batches failed)",
                    report.placeholder_ids.len(),
                    report.batches_failed
                );
            }
        }
        Command::Query { query, limit, candidates, no_rewrite, no_rerank, json } => {
            let service = build_service(&settings)?;
            let req = SearchRequest::new(query)
                .with_top_k(
                    candidates.unwrap_or(settings.search.default_top_k_candidates),
                    limit.unwrap_or(settings.search.default_top_k_results),
                )
                .with_rewrite(!no_rewrite)
                .with_rerank(!no_rerank);
            let resp = service.search(&req).await.context("search failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&resp)?);
                return Ok(());
            }
            println!("🔍 {}", resp.query_original);
            if let Some(r) = &resp.rewritten_query {
                println!("   rewritten: {r}");
            }
            for (i, r) in resp.results.iter().enumerate() {
                println!("\n  {}. score={:.4}  {}  [{}]", i + 1, r.score, r.project_id, r.year);
                println!("     {}", r.title);
                println!("     🏛  {}", r.center_name);
                if let Some(why) = &r.why_matched {
                    println!("     💡 {why}");
                }
            }
            let total = resp.timings_ms.get("total").copied().unwrap_or_default();
            println!("\n{} results in {total:.1} ms", resp.results.len());
        }
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| settings.server.host.clone());
            let port = port.unwrap_or(settings.server.port);
            let service = build_service(&settings)?;
            let app = router(Arc::clone(&service));
            let listener = tokio::net::TcpListener::bind((host.as_str(), port))
                .await
                .with_context(|| format!("binding {host}:{port}"))?;
            info!(address = %listener.local_addr()?, ready = service.health().state.ready, "listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("server error")?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}
