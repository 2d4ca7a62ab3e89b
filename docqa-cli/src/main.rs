//! `docqa`: ingest documents and query them, one user at a time.

mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use docqa_rag::{
    EmbeddingProvider, HashingEmbedder, JsonFileIndexStore, RagConfig, RetrievalPipeline,
};
use serde_json::{Value, json};
use tracing::info;

use crate::cli::{Cli, Command, Provider};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.json_logs {
        docqa_telemetry::init_json("docqa")?;
    } else {
        docqa_telemetry::init_telemetry("docqa")?;
    }

    let config = load_config(cli.config.as_deref()).await?;
    let pipeline = build_pipeline(&cli, config)?;
    let output = run(&pipeline, cli.command).await?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn load_config(path: Option<&Path>) -> Result<RagConfig> {
    let Some(path) = path else {
        return Ok(RagConfig::default());
    };
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: RagConfig = serde_json::from_slice(&raw)
        .with_context(|| format!("invalid config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn build_pipeline(cli: &Cli, config: RagConfig) -> Result<RetrievalPipeline> {
    let provider: Arc<dyn EmbeddingProvider> = match cli.provider {
        Provider::Hashing => Arc::new(HashingEmbedder::new(cli.dimensions)),
        #[cfg(feature = "openai")]
        Provider::Openai => Arc::new(
            docqa_rag::openai::OpenAIEmbeddingProvider::from_env()?
                .with_dimensions(cli.dimensions),
        ),
    };

    let pipeline = RetrievalPipeline::builder()
        .config(config)
        .embedding_provider(provider)
        .index_store(Arc::new(JsonFileIndexStore::new(&cli.data_dir)))
        .build()?;
    Ok(pipeline)
}

async fn run(pipeline: &RetrievalPipeline, command: Command) -> Result<Value> {
    let output = match command {
        Command::Ingest { user, file, title } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let title = title.or_else(|| {
                file.file_name().map(|name| name.to_string_lossy().into_owned())
            });
            let report = pipeline.ingest_bytes(&user, title.as_deref(), &bytes).await?;
            info!(user_id = %user, file = %file.display(), chunks = report.chunks_stored, "file ingested");
            serde_json::to_value(report)?
        }
        Command::Query { user, question, k, min_similarity, max_context, document } => {
            let config = pipeline.config();
            let k = k.unwrap_or(config.top_k);
            let min_similarity = min_similarity.unwrap_or(config.similarity_threshold);
            let max_context = max_context.unwrap_or(config.max_context_length);

            let results = match &document {
                Some(document_id) => {
                    pipeline
                        .retrieve_in_document(&user, document_id, &question, k, min_similarity)
                        .await?
                }
                None => pipeline.retrieve(&user, &question, k, min_similarity).await?,
            };
            let context = pipeline.assemble_context(&results, max_context);
            json!({ "results": results, "context": context })
        }
        Command::Documents { user } => serde_json::to_value(pipeline.documents(&user).await?)?,
        Command::Stats { user } => serde_json::to_value(pipeline.stats(&user).await?)?,
        Command::DeleteDocument { user, document_id } => {
            let removed = pipeline.delete_document(&user, &document_id).await?;
            json!({ "document_id": document_id, "chunks_removed": removed })
        }
        Command::Clear { user } => {
            pipeline.clear(&user).await?;
            json!({ "user_id": user, "cleared": true })
        }
        Command::Reindex { user } => {
            let count = pipeline.reindex(&user).await?;
            json!({ "user_id": user, "chunks_reindexed": count })
        }
    };
    Ok(output)
}
