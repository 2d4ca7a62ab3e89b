use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use docqa_rag::UserId;

/// Per-user document retrieval from the command line.
///
/// Every command acts on the documents of exactly one user. Results are
/// printed as JSON on stdout; logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "docqa", version, about)]
pub struct Cli {
    /// Directory holding one index file per user.
    #[arg(long, global = true, default_value = "docqa-data")]
    pub data_dir: PathBuf,

    /// JSON file with pipeline settings; missing fields use defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Embedding backend.
    #[arg(long, global = true, value_enum, default_value_t = Provider::Hashing)]
    pub provider: Provider,

    /// Embedding dimension.
    #[arg(long, global = true, default_value_t = 256)]
    pub dimensions: usize,

    /// Log as JSON instead of human-readable lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Provider {
    /// Offline feature hashing.
    Hashing,
    /// OpenAI embeddings API (reads OPENAI_API_KEY).
    #[cfg(feature = "openai")]
    Openai,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract, chunk and index a text file.
    Ingest {
        #[arg(long, value_parser = parse_user)]
        user: UserId,
        file: PathBuf,
        /// Display name; defaults to the file name.
        #[arg(long)]
        title: Option<String>,
    },
    /// Retrieve the chunks most relevant to a question.
    Query {
        #[arg(long, value_parser = parse_user)]
        user: UserId,
        question: String,
        /// Number of chunks to return.
        #[arg(short)]
        k: Option<usize>,
        /// Drop chunks scoring below this cosine similarity.
        #[arg(long, allow_negative_numbers = true)]
        min_similarity: Option<f32>,
        /// Character budget for the assembled context.
        #[arg(long)]
        max_context: Option<usize>,
        /// Only search this document.
        #[arg(long)]
        document: Option<String>,
    },
    /// List the user's documents.
    Documents {
        #[arg(long, value_parser = parse_user)]
        user: UserId,
    },
    /// Show chunk and document counts.
    Stats {
        #[arg(long, value_parser = parse_user)]
        user: UserId,
    },
    /// Remove one document.
    DeleteDocument {
        #[arg(long, value_parser = parse_user)]
        user: UserId,
        document_id: String,
    },
    /// Remove every document of the user.
    Clear {
        #[arg(long, value_parser = parse_user)]
        user: UserId,
    },
    /// Re-embed the user's chunks with the current provider.
    Reindex {
        #[arg(long, value_parser = parse_user)]
        user: UserId,
    },
}

fn parse_user(raw: &str) -> Result<UserId, String> {
    UserId::new(raw).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_query_with_overrides() {
        let cli = Cli::try_parse_from([
            "docqa",
            "--data-dir",
            "/tmp/x",
            "query",
            "--user",
            "alice",
            "what is rust",
            "-k",
            "2",
            "--min-similarity",
            "-0.5",
        ])
        .unwrap();

        assert_eq!(cli.data_dir, PathBuf::from("/tmp/x"));
        match cli.command {
            Command::Query { user, question, k, min_similarity, .. } => {
                assert_eq!(user.as_str(), "alice");
                assert_eq!(question, "what is rust");
                assert_eq!(k, Some(2));
                assert_eq!(min_similarity, Some(-0.5));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn blank_user_is_rejected() {
        assert!(Cli::try_parse_from(["docqa", "stats", "--user", "  "]).is_err());
    }
}
