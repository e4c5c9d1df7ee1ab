//! # Temporal Patterns CLI (`tpr`)
//!
//! ```bash
//! tpr --config ./config/tpr.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tpr init` | Create the store file and schema |
//! | `tpr refresh` | Mine history into the store |
//! | `tpr query "<text>"` | Recommend patterns for a task |
//! | `tpr accept <id>... [--feedback F]` | Record that recommendations were used |
//! | `tpr reject <id>...` | Record that recommendations were not useful |
//! | `tpr stats` | Record count, size, and breakdowns |
//! | `tpr completions <shell>` | Print shell completions |
//!
//! Results go to stdout; logs and progress go to stderr. Any failure exits
//! with status 1.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use temporal_patterns::config;
use temporal_patterns::models::Feedback;
use temporal_patterns::progress::ProgressMode;
use temporal_patterns::query::{self, QueryArgs};
use temporal_patterns::refresh;
use temporal_patterns::stats;
use temporal_patterns::store::VectorStore;

const DEFAULT_CONFIG: &str = "./config/tpr.toml";

/// Temporal Patterns: recommend engineering patterns mined from git history.
#[derive(Parser)]
#[command(name = "tpr", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/tpr.toml`; built-in defaults are used when that
    /// file does not exist. An explicit path must exist.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging on stderr (-v info, -vv debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store. Safe to run more than once.
    Init,

    /// Extract patterns from history, embed them, and write them to the store.
    Refresh {
        /// Revisions to scan, newest first (default: refresh.max_revisions).
        #[arg(long)]
        commits: Option<usize>,

        /// Only revisions on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Only revisions on or before this date (YYYY-MM-DD).
        #[arg(long)]
        until: Option<String>,

        /// Only revisions touching a path that matches this glob.
        #[arg(long)]
        path: Option<String>,

        /// Report counts without embedding or writing.
        #[arg(long)]
        dry_run: bool,

        /// Progress on stderr (default: human when stderr is a TTY).
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Recommend stored patterns for a task description.
    Query {
        /// What you are about to build.
        text: String,

        /// Number of recommendations (default: retrieval.top_k).
        #[arg(long, allow_negative_numbers = true)]
        top: Option<i64>,

        /// Only patterns carrying this tag. Repeatable; all must match.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Only patterns touching a path with this prefix.
        #[arg(long)]
        path: Option<String>,

        /// Only patterns touching a path matching this glob.
        #[arg(long)]
        glob: Option<String>,

        /// Only patterns from revisions on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,

        /// Drop candidates below this similarity.
        #[arg(long, allow_negative_numbers = true)]
        min_score: Option<f32>,

        /// Print a JSON array instead of text.
        #[arg(long)]
        json: bool,

        /// Record usage for these surfaced ids. Repeatable.
        #[arg(long)]
        accept: Vec<String>,

        /// Count every printed recommendation as surfaced.
        #[arg(long)]
        track: bool,
    },

    /// Record that recommended patterns were used.
    Accept {
        #[arg(required = true)]
        ids: Vec<String>,

        /// How useful the pattern turned out to be.
        #[arg(long, value_enum, default_value = "positive")]
        feedback: FeedbackArg,
    },

    /// Record that recommended patterns were not useful. Does not change
    /// ranking.
    Reject {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Show record count, database size, and breakdowns.
    Stats,

    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FeedbackArg {
    Positive,
    Neutral,
    Negative,
}

impl From<FeedbackArg> for Feedback {
    fn from(arg: FeedbackArg) -> Self {
        match arg {
            FeedbackArg::Positive => Feedback::Positive,
            FeedbackArg::Neutral => Feedback::Neutral,
            FeedbackArg::Negative => Feedback::Negative,
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("temporal_patterns={level},tpr={level}"))
    });
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "tpr", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => config::load_config(path, true)?,
        None => config::load_config(Path::new(DEFAULT_CONFIG), false)?,
    };

    match cli.command {
        Commands::Init => {
            let store = VectorStore::open(&cfg.db.path).await?;
            store.close().await;
            println!("Store initialized at {}", cfg.db.path.display());
        }
        Commands::Refresh {
            commits,
            since,
            until,
            path,
            dry_run,
            progress,
        } => {
            let mode = progress.map_or_else(ProgressMode::default_for_tty, ProgressMode::from);
            refresh::run_refresh(
                &cfg,
                commits,
                since.as_deref(),
                until.as_deref(),
                path.as_deref(),
                dry_run,
                mode,
            )
            .await?;
        }
        Commands::Query {
            text,
            top,
            tags,
            path,
            glob,
            since,
            min_score,
            json,
            accept,
            track,
        } => {
            query::run_query(
                &cfg,
                QueryArgs {
                    text,
                    top,
                    tags,
                    path,
                    glob,
                    since,
                    min_score,
                    json,
                    accept,
                    track,
                },
            )
            .await?;
        }
        Commands::Accept { ids, feedback } => {
            query::run_accept(&cfg, &ids, feedback.into()).await?;
        }
        Commands::Reject { ids } => {
            query::run_reject(&cfg, &ids).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}
