use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments for podcast-adstrip
#[derive(Parser, Debug)]
#[command(name = "podcast-adstrip")]
#[command(about = "On-demand ad removal for podcast episodes")]
#[command(version)]
struct Args {
    /// Directory holding config.yaml, the database and audio files
    #[arg(short, long, global = true, env = "ADSTRIP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the HTTP server and pipeline worker (default)
    Serve,
    /// Issue or rotate the token for a principal and feed
    IssueToken {
        principal: i64,
        /// Feed id, or `combined` for a read-only token across feeds
        feed: FeedArg,
    },
    /// Revoke a token by its public id
    RevokeToken { token_id: String },
    /// List prompt presets, or activate NAME first
    Presets { name: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FeedArg {
    Feed(i64),
    Combined,
}

impl std::str::FromStr for FeedArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("combined") {
            return Ok(FeedArg::Combined);
        }
        s.parse()
            .map(FeedArg::Feed)
            .map_err(|_| format!("expected a feed id or 'combined', got {:?}", s))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let data_dir = args
        .data_dir
        .unwrap_or_else(podcast_adstrip::config::AppConfig::default_data_dir);

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => podcast_adstrip::run(&data_dir).await,
        Command::IssueToken { principal, feed } => {
            let feed_id = match feed {
                FeedArg::Feed(id) => Some(id),
                FeedArg::Combined => None,
            };
            podcast_adstrip::issue_token_command(&data_dir, principal, feed_id)
        }
        Command::RevokeToken { token_id } => {
            podcast_adstrip::revoke_token_command(&data_dir, &token_id)
        }
        Command::Presets { name } => podcast_adstrip::presets_command(&data_dir, name.as_deref()),
    }
}
