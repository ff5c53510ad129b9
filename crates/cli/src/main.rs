use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use starshelf_api::{hydrate, GitHubApi, HttpGitHubApi, HttpSavedRepoApi, SavedRepoApi};
use starshelf_core::{sorted, RepoId, SavedRepo, SearchResult, SortOrder};
use starshelf_store::{SavedRepoStore, Typeahead};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "starshelfctl", version, about = "Search GitHub and manage saved repositories")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Base URL of the saved-repo collection service
    #[arg(long, env = "STARSHELF_REPO_API", global = true, default_value = "http://localhost:8080")]
    repo_api: String,

    /// Base URL of the GitHub REST API
    #[arg(long, env = "STARSHELF_GITHUB_API", global = true, default_value = HttpGitHubApi::DEFAULT_BASE)]
    github_api: String,

    /// Quiet period before a search fires
    #[arg(long, env = "STARSHELF_DEBOUNCE_MS", global = true, default_value_t = 1000)]
    debounce_ms: u64,

    /// Queries shorter than this are not sent
    #[arg(long, env = "STARSHELF_MIN_SEARCH_LEN", global = true, default_value_t = Typeahead::DEFAULT_MIN_LEN)]
    min_search_len: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Sort { Asc, Desc }

impl From<Sort> for SortOrder {
    fn from(s: Sort) -> Self {
        match s {
            Sort::Asc => SortOrder::Ascending,
            Sort::Desc => SortOrder::Descending,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search GitHub repositories
    Search {
        query: String,
    },
    /// Feed stdin lines through the debounced search, as if typed
    Typeahead {
        /// Delay between lines, to mimic typing speed
        #[arg(long = "pace-ms", default_value_t = 0)]
        pace_ms: u64,
    },
    /// List saved repositories
    Saved {
        /// Order by star count
        #[arg(long, value_enum, default_value_t = Sort::Asc)]
        sort: Sort,
    },
    /// Save a GitHub repository by numeric id
    Save {
        id: u64,
    },
    /// Remove a saved repository
    Rm {
        id: String,
    },
    /// Show repository details
    Detail {
        id: String,
    },
}

fn init_tracing() {
    let env = std::env::var("STARSHELF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STARSHELF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STARSHELF_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_hits(output: Output, hits: &[SearchResult]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<10} {:<40} {:>8} {}", "ID", "NAME", "STARS", "LANGUAGE");
            for h in hits {
                println!("{:<10} {:<40} {:>8} {}", h.id, h.full_name, h.stargazers_count, h.language.as_deref().unwrap_or("-"));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(hits)?),
    }
    Ok(())
}

fn print_saved(output: Output, repos: &[SavedRepo]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<10} {:<40} {:>8} {:<12} {}", "ID", "NAME", "STARS", "LANGUAGE", "CREATED");
            for r in repos {
                println!(
                    "{:<10} {:<40} {:>8} {:<12} {}",
                    r.id,
                    r.full_name,
                    r.star_count,
                    r.language.as_deref().unwrap_or("-"),
                    r.created_at.format("%Y-%m-%d")
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(repos)?),
    }
    Ok(())
}

fn print_detail(output: Output, r: &SearchResult) -> Result<()> {
    match output {
        Output::Human => {
            println!("{}", r.full_name);
            println!("Language: {}    Stars: {}", r.language.as_deref().unwrap_or("-"), r.stargazers_count);
            if let Some(d) = r.description.as_deref() {
                println!("{}", d);
            }
            println!("{}", r.html_url);
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(r)?),
    }
    Ok(())
}

async fn open_store(cli: &Cli) -> Result<SavedRepoStore> {
    let api: Arc<dyn SavedRepoApi> = Arc::new(HttpSavedRepoApi::new(cli.repo_api.as_str()).context("building collection client")?);
    SavedRepoStore::init(api).await.context("loading saved repos")
}

fn github(cli: &Cli) -> Result<Arc<dyn GitHubApi>> {
    Ok(Arc::new(HttpGitHubApi::new(cli.github_api.as_str()).context("building GitHub client")?))
}

/// Feed stdin into the typeahead; print each distinct settled result set.
async fn run_typeahead(ta: &Typeahead, output: Output, pace: Duration) -> Result<()> {
    use futures::stream::{FuturesOrdered, StreamExt};

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut inflight = FuturesOrdered::new();
    let mut last: Option<Vec<SearchResult>> = None;
    let mut eof = false;
    loop {
        if eof && inflight.is_empty() {
            break;
        }
        tokio::select! {
            line = lines.next_line(), if !eof => {
                match line.context("reading stdin")? {
                    Some(text) => {
                        inflight.push_back(ta.query(&text));
                        if !pace.is_zero() {
                            tokio::time::sleep(pace).await;
                        }
                    }
                    None => eof = true,
                }
            }
            Some(hits) = inflight.next(), if !inflight.is_empty() => {
                if last.as_ref() != Some(&hits) {
                    print_hits(output, &hits)?;
                    last = Some(hits);
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping typeahead");
                break;
            }
            else => break,
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Search { query } => {
            info!(query = %query, "search invoked");
            let ta = Typeahead::new(github(&cli)?, Duration::ZERO, cli.min_search_len);
            match ta.try_query(query).await {
                Ok(hits) => print_hits(cli.output, &hits)?,
                Err(e) => eprintln!("search error: {}", e),
            }
        }
        Commands::Typeahead { pace_ms } => {
            let ta = Typeahead::new(github(&cli)?, Duration::from_millis(cli.debounce_ms), cli.min_search_len);
            run_typeahead(&ta, cli.output, Duration::from_millis(*pace_ms)).await?;
        }
        Commands::Saved { sort } => {
            let store = open_store(&cli).await?;
            let snap = store.snapshot();
            print_saved(cli.output, &sorted(&snap.saved_repos, (*sort).into()))?;
        }
        Commands::Save { id } => {
            let gh = github(&cli)?;
            let store = open_store(&cli).await?;
            match hydrate(gh.as_ref(), &RepoId::from(*id), None).await {
                Ok(result) => {
                    if let Err(e) = store.save_repo(&result).await {
                        eprintln!("save error: {}", e);
                    }
                }
                Err(e) => eprintln!("lookup error: {}", e),
            }
            print_saved(cli.output, &store.snapshot().saved_repos)?;
        }
        Commands::Rm { id } => {
            let store = open_store(&cli).await?;
            let id = RepoId::new(id.as_str());
            let found = store.snapshot().saved_repos.iter().find(|r| r.id == id).cloned();
            match found {
                Some(repo) => {
                    if let Err(e) = store.delete_repo(&repo).await {
                        eprintln!("delete error: {}", e);
                    }
                }
                None => eprintln!("repository {} is not saved", id),
            }
            print_saved(cli.output, &store.snapshot().saved_repos)?;
        }
        Commands::Detail { id } => {
            match hydrate(github(&cli)?.as_ref(), &RepoId::new(id.as_str()), None).await {
                Ok(r) => print_detail(cli.output, &r)?,
                Err(e) => eprintln!("detail error: {}", e),
            }
        }
    }
    Ok(())
}
