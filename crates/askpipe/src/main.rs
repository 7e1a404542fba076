use anyhow::{Context, Result};
use askpipe::pipeline::events::{ChannelSink, FanoutSink, TracingSink};
use askpipe::{Pipeline, PipelineConfig, RunRequest};
use askpipe_core::{ConversationStore, EventSink, LlmClient, Mode, SearchProvider, StageEvent};
use askpipe_local::{
    llm_from_env, provider_from_env, CachedSearch, FsConversationStore, LocalFetcher, PageCache,
    RetryingSearch,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "askpipe")]
#[command(about = "Conversational web research: plan, search, distill, answer with citations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer one query (json by default).
    Ask(AskCmd),
    /// Interactive session. Commands: exit, list, new, continue <id>.
    Chat(ChatCmd),
    /// List stored conversations, newest first.
    Conversations(ConversationsCmd),
    /// Show the status record of a conversation's last run.
    Status(StatusCmd),
    /// Diagnose configuration (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug, Clone)]
struct StackArgs {
    /// Search provider: auto|brave|searxng
    #[arg(long, env = "ASKPIPE_SEARCH_PROVIDER")]
    search_provider: Option<String>,
    /// Model backend: auto|openai_compat|ollama
    #[arg(long, env = "ASKPIPE_LLM_BACKEND")]
    llm_backend: Option<String>,
    /// Model name override for the selected backend.
    #[arg(long)]
    model: Option<String>,
    /// Conversation store directory.
    #[arg(long, env = "ASKPIPE_STORE_DIR")]
    store_dir: Option<PathBuf>,
    /// Page cache directory.
    #[arg(long, env = "ASKPIPE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
    /// Override retrieval concurrency (1-5).
    #[arg(long)]
    concurrency: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct AskCmd {
    query: String,
    /// fast|thorough
    #[arg(long, default_value = "fast")]
    mode: Mode,
    /// Continue an existing conversation; a new id is generated otherwise.
    #[arg(long)]
    conversation_id: Option<String>,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    #[command(flatten)]
    stack: StackArgs,
}

#[derive(clap::Args, Debug)]
struct ChatCmd {
    /// fast|thorough
    #[arg(long, default_value = "fast")]
    mode: Mode,
    #[arg(long)]
    conversation_id: Option<String>,
    #[command(flatten)]
    stack: StackArgs,
}

#[derive(clap::Args, Debug)]
struct ConversationsCmd {
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long, env = "ASKPIPE_STORE_DIR")]
    store_dir: Option<PathBuf>,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct StatusCmd {
    conversation_id: String,
    #[arg(long, env = "ASKPIPE_STORE_DIR")]
    store_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Opt-in `KEY=VALUE` file. Never overrides the process environment.
fn load_env_file() {
    let Ok(p) = std::env::var("ASKPIPE_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v.trim());
        }
    }
}

fn init_tracing() {
    let directive = ["ASKPIPE_LOG", "RUST_LOG"]
        .iter()
        .find_map(|k| std::env::var(k).ok().filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn has_env(k: &str) -> bool {
    std::env::var(k).ok().is_some_and(|v| !v.trim().is_empty())
}

fn store_dir(arg: Option<PathBuf>) -> PathBuf {
    arg.unwrap_or_else(FsConversationStore::default_dir)
}

fn cache_dir(arg: Option<PathBuf>) -> PathBuf {
    arg.unwrap_or_else(LocalFetcher::default_cache_dir)
}

fn new_conversation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn build_pipeline(stack: &StackArgs, events: Arc<dyn EventSink>) -> Result<Pipeline> {
    let mut cfg = PipelineConfig::from_env()?;
    if let Some(c) = stack.concurrency {
        cfg.concurrency = c;
    }
    let client = askpipe_local::http_client()?;

    let provider = provider_from_env(client.clone(), stack.search_provider.as_deref())
        .context("search provider (run `askpipe doctor`)")?;
    let retrying: Arc<dyn SearchProvider> = Arc::new(RetryingSearch::new(
        provider,
        cfg.search_retries,
        Duration::from_millis(cfg.search_backoff_ms),
    ));
    let search = Arc::new(CachedSearch::new(
        retrying,
        Duration::from_secs(cfg.search_cache_ttl_s),
    ));

    let ttl_s = std::env::var("ASKPIPE_PAGE_CACHE_TTL_S")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok());
    let cache = PageCache::new(cache_dir(stack.cache_dir.clone()), ttl_s);
    let fetcher = Arc::new(LocalFetcher::new(Some(cache))?);

    let llm = llm_from_env(
        client,
        stack.llm_backend.as_deref(),
        stack.model.clone(),
        cfg.llm_timeout_ms,
    )
    .context("model backend (run `askpipe doctor`)")?;

    let store = Arc::new(FsConversationStore::new(store_dir(stack.store_dir.clone())));
    tracing::info!(
        search = search.name(),
        llm = llm.name(),
        store = %store.root().display(),
        "pipeline ready"
    );
    Ok(Pipeline::new(search, fetcher, llm, store, cfg).with_events(events))
}

/// Stage events to the log and, for interactive use, a one-line progress ticker on stderr.
fn progress_events(ticker: bool) -> Arc<dyn EventSink> {
    if !ticker {
        return Arc::new(TracingSink);
    }
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<StageEvent>();
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            eprintln!("[{}]", ev.kind.as_str());
        }
    });
    Arc::new(FanoutSink(vec![
        Box::new(TracingSink),
        Box::new(ChannelSink::new(tx)),
    ]))
}

fn print_summaries(list: &[askpipe_core::ConversationSummary]) {
    if list.is_empty() {
        println!("no conversations");
    }
    for c in list {
        println!(
            "{}  {}  ({} turns)  {}",
            c.conversation_id,
            c.title.as_deref().unwrap_or("(untitled)"),
            c.turn_count,
            c.last_message_preview
        );
    }
}

async fn run_chat(args: ChatCmd) -> Result<()> {
    let pipeline = build_pipeline(&args.stack, progress_events(true))?;
    let mut conversation_id = args.conversation_id.unwrap_or_else(new_conversation_id);
    let mut stdout = tokio::io::stdout();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    println!("conversation {conversation_id} ({} mode). Type `exit` to quit.", args.mode);
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            "new" => {
                conversation_id = new_conversation_id();
                println!("conversation {conversation_id}");
                continue;
            }
            "list" => {
                print_summaries(&pipeline.store().list(20).await?);
                continue;
            }
            _ => {}
        }
        if let Some(id) = line.strip_prefix("continue ") {
            let id = id.trim();
            let turns = pipeline.store().load(id).await?;
            if turns.is_empty() {
                println!("no conversation {id}");
            } else {
                conversation_id = id.to_string();
                println!("continuing {conversation_id} ({} turns)", turns.len());
            }
            continue;
        }
        match pipeline
            .run(RunRequest::new(conversation_id.clone(), line, args.mode))
            .await
        {
            Ok(out) => println!("\n{}\n", out.answer.text),
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}

fn dir_writable(dir: &Path) -> bool {
    (|| -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let probe = dir.join(format!("askpipe-doctor-{}.probe", std::process::id()));
        std::fs::write(&probe, b"ok")?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    })()
    .is_ok()
}

fn doctor(args: DoctorCmd) -> Result<()> {
    let t0 = std::time::Instant::now();
    let brave = has_env("ASKPIPE_BRAVE_API_KEY") || has_env("BRAVE_SEARCH_API_KEY");
    let searxng = askpipe_local::search::searxng_endpoint_from_env().is_some();
    let openai_compat = has_env("ASKPIPE_OPENAI_BASE_URL")
        || has_env("OPENAI_BASE_URL")
        || has_env("ASKPIPE_OPENAI_API_KEY")
        || has_env("OPENAI_API_KEY");
    let ollama = has_env("ASKPIPE_OLLAMA_ENABLE");
    let cache = cache_dir(
        std::env::var("ASKPIPE_CACHE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
    );
    let store = store_dir(
        std::env::var("ASKPIPE_STORE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
    );

    let mut checks: Vec<serde_json::Value> = Vec::new();
    for (name, dir, var) in [
        ("cache_dir_writable", &cache, "ASKPIPE_CACHE_DIR"),
        ("store_dir_writable", &store, "ASKPIPE_STORE_DIR"),
    ] {
        let ok = dir_writable(dir);
        checks.push(serde_json::json!({
            "name": name,
            "ok": ok,
            "message": if ok { format!("{} is writable", dir.display()) } else { format!("{} is not writable", dir.display()) },
            "hint": if ok { String::new() } else { format!("Set {var} to a writable directory.") },
        }));
    }
    let config_ok = PipelineConfig::from_env();
    checks.push(serde_json::json!({
        "name": "pipeline_config",
        "ok": config_ok.is_ok(),
        "message": match &config_ok { Ok(_) => "ASKPIPE_* settings parse".to_string(), Err(e) => e.to_string() },
        "hint": "",
    }));

    let ok = checks.iter().all(|c| c["ok"].as_bool().unwrap_or(false));
    let payload = serde_json::json!({
        "schema_version": 1,
        "kind": "doctor",
        "ok": ok,
        "name": "askpipe",
        "version": env!("CARGO_PKG_VERSION"),
        "elapsed_ms": t0.elapsed().as_millis(),
        "configured": {
            "search": { "brave": brave, "searxng": searxng },
            "llm": { "openai_compat": openai_compat, "ollama": ollama },
            "cache_dir": cache.to_string_lossy(),
            "store_dir": store.to_string_lossy(),
        },
        "checks": checks,
    });
    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("askpipe {} (ok={})", env!("CARGO_PKG_VERSION"), ok);
            println!("search: brave={brave} searxng={searxng}");
            println!("llm: openai_compat={openai_compat} ollama={ollama}");
            println!("checks:");
            for c in &checks {
                let name = c["name"].as_str().unwrap_or("?");
                let ok = c["ok"].as_bool().unwrap_or(false);
                println!("- {}: {}", name, if ok { "ok" } else { "fail" });
            }
        }
        _ => println!("{payload}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Ask(args) => {
            let pipeline = build_pipeline(&args.stack, progress_events(false))?;
            let conversation_id = args.conversation_id.unwrap_or_else(new_conversation_id);
            let out = pipeline
                .run(RunRequest::new(conversation_id, args.query, args.mode))
                .await?;
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("{}", out.answer.text),
                _ => println!(
                    "{}",
                    serde_json::json!({
                        "schema_version": 1,
                        "kind": "answer",
                        "ok": true,
                        "conversation_id": out.conversation_id,
                        "title": out.title,
                        "answer": out.answer.text,
                        "cited_urls": out.answer.cited_urls,
                        "context_only": out.answer.context_only,
                        "iterations": out.iterations,
                        "metadata": out.metadata,
                    })
                ),
            }
        }
        Commands::Chat(args) => run_chat(args).await?,
        Commands::Conversations(args) => {
            let store = FsConversationStore::new(store_dir(args.store_dir));
            let list = store.list(args.limit).await?;
            match args.output.to_ascii_lowercase().as_str() {
                "text" => print_summaries(&list),
                _ => println!("{}", serde_json::to_string(&list)?),
            }
        }
        Commands::Status(args) => {
            let store = FsConversationStore::new(store_dir(args.store_dir));
            let status = store.status(&args.conversation_id).await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        Commands::Doctor(args) => doctor(args)?,
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "askpipe",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("askpipe {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }
    Ok(())
}
