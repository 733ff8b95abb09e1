//!
//! spacefs CLI binary
//! ------------------
//! Manual access to a local spacefs root: create spaces, make directories, upload
//! files and inspect nodes and pending upload sessions. Output is JSON.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use spacefs::config::Options;
use spacefs::events::{LogPublisher, Publisher};
use spacefs::fs::{CreateSpace, Filesystem};
use spacefs::identity::{RequestContext, User};
use spacefs::lookup::Reference;
use spacefs::node::InfoRequest;

fn print_usage(program: &str) {
    eprintln!(
        "Usage:\n  {program} [--root <path>] [--config <file.json>] [--user <id>] <command> [args]\n\nCommands:\n  create-space <personal|project> <name> [--quota <bytes>]\n  mkdir <space> <path>\n  upload <space> <path> <local file> [--mtime <unix secs>] [--checksum \"<algo> <hex>\"]\n  ls <space> [path]\n  stat <space> [path]\n  uploads [--clean-expired]\n\nEnvironment:\n  SPACEFS_ROOT, SPACEFS_ASYNC_POSTPROCESSING, SPACEFS_DISABLE_VERSIONING, SPACEFS_LOCK_TIMEOUT_MS, SPACEFS_MAX_CONCURRENCY\n  RUST_LOG controls log verbosity (default: info)"
    );
}

struct Args {
    root: Option<PathBuf>,
    config: Option<PathBuf>,
    user: String,
    command: Vec<String>,
    flags: BTreeMap<String, String>,
    switches: Vec<String>,
}

fn parse_args(raw: &[String]) -> Result<Args> {
    let mut args = Args {
        root: None,
        config: None,
        user: env::var("USER").unwrap_or_else(|_| "local".to_string()),
        command: Vec::new(),
        flags: BTreeMap::new(),
        switches: Vec::new(),
    };
    let mut it = raw.iter();
    while let Some(a) = it.next() {
        match a.as_str() {
            "--root" => args.root = Some(PathBuf::from(it.next().ok_or_else(|| anyhow!("--root needs a value"))?)),
            "--config" => args.config = Some(PathBuf::from(it.next().ok_or_else(|| anyhow!("--config needs a value"))?)),
            "--user" => args.user = it.next().ok_or_else(|| anyhow!("--user needs a value"))?.clone(),
            "--clean-expired" => args.switches.push(a.clone()),
            flag if flag.starts_with("--") => {
                let v = it.next().ok_or_else(|| anyhow!("{} needs a value", flag))?;
                args.flags.insert(flag.trim_start_matches("--").to_string(), v.clone());
            }
            _ => args.command.push(a.clone()),
        }
    }
    Ok(args)
}

fn load_options(args: &Args) -> Result<Options> {
    let mut opts = Options::default();
    if let Some(cfg) = &args.config {
        opts = opts.with_json_file(cfg).with_context(|| format!("reading {}", cfg.display()))?;
    }
    let mut opts = opts.with_env_overrides()?;
    if let Some(root) = &args.root {
        opts.root = root.clone();
    }
    Ok(opts)
}

fn arg<'a>(cmd: &'a [String], i: usize, what: &str) -> Result<&'a str> {
    cmd.get(i).map(String::as_str).ok_or_else(|| anyhow!("missing {}", what))
}

fn reference(space: &str, path: Option<&str>) -> Reference {
    match path.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => Reference::by_path(space, p),
        None => Reference::space_root(space),
    }
}

fn run(fs: &Filesystem, ctx: &RequestContext, args: &Args) -> Result<serde_json::Value> {
    let cmd = &args.command;
    let out = match arg(cmd, 0, "command")? {
        "create-space" => {
            let quota = match args.flags.get("quota") {
                Some(q) => Some(q.parse::<i64>().with_context(|| format!("invalid quota {}", q))?),
                None => None,
            };
            let req = CreateSpace {
                space_type: arg(cmd, 1, "space type")?.to_string(),
                name: arg(cmd, 2, "space name")?.to_string(),
                quota,
                ..Default::default()
            };
            serde_json::to_value(fs.create_space(ctx, &req)?)?
        }
        "mkdir" => {
            let r = reference(arg(cmd, 1, "space")?, Some(arg(cmd, 2, "path")?));
            serde_json::to_value(fs.create_dir(ctx, &r)?)?
        }
        "upload" => {
            let r = reference(arg(cmd, 1, "space")?, Some(arg(cmd, 2, "path")?));
            let local = PathBuf::from(arg(cmd, 3, "local file")?);
            let file = std::fs::File::open(&local).with_context(|| format!("opening {}", local.display()))?;
            let size = file.metadata()?.len();
            let mut md = BTreeMap::new();
            for key in ["mtime", "checksum"] {
                if let Some(v) = args.flags.get(key) {
                    md.insert(key.to_string(), v.clone());
                }
            }
            serde_json::to_value(fs.upload(ctx, &r, size, file, &md)?)?
        }
        "ls" => {
            let r = reference(arg(cmd, 1, "space")?, cmd.get(2).map(String::as_str));
            serde_json::to_value(fs.list_folder(ctx, &r, &InfoRequest::all())?)?
        }
        "stat" => {
            let r = reference(arg(cmd, 1, "space")?, cmd.get(2).map(String::as_str));
            let req = InfoRequest { full_path: true, ..InfoRequest::all() };
            serde_json::to_value(fs.get_md(ctx, &r, &req)?)?
        }
        "uploads" => {
            if args.switches.iter().any(|s| s == "--clean-expired") {
                let removed = fs.uploads().clean_expired(&chrono::Utc::now())?;
                serde_json::json!({ "removed": removed })
            } else {
                let infos: Vec<_> = fs.uploads().list()?.iter().map(|s| s.info().clone()).collect();
                serde_json::to_value(infos)?
            }
        }
        other => bail!("unknown command {}", other),
    };
    Ok(out)
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let raw: Vec<String> = env::args().collect();
    let program = raw.first().cloned().unwrap_or_else(|| "spacefs".to_string());
    if raw.len() < 2 || raw.iter().any(|a| a == "-h" || a == "--help") {
        print_usage(&program);
        return Ok(());
    }
    let args = parse_args(&raw[1..])?;
    let opts = load_options(&args)?;
    info!(target: "spacefs", "spacefs starting: root='{}', async_postprocessing={}", opts.root.display(), opts.async_postprocessing);

    // storage calls block; they run on the blocking pool, sized by max_concurrency
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(opts.max_concurrency.max(1))
        .build()
        .context("tokio runtime")?;
    let task = rt.spawn_blocking(move || -> Result<serde_json::Value> {
        let publisher: Arc<dyn Publisher> = Arc::new(LogPublisher);
        let fs = Filesystem::new(opts, Some(publisher))?;
        let ctx = RequestContext::for_user(User::local(&args.user, &args.user));
        run(&fs, &ctx, &args)
    });
    let out = rt.block_on(task)??;
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
