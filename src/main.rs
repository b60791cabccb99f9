use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use repocapsule::builder::{build_engine, PipelineOverrides};
use repocapsule::config::{load_config_from_path, QCMode, RepocapsuleConfig, SinkSpec, SourceSpec};
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "repocapsule")]
#[command(version)]
#[command(about = "Convert repos, archives, web PDFs and tabular exports into JSONL corpora")]
struct Cli {
    /// Run a declarative config file (.json or .toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Quick mode: convert a local directory
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Quick mode: convert a zip archive (local path or URL)
    #[arg(long, value_name = "PATH_OR_URL")]
    zip: Option<String>,

    /// Output directory for quick mode (default: out)
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,

    /// Dataset basename for quick mode (default: name of the input)
    #[arg(long)]
    name: Option<String>,

    /// Repo identifier recorded in metadata, e.g. owner/name
    #[arg(long)]
    repo: Option<String>,

    /// Repo URL recorded in metadata
    #[arg(long)]
    url: Option<String>,

    /// SPDX license id recorded in metadata
    #[arg(long)]
    license: Option<String>,

    /// Target tokens per chunk
    #[arg(long)]
    target_tokens: Option<usize>,

    /// Gzip the primary JSONL output
    #[arg(long)]
    gzip: bool,

    /// Skip the prompt-text side file
    #[arg(long)]
    no_prompt: bool,

    /// Enable inline QC with near-duplicate dropping
    #[arg(long)]
    dedup: bool,

    /// Worker threads (default: available parallelism)
    #[arg(long)]
    workers: Option<usize>,

    /// Abort on the first source or worker error
    #[arg(long)]
    fail_fast: bool,

    /// Print the run summary as JSON to stdout
    #[arg(long)]
    json: bool,
}

fn quick_config(cli: &Cli) -> Result<RepocapsuleConfig> {
    let mut cfg = RepocapsuleConfig::default();

    let (spec, default_name) = if let Some(root) = &cli.root {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        let spec = SourceSpec {
            kind: "local_dir".into(),
            options: serde_json::from_value(json!({"root_dir": root}))?,
        };
        (spec, name)
    } else if let Some(zip) = &cli.zip {
        let is_url = zip.starts_with("http://") || zip.starts_with("https://");
        let options = if is_url {
            json!({"url": zip})
        } else {
            json!({"path": zip})
        };
        let name = zip
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("dataset")
            .trim_end_matches(".zip")
            .to_string();
        let spec = SourceSpec {
            kind: "zip_archive".into(),
            options: serde_json::from_value(options)?,
        };
        (spec, name)
    } else {
        anyhow::bail!("provide --config, --root, or --zip");
    };
    cfg.sources.specs = vec![spec];

    let base = cli.name.clone().unwrap_or(default_name);
    let suffix = if cli.gzip { ".jsonl.gz" } else { ".jsonl" };
    let jsonl_path = cli.out_dir.join(format!("{base}{suffix}"));
    let mut sink_options = json!({"jsonl_path": jsonl_path});
    if cli.no_prompt {
        cfg.sinks.prompt.include_prompt_file = false;
    } else {
        sink_options["prompt_path"] =
            json!(cli.out_dir.join(format!("{base}.prompt.txt")));
    }
    cfg.sinks.specs = vec![SinkSpec {
        kind: "default_jsonl_prompt".into(),
        options: serde_json::from_value(sink_options)?,
    }];

    if cli.repo.is_some() || cli.url.is_some() || cli.license.is_some() {
        cfg.sinks.context = Some(repocapsule::interfaces::RepoContext {
            repo_full_name: cli.repo.clone(),
            repo_url: cli.url.clone(),
            license_id: cli.license.clone(),
            ..Default::default()
        });
    }

    if let Some(target) = cli.target_tokens {
        cfg.chunk.target_tokens = target;
        cfg.chunk.min_tokens = cfg.chunk.min_tokens.min(target);
    }
    if cli.dedup {
        cfg.qc.enabled = true;
        cfg.qc.mode = QCMode::Inline;
        cfg.qc.drop_near_dups = true;
    }
    if let Some(workers) = cli.workers {
        cfg.pipeline.max_workers = workers;
    }
    cfg.pipeline.fail_fast = cli.fail_fast;

    Ok(cfg)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => {
            let mut cfg = load_config_from_path(path)
                .with_context(|| format!("failed to load config {}", path.display()))?;
            if let Some(workers) = cli.workers {
                cfg.pipeline.max_workers = workers;
            }
            if cli.fail_fast {
                cfg.pipeline.fail_fast = true;
            }
            cfg
        }
        None => quick_config(&cli)?,
    };

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    spinner.set_message("converting...");

    let mut engine = build_engine(&cfg, PipelineOverrides::default())?;
    let stats = engine.run()?;
    spinner.finish_with_message(format!(
        "done: {} files, {} records, {} bytes in",
        stats.files, stats.records, stats.bytes_in
    ));

    if cli.json {
        let mut summary = stats.as_value();
        if let Some(qc) = &stats.qc {
            summary["qc"] = qc.as_value();
        }
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if let Some(primary) = engine
        .config()
        .sinks
        .primary_jsonl_name
        .as_ref()
        .or(engine.config().metadata.primary_jsonl.as_ref())
    {
        eprintln!("wrote {}", primary);
    }

    if stats.source_errors > 0 || stats.sink_errors > 0 {
        eprintln!(
            "completed with {} source error(s), {} sink error(s)",
            stats.source_errors, stats.sink_errors
        );
        std::process::exit(2);
    }
    Ok(())
}
