//! Pariksha CLI - Multi-aspect Record Validation
//!
//! This is a demonstration CLI for the Pariksha library.

use anyhow::{bail, Context, Result};
use pariksha::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        return;
    }

    let outcome = match args[1].as_str() {
        "validate" => validate_file(&args[2..]),
        "batch" => validate_directory(&args[2..]),
        "help" | "--help" | "-h" => {
            print_usage(&args[0]);
            Ok(true)
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage(&args[0]);
            Ok(false)
        }
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            std::process::exit(2);
        }
    }
}

fn print_usage(program: &str) {
    println!("Pariksha v{} - multi-aspect record validation", pariksha::VERSION);
    println!();
    println!("Usage: {} <command> [options]", program);
    println!();
    println!("Commands:");
    println!("  validate <file.json>   Validate one record");
    println!("  batch <dir>            Validate every .json record under a directory");
    println!("  help                   Show this help message");
    println!();
    println!("Options:");
    println!("  --settings <file>      Settings file (.toml or .json)");
    println!("  --timeout-ms <n>       Per-record timeout for batch runs");
    println!("  --json                 Print results as JSON");
}

/// Parsed command options.
struct Options {
    target: PathBuf,
    settings: Option<PathBuf>,
    timeout_ms: Option<u64>,
    json: bool,
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut target = None;
    let mut settings = None;
    let mut timeout_ms = None;
    let mut json = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--settings" => {
                let value = args.get(i + 1).context("--settings needs a path")?;
                settings = Some(PathBuf::from(value));
                i += 1;
            }
            "--timeout-ms" => {
                let value = args.get(i + 1).context("--timeout-ms needs a value")?;
                timeout_ms = Some(value.parse().with_context(|| format!("bad timeout '{}'", value))?);
                i += 1;
            }
            "--json" => json = true,
            other if target.is_none() => target = Some(PathBuf::from(other)),
            other => bail!("unexpected argument '{}'", other),
        }
        i += 1;
    }

    Ok(Options {
        target: target.context("missing path")?,
        settings,
        timeout_ms,
        json,
    })
}

fn build_engine(settings_path: Option<&Path>) -> Result<Arc<ValidationEngine>> {
    let settings = match settings_path {
        Some(path) => ValidationSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => ValidationSettings::default(),
    };
    let service = Arc::new(StaticSettingsService::new(settings));
    Ok(Arc::new(ValidationEngine::new(service)))
}

fn read_request(path: &Path) -> Result<ValidationRequest> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let record = Record::from_json(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(ValidationRequest::new(record))
}

fn validate_file(args: &[String]) -> Result<bool> {
    let options = parse_options(args)?;
    let engine = build_engine(options.settings.as_deref())?;
    let request = read_request(&options.target)?;

    let result = engine.validate_resource(&request)?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&options.target, &result);
    }
    Ok(result.is_valid)
}

fn validate_directory(args: &[String]) -> Result<bool> {
    let options = parse_options(args)?;
    let engine = build_engine(options.settings.as_deref())?;

    let mut requests = Vec::new();
    let mut paths = Vec::new();
    for entry in WalkDir::new(&options.target).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", options.target.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match read_request(path) {
            Ok(request) => {
                requests.push(request);
                paths.push(path.to_path_buf());
            }
            Err(err) => eprintln!("Skipping {}: {:#}", path.display(), err),
        }
    }
    if requests.is_empty() {
        bail!("no records found under {}", options.target.display());
    }

    let pipeline = ValidationPipeline::new(engine);
    let mut config = pipeline.config();
    if let Some(ms) = options.timeout_ms {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    let run = pipeline.execute_pipeline(requests, Some(config), None);

    if options.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(run.summary.failed == 0);
    }

    for (path, result) in paths.iter().zip(&run.results) {
        print_result(path, result);
    }

    let summary = &run.summary;
    println!();
    println!(
        "{} records: {} passed, {} failed, score {}",
        summary.total, summary.passed, summary.failed, summary.overall_score
    );
    if summary.timed_out > 0 {
        println!("{} records timed out", summary.timed_out);
    }
    if !summary.top_issues.is_empty() {
        println!("Most frequent issues:");
        for issue in &summary.top_issues {
            println!("  {:>4}  {}  {}", issue.count, issue.code, issue.message);
        }
    }
    println!(
        "Took {} ms ({:.1} records/s, {} cached)",
        run.performance.total_ms, run.performance.throughput_per_sec, run.performance.cache_hits
    );
    Ok(summary.failed == 0)
}

fn print_result(path: &Path, result: &ValidationResult) {
    let status = if result.is_valid { "VALID" } else { "INVALID" };
    println!("{} {} (score {})", status, path.display(), result.score);
    for issue in &result.issues {
        let location = issue.path();
        if location.is_empty() {
            println!("  [{}] {} {}: {}", issue.severity, issue.aspect, issue.code, issue.message);
        } else {
            println!(
                "  [{}] {} {} at {}: {}",
                issue.severity, issue.aspect, issue.code, location, issue.message
            );
        }
    }
}
