//! CLI binary for edgequake-tables.
//!
//! A thin shim over the library crate that maps CLI flags to `RunConfig` /
//! `RunParams`, wires the DocumentCloud collaborators, and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_tables::platform::documentcloud::DEFAULT_API_URL;
use edgequake_tables::{
    DocumentCloudClient, FailurePolicy, LlmVisionModel, LocalUploader, OutputFormat, Platform,
    ProgressCallback, RunConfig, RunOrchestrator, RunParams, RunProgressCallback, RunSummary,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per page. Pages may start
/// concurrently; completions arrive in page order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<(String, u32), Instant>>,
    retries: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Fetching documents…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            retries: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: u32) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(u64::from(total));
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, document: &str, page: u32) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(document.to_string(), page))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

fn truncate(msg: &str, max: usize) -> String {
    if msg.chars().count() > max {
        let head: String = msg.chars().take(max - 1).collect();
        format!("{head}\u{2026}")
    } else {
        msg.to_string()
    }
}

impl RunProgressCallback for CliProgressCallback {
    fn on_run_start(&self, documents: usize, total_pages: u32) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "Extracting tables from {total_pages} pages in {documents} documents…"
            ))
        ));
    }

    fn on_document_start(&self, document: &str, pages: u32) {
        self.bar.println(format!(
            "{} Document {}  {}",
            cyan("▸"),
            bold(document),
            dim(&format!("{pages} pages"))
        ));
    }

    fn on_page_start(&self, document: &str, page: u32) {
        self.start_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((document.to_string(), page), Instant::now());
        self.bar.set_message(format!("{document} p{page}"));
    }

    fn on_page_retry(&self, document: &str, page: u32, attempt: u32, error: &str) {
        self.retries.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {} p{:<4} attempt {} failed: {}",
            cyan("↻"),
            document,
            page,
            attempt,
            dim(&truncate(error, 80)),
        ));
    }

    fn on_page_complete(&self, document: &str, page: u32, tables_found: usize) {
        let secs = self.elapsed_secs(document, page);
        self.bar.println(format!(
            "  {} Page {:>4}  {:<10}  {}",
            green("✓"),
            page,
            dim(&format!("{tables_found:>3} tables")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, document: &str, page: u32, error: &str) {
        let secs = self.elapsed_secs(document, page);
        self.bar.println(format!(
            "  {} Page {:>4}  {}  {}",
            red("✗"),
            page,
            red(&truncate(error, 80)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_run_complete(&self, documents: usize, pages: u32) {
        self.bar.finish_and_clear();
        let retries = self.retries.load(Ordering::SeqCst);
        eprintln!(
            "{} {} pages from {} documents extracted{}",
            green("✔"),
            bold(&pages.to_string()),
            documents,
            if retries > 0 {
                dim(&format!("  ({retries} retries)"))
            } else {
                String::new()
            }
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Pages 1-5 of two documents, CSV, uploaded to the add-on run
  doctables --end-page 5 --org-id 1234 --run-id 987 20059100 20059101

  # JSON output, saved locally instead of uploaded
  doctables --format json --end-page 3 --org-id 1234 -o results/ 20059100

  # Platform payload passed verbatim
  doctables --params '{"prompt": "Budget tables only", "output_format": "csv", "start_page": 2, "end_page": 8}' \
            --org-id 1234 20059100

  # Faster: four pages in flight per document
  doctables -c 4 --end-page 40 --org-id 1234 20059100

BILLING:
  Each run costs 7 AI credits per effective page: the requested range
  clamped to each document's page count, summed over all documents.

OUTPUT:
  all_tables.zip with one tables-{id}.csv or tables-{id}.json per document.
  CSV: "Page Number: N", then per table its caption and data rows (no
  header row), then two blank rows.
  JSON: "Page number: N" followed by [{caption, dataframe}] with
  column-major dataframes.

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  DC_API_URL              DocumentCloud API root
  DC_TOKEN                DocumentCloud access token
  DC_ORG_ID               Organization charged for the run
  DC_RUN_ID               Add-on run receiving messages and the upload
"#;

/// Extract tables from DocumentCloud page images using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "doctables",
    version,
    about = "Extract tables from document page images into CSV or JSON using Vision LLMs",
    long_about = "Send each page image of the selected DocumentCloud documents to a Vision \
Language Model, validate the tables it finds, and deliver them as one CSV or JSON file per \
document, bundled in a zip archive. Supports OpenAI, Anthropic, Google Gemini, Azure OpenAI, \
and any OpenAI-compatible endpoint.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Document ids to process.
    #[arg(env = "DOCTABLES_DOCUMENTS", value_delimiter = ',')]
    documents: Vec<String>,

    /// Run parameters as the platform's JSON payload. Explicit flags win.
    #[arg(long, env = "DOCTABLES_PARAMS")]
    params: Option<String>,

    /// Extra extraction instructions for the model.
    #[arg(long, env = "DOCTABLES_PROMPT")]
    prompt: Option<String>,

    /// Artifact format.
    #[arg(short, long = "format", env = "DOCTABLES_FORMAT", value_enum)]
    format: Option<FormatArg>,

    /// First page to extract (1-indexed).
    #[arg(long, env = "DOCTABLES_START_PAGE")]
    start_page: Option<u32>,

    /// Last page to extract (inclusive). Clamped to each document's length.
    #[arg(long, env = "DOCTABLES_END_PAGE")]
    end_page: Option<u32>,

    /// Save the archive into this directory instead of uploading it.
    #[arg(short, long, env = "DOCTABLES_OUTPUT")]
    output: Option<PathBuf>,

    /// Keep artifacts in this directory (default: a temporary directory).
    #[arg(long, env = "DOCTABLES_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// DocumentCloud API root.
    #[arg(long, env = "DC_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// DocumentCloud access token.
    #[arg(long, env = "DC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Organization charged for the run.
    #[arg(long, env = "DC_ORG_ID")]
    org_id: Option<String>,

    /// Add-on run that receives status messages and the upload.
    #[arg(long, env = "DC_RUN_ID")]
    run_id: Option<String>,

    /// LLM model ID (e.g. gpt-4o, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Pages extracted concurrently per document.
    #[arg(short, long, env = "DOCTABLES_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Model attempts per page, including the first.
    #[arg(long, env = "DOCTABLES_MAX_ATTEMPTS", default_value_t = 6)]
    max_attempts: u32,

    /// Max LLM output tokens per page.
    #[arg(long, env = "DOCTABLES_MAX_TOKENS", default_value_t = 4000)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "DOCTABLES_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Per-call LLM timeout in seconds (0, the default, disables it).
    #[arg(long, env = "DOCTABLES_API_TIMEOUT", default_value_t = 0)]
    api_timeout: u64,

    /// What to upload when a page fails after every attempt.
    #[arg(long, env = "DOCTABLES_FAILURE_POLICY", value_enum, default_value = "abort")]
    failure_policy: FailurePolicyArg,

    /// Print the run summary as JSON on stdout.
    #[arg(long, env = "DOCTABLES_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCTABLES_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCTABLES_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCTABLES_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Csv => OutputFormat::Csv,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FailurePolicyArg {
    Abort,
    UploadCompleted,
}

impl From<FailurePolicyArg> for FailurePolicy {
    fn from(v: FailurePolicyArg) -> Self {
        match v {
            FailurePolicyArg::Abort => FailurePolicy::Abort,
            FailurePolicyArg::UploadCompleted => FailurePolicy::UploadCompleted,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn RunProgressCallback>)
    } else {
        None
    };

    let params = build_params(&cli)?;
    let config = build_config(&cli, progress_cb)?;
    let model = LlmVisionModel::from_config(&config).context("Failed to set up the LLM provider")?;

    let mut client = DocumentCloudClient::new(&cli.api_url, cli.token.clone())
        .context("Failed to create DocumentCloud client")?;
    if let Some(ref org) = cli.org_id {
        client = client.with_organization(org.clone());
    }
    if let Some(ref run) = cli.run_id {
        client = client.with_run(run.clone());
    }

    let mut platform = Platform::documentcloud(client);
    if let Some(ref dir) = cli.output {
        platform = platform.with_uploader(Arc::new(LocalUploader::new(dir.clone())));
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let orchestrator = RunOrchestrator::new(config, Arc::new(model), platform);
    let summary = orchestrator
        .run(&cli.documents, &params)
        .await
        .context("Run failed")?;

    print_summary(&cli, &summary, show_progress)?;
    Ok(())
}

/// `--params` payload first, then explicit flags on top.
fn build_params(cli: &Cli) -> Result<RunParams> {
    let mut params = match cli.params {
        Some(ref raw) => {
            serde_json::from_str::<RunParams>(raw).context("Invalid --params JSON")?
        }
        None => RunParams::default(),
    };

    if let Some(ref prompt) = cli.prompt {
        params.prompt = prompt.clone();
    }
    if let Some(format) = cli.format {
        params.output_format = format.into();
    }
    if let Some(start) = cli.start_page {
        params.start_page = start;
    }
    if let Some(end) = cli.end_page {
        params.end_page = Some(end);
    }
    Ok(params)
}

/// Map CLI args to `RunConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<RunConfig> {
    let mut builder = RunConfig::builder()
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .max_attempts(cli.max_attempts)
        .api_timeout_secs(cli.api_timeout)
        .concurrency(cli.concurrency)
        .failure_policy(cli.failure_policy.into());

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref dir) = cli.work_dir {
        builder = builder.work_dir(dir.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(cli: &Cli, summary: &RunSummary, show_progress: bool) -> Result<()> {
    if cli.json {
        let json = serde_json::to_string_pretty(summary).context("Failed to serialise summary")?;
        println!("{json}");
        return Ok(());
    }
    if cli.quiet {
        return Ok(());
    }

    if !show_progress {
        eprintln!(
            "Extracted {} tables from {} pages across {} documents in {}ms",
            summary.tables, summary.pages, summary.documents, summary.duration_ms
        );
    }
    let destination = match cli.output {
        Some(ref dir) => dir.join(&summary.archive).display().to_string(),
        None => summary.archive.clone(),
    };
    eprintln!(
        "{}  {} credits  →  {}",
        if summary.uploaded { green("✔") } else { cyan("⚠") },
        summary.credits_charged,
        bold(&destination),
    );
    eprintln!(
        "   {} tokens in  /  {} tokens out  —  {} model calls",
        dim(&summary.input_tokens.to_string()),
        dim(&summary.output_tokens.to_string()),
        summary.attempts,
    );
    Ok(())
}
