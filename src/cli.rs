use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use url::Url;

use crate::discover::MetadataOverrides;
use crate::fetch::{DEFAULT_USER_AGENT, FetchPolicy};
use crate::pipeline::{AssembleOptions, SeriesRequest};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Discover a series and fetch units from the recorded cursor onward.
    Download(DownloadArgs),
    /// Normalise fetched units that have not been processed since their fetch.
    Process(ProcessArgs),
    /// Package processed units into EPUB volumes.
    Assemble(AssembleArgs),
    /// Download, process and assemble, then remove intermediates.
    FullProcess(FullProcessArgs),
    /// Show the recorded download state of a series.
    Status(StatusArgs),
}

#[derive(Debug, Args)]
pub struct WorkspaceArgs {
    /// Directory holding state, raw and processed units, and volumes.
    #[arg(long, default_value = "archive")]
    pub workspace: String,
}

#[derive(Debug, Args)]
pub struct SourceArgs {
    /// Series overview URL or any unit URL (http/https).
    pub url: String,

    /// Begin fetching at this unit, whatever the overview page links to.
    #[arg(long)]
    pub start_unit_url: Option<String>,

    /// Series identifier (default: derived from the URL).
    #[arg(long)]
    pub slug: Option<String>,

    /// When the chain looks exhausted, re-read the last unit for new links.
    #[arg(long)]
    pub refresh_tail: bool,
}

impl SourceArgs {
    pub fn to_request(&self, overrides: MetadataOverrides) -> anyhow::Result<SeriesRequest> {
        let source_url = parse_http_url(&self.url).context("parse URL")?;
        let start_unit_url = self
            .start_unit_url
            .as_deref()
            .map(parse_http_url)
            .transpose()
            .context("parse --start-unit-url")?;
        Ok(SeriesRequest {
            source_url,
            start_unit_url,
            slug: self.slug.clone(),
            overrides,
            refresh_tail: self.refresh_tail,
        })
    }
}

fn parse_http_url(input: &str) -> anyhow::Result<Url> {
    let url = Url::parse(input.trim()).with_context(|| format!("invalid url: {input}"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http/https: {url}");
    }
    Ok(url)
}

#[derive(Debug, Args)]
pub struct FetchPolicyArgs {
    /// Attempts per unit before it is recorded as failed (first try included).
    #[arg(long, default_value_t = 4)]
    pub max_attempts: u32,

    /// Base of the exponential backoff between attempts.
    #[arg(long, default_value_t = 500)]
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay.
    #[arg(long, default_value_t = 30_000)]
    pub backoff_max_ms: u64,

    /// Minimum delay between successive unit fetches (politeness).
    #[arg(long, default_value_t = 1_500)]
    pub delay_ms: u64,

    /// Maximum random jitter added to every delay.
    #[arg(long, default_value_t = 2_000)]
    pub jitter_ms: u64,

    /// Per-request timeout.
    #[arg(long, default_value_t = 15)]
    pub timeout_secs: u64,

    /// Stop the walk after this many units failed in one run.
    #[arg(long, default_value_t = 5)]
    pub max_unit_failures: usize,

    /// Fetch at most this many units in one run.
    #[arg(long)]
    pub max_units: Option<usize>,

    #[arg(long, default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,
}

impl From<&FetchPolicyArgs> for FetchPolicy {
    fn from(args: &FetchPolicyArgs) -> Self {
        Self {
            max_attempts: args.max_attempts.max(1),
            backoff_base: Duration::from_millis(args.backoff_base_ms),
            backoff_max: Duration::from_millis(args.backoff_max_ms),
            min_delay: Duration::from_millis(args.delay_ms),
            jitter: Duration::from_millis(args.jitter_ms),
            timeout: Duration::from_secs(args.timeout_secs.max(1)),
            max_unit_failures: args.max_unit_failures,
            max_units: args.max_units,
            user_agent: args.user_agent.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct MetadataArgs {
    /// Series title (replaces the discovered one).
    #[arg(long)]
    pub title: Option<String>,

    #[arg(long)]
    pub author: Option<String>,

    /// Cover image URL.
    #[arg(long)]
    pub cover_url: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// Comma-separated subject tags.
    #[arg(long, value_delimiter = ',')]
    pub tags: Option<Vec<String>>,

    #[arg(long)]
    pub publisher: Option<String>,
}

impl MetadataArgs {
    pub fn to_overrides(&self) -> MetadataOverrides {
        MetadataOverrides {
            title: self.title.clone(),
            author: self.author.clone(),
            cover_url: self.cover_url.clone(),
            description: self.description.clone(),
            tags: self.tags.as_ref().map(|tags| {
                tags.iter()
                    .map(|tag| tag.trim().to_owned())
                    .filter(|tag| !tag.is_empty())
                    .collect()
            }),
            publisher: self.publisher.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    #[command(flatten)]
    pub policy: FetchPolicyArgs,

    #[command(flatten)]
    pub metadata: MetadataArgs,
}

#[derive(Debug, Args)]
pub struct ProcessArgs {
    /// Series identifier.
    #[arg(long)]
    pub series: String,

    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}

#[derive(Debug, Args)]
pub struct AssembleArgs {
    /// Series identifier.
    #[arg(long)]
    pub series: String,

    /// Units per volume; 0 packs everything into a single volume.
    #[arg(long, default_value_t = 50)]
    pub units_per_volume: usize,

    /// BCP-47 language tag written into the volumes.
    #[arg(long, default_value = "en")]
    pub lang: String,

    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    #[command(flatten)]
    pub metadata: MetadataArgs,
}

impl AssembleArgs {
    pub fn to_options(&self) -> AssembleOptions {
        AssembleOptions {
            units_per_volume: self.units_per_volume,
            keep_intermediates: true,
            overrides: self.metadata.to_overrides(),
        }
    }
}

#[derive(Debug, Args)]
pub struct FullProcessArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Units per volume; 0 packs everything into a single volume.
    #[arg(long, default_value_t = 50)]
    pub units_per_volume: usize,

    /// Keep raw and processed units after packaging.
    #[arg(long)]
    pub keep_intermediates: bool,

    /// BCP-47 language tag written into the volumes.
    #[arg(long, default_value = "en")]
    pub lang: String,

    #[command(flatten)]
    pub workspace: WorkspaceArgs,

    #[command(flatten)]
    pub policy: FetchPolicyArgs,

    #[command(flatten)]
    pub metadata: MetadataArgs,
}

impl FullProcessArgs {
    pub fn to_options(&self) -> AssembleOptions {
        AssembleOptions {
            units_per_volume: self.units_per_volume,
            keep_intermediates: self.keep_intermediates,
            overrides: MetadataOverrides::default(),
        }
    }
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Series identifier.
    #[arg(long)]
    pub series: String,

    /// Print the full status document as JSON.
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub workspace: WorkspaceArgs,
}
