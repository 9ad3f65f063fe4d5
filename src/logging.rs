use anyhow::Context as _;

/// Parser and HTTP internals are chatty at `debug`; keep them at `warn`
/// unless `RUST_LOG` says otherwise.
const DEFAULT_FILTER: &str = "info,html5ever=warn,selectors=warn,hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn";

/// Diagnostics go to stderr so that reports on stdout stay machine-readable.
pub fn init() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(DEFAULT_FILTER))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
