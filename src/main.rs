use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;
use tokio_util::sync::CancellationToken;

use serialbook::cli::{Cli, Command};
use serialbook::fetch::FetchPolicy;
use serialbook::formats::{DownloadStatus, UnitStatus};
use serialbook::pipeline::{Pipeline, PipelineReport};
use serialbook::workspace::Workspace;

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` means the run completed but reported a failure.
async fn try_main() -> anyhow::Result<bool> {
    serialbook::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    let report = match cli.command {
        Command::Download(args) => {
            let request = args.source.to_request(args.metadata.to_overrides())?;
            Pipeline::new(
                Workspace::new(&args.workspace.workspace),
                FetchPolicy::from(&args.policy),
            )
            .with_cancellation(cancel)
            .discover_and_fetch(&request)
            .await
            .context("download")?
        }
        Command::Process(args) => {
            Pipeline::new(Workspace::new(&args.workspace.workspace), FetchPolicy::default())
                .with_cancellation(cancel)
                .process(&args.series)
                .context("process")?
        }
        Command::Assemble(args) => {
            let options = args.to_options();
            Pipeline::new(Workspace::new(&args.workspace.workspace), FetchPolicy::default())
                .with_language(args.lang.clone())
                .with_cancellation(cancel)
                .assemble(&args.series, &options)
                .await
                .context("assemble")?
        }
        Command::FullProcess(args) => {
            let request = args.source.to_request(args.metadata.to_overrides())?;
            let options = args.to_options();
            Pipeline::new(
                Workspace::new(&args.workspace.workspace),
                FetchPolicy::from(&args.policy),
            )
            .with_language(args.lang.clone())
            .with_cancellation(cancel)
            .run_full(&request, &options)
            .await
            .context("full-process")?
        }
        Command::Status(args) => {
            let status = Pipeline::new(
                Workspace::new(&args.workspace.workspace),
                FetchPolicy::default(),
            )
            .status(&args.series)
            .context("status")?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status).context("serialize status")?
                );
            } else {
                print_status(&status);
            }
            return Ok(true);
        }
    };

    print_report(&report);
    Ok(report.is_success())
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing the current step");
            cancel.cancel();
        }
    });
}

fn print_report(report: &PipelineReport) {
    print!("{report}");
}

fn print_status(status: &DownloadStatus) {
    println!("series: {}", status.slug);
    if let Some(title) = &status.series.title {
        println!("title: {title}");
    }
    if let Some(author) = &status.series.author {
        println!("author: {author}");
    }
    println!(
        "units: {} (fetched {}, failed {}, pending {})",
        status.units.len(),
        status.count_with_status(UnitStatus::Fetched),
        status.count_with_status(UnitStatus::Failed),
        status.count_with_status(UnitStatus::Pending)
    );
    if let Some(last) = status.last_fetched() {
        println!("last fetched: {} {} ({})", last.position, last.title, last.url);
    }
    match &status.cursor.next_url {
        Some(next) => println!("next: {next}"),
        None => println!("next: none (chain exhausted)"),
    }
    if let Some(packaged) = status.packaged_through {
        println!("packaged through: {packaged}");
    }
}
