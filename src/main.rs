use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod record;
mod settings;
mod store;
mod submission;

use record::RecordFactory;
use settings::{Config, LoadArgs};
use store::{ConnectionError, SolrClient, Status};
use submission::RunSummary;

const EXIT_FAILURE: u8 = 1;
const EXIT_CONNECTION: u8 = 2;
const EXIT_VERIFICATION: u8 = 3;

#[derive(Parser)]
#[command(name = "solr-load", about = "Insert synthetic documents into a SolrCloud collection")]
struct Cli {
    #[command(flatten)]
    args: LoadArgs,
}

#[derive(Debug, thiserror::Error)]
#[error("expected {expected} documents with last_name {last_name}, found {found}")]
struct VerificationError {
    last_name: String,
    expected: u64,
    found: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::new(&cli.args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config: {err:#}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match drive(config).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("Failed: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

// Only startup and the post-run check are fatal; failed records never are.
fn exit_code(err: &anyhow::Error) -> u8 {
    if err.chain().any(|cause| cause.is::<ConnectionError>()) {
        EXIT_CONNECTION
    } else if err.chain().any(|cause| cause.is::<VerificationError>()) {
        EXIT_VERIFICATION
    } else {
        EXIT_FAILURE
    }
}

async fn drive(config: Config) -> anyhow::Result<RunSummary> {
    let cancel = CancellationToken::new();
    let _exit_signal = {
        // An interrupt stops the generation of new records. Whatever is in flight still
        // finishes, so the summary stays accurate.
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(_) => {
                    tracing::debug!("Tokio's ctrl_c signal received");
                    cancel.cancel();
                }
                Err(err) => {
                    // The OS refused the handler; the run just can't be interrupted cleanly.
                    tracing::debug!("{}", err);
                }
            }
        })
    };

    let store = Arc::new(SolrClient::connect(&config.target()).await?);
    tracing::debug!("Writing round robin over {} nodes", store.nodes().len());
    let factory = RecordFactory::new(config.id_prefix.as_str(), config.seed);
    let last_name = factory.last_name().to_string();

    let summary = submission::run(store.clone(), factory, &config.plan(), cancel).await?;
    if !summary.failed.is_empty() {
        let ids: Vec<&str> = summary.failed_ids().collect();
        tracing::warn!("{} records failed after retries [ids={}]", ids.len(), ids.join(","));
    }

    if config.commit || config.verify {
        match store.commit().await {
            Ok(Status::Success) => tracing::info!("Committed"),
            Ok(status) => tracing::warn!("Commit rejected [status={}]", status),
            Err(err) => tracing::warn!("Commit failed: {}", err),
        }
    }

    if config.verify {
        let found = store
            .count_last_name(&last_name)
            .await
            .context("Counting the run's documents")?;
        if found != summary.succeeded {
            return Err(VerificationError {
                last_name,
                expected: summary.succeeded,
                found,
            }
            .into());
        }
        tracing::info!("Verified {} documents [last_name={}]", found, last_name);
    }

    Ok(summary)
}
