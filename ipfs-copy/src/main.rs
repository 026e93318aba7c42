use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ipfs-copy",
    version,
    about = "Copy pinned content to an IPFS node",
    long_about = "`ipfs-copy` pins content on a destination IPFS node, either from a list of CIDs or by copying the pin set of another node.

EXAMPLES:
    # Pin every CID listed in a file, keeping track of failures
    ipfs-copy --cids cids.txt --cids-failed failed.txt --project-id ID --project-secret SECRET

    # Retry only what failed last time
    ipfs-copy --cids failed.txt --cids-failed failed-again.txt --project-id ID --project-secret SECRET

    # Copy all blocks and pins of a local node
    ipfs-copy --source-api-url localhost:5001 --project-id ID --project-secret SECRET

Every flag can also be set through the environment variable shown in its help."
)]
#[command(group(
    clap::ArgGroup::new("mode")
        .required(true)
        .args(["cids", "source_api_url"]),
))]
struct Args {
    // Source
    /// File with the CIDs to pin, one per line
    ///
    /// Only the first whitespace-delimited token of a line is used; blank lines and lines that
    /// do not start with a valid CID are skipped.
    #[arg(long, env = "IC_CIDS", value_name = "PATH", help_heading = "Source")]
    cids: Option<std::path::PathBuf>,

    /// RPC API address of a node whose recursive and direct pins will be copied
    #[arg(
        long,
        env = "IC_SOURCE_API_URL",
        value_name = "URL",
        help_heading = "Source"
    )]
    source_api_url: Option<String>,

    /// Pin without copying the blocks first
    ///
    /// Only useful if the destination already holds (or can fetch) the data.
    #[arg(long, requires = "source_api_url", help_heading = "Source")]
    skip_blocks: bool,

    // Destination
    /// RPC API address of the destination node
    #[arg(
        long,
        env = "IC_API_URL",
        default_value = "https://ipfs.infura.io:5001",
        value_name = "URL",
        help_heading = "Destination"
    )]
    api_url: String,

    /// Project ID, the basic auth username for the destination
    #[arg(
        long,
        env = "IC_PROJECT_ID",
        value_name = "ID",
        help_heading = "Destination"
    )]
    project_id: String,

    /// Project secret, the basic auth password for the destination
    #[arg(
        long,
        env = "IC_PROJECT_SECRET",
        hide_env_values = true,
        value_name = "SECRET",
        help_heading = "Destination"
    )]
    project_secret: String,

    /// File to write the CIDs that failed to copy to, one per line
    ///
    /// The file can be passed back with --cids to retry only the failures.
    #[arg(
        long,
        env = "IC_CIDS_FAILED",
        value_name = "PATH",
        help_heading = "Destination"
    )]
    cids_failed: Option<std::path::PathBuf>,

    // Performance & throttling
    /// Number of concurrent workers
    #[arg(
        long,
        env = "IC_WORKERS",
        default_value = "20",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    workers: usize,

    /// Maximum number of requests per second sent to the destination, 0 means no throttle
    ///
    /// The budget is shared by all workers.
    #[arg(
        long,
        env = "IC_MAX_REQ_PER_SEC",
        default_value = "10",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    max_req_per_sec: u32,

    /// Timeout of a single request, e.g. "30s", "5min"
    #[arg(
        long,
        default_value = "5min",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        help_heading = "Performance & throttling"
    )]
    timeout: std::time::Duration,

    // Output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Output")]
    verbose: u8,

    /// Quiet mode, don't report errors nor print the summary at the end
    #[arg(short = 'q', long = "quiet", help_heading = "Output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,
}

/// Whether `a` and `b` name the same file; `b` may not exist yet.
fn same_file(a: &std::path::Path, b: &std::path::Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

// skip_all: the arguments carry the project secret
#[instrument(skip_all)]
async fn async_main(args: Args) -> Result<common::copy::Summary> {
    let settings = common::PinSettings {
        workers: args.workers,
        skip_blocks: args.skip_blocks,
    };
    let throttle = common::ThrottleConfig {
        max_reqs_per_sec: args.max_req_per_sec,
    };
    let sink = Arc::new(match &args.cids_failed {
        Some(path) => common::sink::FailureSink::create(path).await?,
        None => common::sink::FailureSink::discard(),
    });
    let destination = common::NodeConfig {
        api_url: args.api_url.clone(),
        auth: Some(common::api::BasicAuth {
            username: args.project_id.clone(),
            password: args.project_secret.clone(),
        }),
        timeout: args.timeout,
    }
    .connect()
    .context("invalid destination node")?;
    tracing::info!(
        "pinning CIDs to {} with {} workers and at most {} req/s",
        destination.base_url(),
        settings.workers,
        throttle.max_reqs_per_sec
    );
    let destination = Arc::new(destination);
    if let Some(path) = &args.cids {
        return common::pin_from_file(destination, path, &settings, throttle.limiter(), sink).await;
    }
    let Some(source_api_url) = &args.source_api_url else {
        return Err(anyhow!("either --cids or --source-api-url is required"));
    };
    let source = common::NodeConfig {
        api_url: source_api_url.clone(),
        auth: None,
        timeout: args.timeout,
    }
    .connect()
    .context("invalid source node")?;
    common::copy_from_node(
        Arc::new(source),
        destination,
        &settings,
        throttle.limiter(),
        sink,
    )
    .await
}

fn main() -> Result<()> {
    // `ipfs-copy version` predates --version and is still accepted
    if std::env::args().nth(1).as_deref() == Some("version") {
        println!("ipfs-copy version: {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let args = Args::parse();
    let settings = common::PinSettings {
        workers: args.workers,
        skip_blocks: args.skip_blocks,
    };
    if let Err(error) = settings.validate() {
        Args::command()
            .error(clap::error::ErrorKind::ValueValidation, error)
            .exit();
    }
    // the failed CIDs file is truncated before the CIDs file is read
    if args
        .cids
        .as_deref()
        .zip(args.cids_failed.as_deref())
        .is_some_and(|(cids, failed)| same_file(cids, failed))
    {
        Args::command()
            .error(
                clap::error::ErrorKind::ArgumentConflict,
                "--cids-failed must not be the --cids file, write the failures to a new file",
            )
            .exit();
    }
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
