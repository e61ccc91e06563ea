use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{debug, info};
use std::sync::Arc;
use std::thread;

use imagediff::{
    AnalyzerRegistry, CancelSignal, Notifier, Options, OutputFormat, Processor, Request, Resolver,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// List the contents of a single image
    Analyze {
        #[arg(help = "Image to analyze (e.g., ubuntu:22.04, daemon://app:dev, ./image.tar)")]
        image: String,

        #[command(flatten)]
        flags: AnalysisFlags,
    },
    /// Compare the contents of two images
    Diff {
        #[arg(help = "Base image")]
        image1: String,

        #[arg(help = "Image compared against the base")]
        image2: String,

        #[command(flatten)]
        flags: AnalysisFlags,
    },
}

#[derive(Args)]
struct AnalysisFlags {
    #[arg(
        short = 't',
        long = "type",
        default_value = "apt",
        help = "Analyzer to run (apt, file, history, node, pip); repeat or comma separate"
    )]
    types: Vec<String>,

    #[arg(short, long, help = "Print results as JSON")]
    json: bool,

    #[arg(short, long, help = "Order entries by size instead of by name")]
    order: bool,

    #[arg(short, long, help = "Keep the extracted filesystems and print their paths")]
    save: bool,
}

impl AnalysisFlags {
    fn options(&self) -> Result<Options> {
        let options = Options {
            sort_by_size: self.order,
            preserve_filesystem: self.save,
            format: if self.json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            ..Options::default()
        };
        Ok(options.with_analyzers(&self.types)?)
    }
}

/// Cancels `cancel` on the first Ctrl-C.
fn watch_interrupt(cancel: CancelSignal) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                log::warn!("Interrupt handling unavailable: {}", e);
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, cancelling...");
                cancel.cancel();
            }
        });
    });
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity level
    let notifier = Arc::new(Notifier::new(cli.verbose));
    env_logger::Builder::from_env(Env::default())
        .filter_level(notifier.verbosity().to_log_level())
        .init();

    let (request, flags) = match cli.command {
        Command::Analyze { image, flags } => (Request::Analyze(image), flags),
        Command::Diff {
            image1,
            image2,
            flags,
        } => (Request::Diff(image1, image2), flags),
    };
    let options = flags.options()?;

    info!("Starting imagediff: {:?}", request);
    debug!("Analyzers: {:?}", options.analyzers);
    debug!("Verbosity: {:?}", notifier.verbosity());

    let cancel = CancelSignal::new();
    watch_interrupt(cancel.clone());

    let resolver =
        Resolver::new(Arc::clone(&notifier)).context("Failed to initialize image sources")?;
    let processor = Processor::new(resolver, AnalyzerRegistry::default(), notifier, cancel);

    let report = processor
        .run(&request, &options)
        .context("Failed to analyze images")?;

    print!("{}", report.output);
    if !report.output.ends_with('\n') {
        println!();
    }
    for (image, path) in &report.preserved {
        println!("Filesystem for {} kept at {}", image, path.display());
    }

    Ok(())
}
