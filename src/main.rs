use anyhow::{Context, Result};
use clap::Parser;
use log::debug;
use std::path::PathBuf;

use imgsquash::{Notifier, SquashOptions, Squasher};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        help = "Image export archive to read (docker save output); '-' or absent reads STDIN"
    )]
    input: Option<PathBuf>,

    #[arg(
        short,
        long,
        help = "File to write the squashed image to; absent writes STDOUT"
    )]
    output: Option<PathBuf>,

    #[arg(
        short,
        long,
        help = "Layer to squash from: a layer id, a unique 12+ character prefix, or 'root'"
    )]
    from: Option<String>,

    #[arg(short, long, help = "Repository and optional tag for the squashed image (e.g., myapp:v2)")]
    tag: Option<String>,

    #[arg(long, help = "Keep the temporary working directory for inspection")]
    keep_temp: bool,

    #[arg(long, help = "Directory to create the temporary working directory in")]
    tmp_dir: Option<PathBuf>,

    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let notifier = Notifier::new(cli.verbose);

    debug!("Input: {:?}", cli.input);
    debug!("Output: {:?}", cli.output);
    debug!("Verbosity: {:?}", notifier.verbosity_level());

    let options = SquashOptions {
        input: cli.input,
        output: cli.output,
        from: cli.from,
        tag: cli.tag,
        keep_temp: cli.keep_temp,
        temp_dir: cli.tmp_dir,
    };

    let squasher = Squasher::new(notifier);
    squasher
        .squash(&options)
        .context("Failed to squash image")?;

    Ok(())
}
