//! End-to-end "image export → squashed image export" pipeline.
//!
//! [`Squasher`] ties the pieces together:
//! - validates the requested tag before touching anything,
//! - unpacks the export into a [`WorkDir`] and builds the layer graph,
//! - picks the squash point and merges every later layer into it,
//! - re-tags the result and streams the new export to a file or stdout.
//!
//! The working directory is removed whether the pipeline succeeds, fails or
//! is interrupted, unless [`SquashOptions::keep_temp`] asks to keep it. A
//! termination signal stops the pipeline at its next step boundary before
//! the directory goes away.

use crate::cancel::Cancellation;
use crate::error::{IoContext, SquashResult};
use crate::export::Export;
use crate::layer_config::short_id;
use crate::notifier::Notifier;
use crate::squash;
use crate::tag::TagRef;
use crate::workdir::WorkDir;
use std::fs::File;
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;

const STDIO_PATH: &str = "-";

/// What to squash and where to put the result.
#[derive(Debug, Clone, Default)]
pub struct SquashOptions {
    /// Export archive to read; `None` or `-` reads standard input.
    pub input: Option<PathBuf>,
    /// Where to write the squashed export; `None` writes standard output.
    pub output: Option<PathBuf>,
    /// Layer to squash from: a full id, a unique prefix of at least 12
    /// characters, or `root`. Picked automatically when absent.
    pub from: Option<String>,
    /// `repository[:tag]` to point at the squashed layer.
    pub tag: Option<String>,
    /// Leave the working directory in place for inspection.
    pub keep_temp: bool,
    /// Where to create the working directory; the system temp dir when
    /// absent.
    pub temp_dir: Option<PathBuf>,
}

pub struct Squasher {
    notifier: Notifier,
}

impl Squasher {
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Runs the whole pipeline and returns the id of the squashed layer.
    ///
    /// # Errors
    /// - [`crate::SquashError::Validation`] for a malformed tag, before any
    ///   input is read.
    /// - [`crate::SquashError::Format`] for malformed exports, exports holding
    ///   several images and branching history.
    /// - [`crate::SquashError::NotFound`] when `from` names no layer.
    /// - [`crate::SquashError::Io`] for any filesystem failure.
    pub fn squash(&self, options: &SquashOptions) -> SquashResult<String> {
        let started = Instant::now();
        let tag = options
            .tag
            .as_deref()
            .map(str::parse::<TagRef>)
            .transpose()?;

        let workdir = WorkDir::create(options.keep_temp, options.temp_dir.as_deref())?;
        let result = self.run(
            options,
            tag.as_ref(),
            workdir.path(),
            workdir.cancellation().clone(),
        );
        workdir.finish();

        let new_id = result?;
        self.notifier.info(&format!(
            "Done. New image created in {:.1}s",
            started.elapsed().as_secs_f64()
        ));
        self.notifier.finish();
        Ok(new_id)
    }

    fn run(
        &self,
        options: &SquashOptions,
        tag: Option<&TagRef>,
        dir: &Path,
        cancel: Cancellation,
    ) -> SquashResult<String> {
        let mut export = self.load(options.input.as_deref(), dir, cancel)?;

        export.check_single_image()?;
        let start = export.resolve_start(options.from.as_deref())?.id().to_string();
        self.notifier
            .info(&format!("Squashing from layer {}", short_id(&start)));
        self.log_history(&export, &start);
        // Branching history is rejected before anything is extracted.
        let descendants = export.graph().descendants(&start)?;
        self.notifier
            .debug(&format!("{} layers to merge", descendants.len()));

        export.extract_layers(&self.notifier)?;
        let new_id = squash::squash_layers(&mut export, &start, &self.notifier)?;

        export.cancellation().check()?;
        self.notifier.debug("Removing extracted layers");
        export.remove_extracted_layers(&new_id)?;

        if let Some(tag) = tag {
            let leaf = export.graph().leaf()?.id().to_string();
            self.notifier
                .debug(&format!("Tagging {} as {}", short_id(&leaf), tag));
            export.tag(tag, &leaf);
            export.write_tag_table()?;
        }

        self.write(&export, options.output.as_deref())?;
        self.log_history(&export, &new_id);
        Ok(new_id)
    }

    fn load(&self, input: Option<&Path>, dir: &Path, cancel: Cancellation) -> SquashResult<Export> {
        let reader: Box<dyn Read> = match input {
            Some(path) if path != Path::new(STDIO_PATH) => {
                self.notifier
                    .info(&format!("Loading image export {}", path.display()));
                Box::new(File::open(path).with_path("Failed to open", path)?)
            }
            _ => {
                self.notifier.info("Loading image export from STDIN");
                Box::new(io::stdin().lock())
            }
        };
        Export::load_with(reader, dir, cancel)
    }

    fn write(&self, export: &Export, output: Option<&Path>) -> SquashResult<()> {
        match output {
            Some(path) => {
                self.notifier
                    .info(&format!("Writing new image to {}", path.display()));
                let file = File::create(path).with_path("Failed to create", path)?;
                export.write_to(BufWriter::new(file))?;
            }
            None => {
                self.notifier.info("Writing new image to STDOUT");
                let stdout = export.write_to(io::stdout().lock())?;
                drop(stdout);
            }
        }
        Ok(())
    }

    fn log_history(&self, export: &Export, marked: &str) {
        for entry in export.history(Some(marked)) {
            self.notifier.debug(&entry.to_string());
        }
    }
}
