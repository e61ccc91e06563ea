//! End-to-end "image(s) → analyzer results" orchestrator.
//!
//! [`Processor`] ties the pieces together:
//! - validates the requested analyzer names against the [`AnalyzerRegistry`],
//! - resolves every image through the [`Resolver`] (one thread per image),
//! - runs each requested analyzer on its own scoped thread,
//! - renders the collected [`ResultSet`] in the requested format,
//! - and finally removes or preserves the materialized filesystems.
//!
//! A failure to materialize any image is fatal. A failing analyzer only
//! affects its own entry in the result set.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crate::analyzers::{run_analyzer, AnalyzerRegistry, Target};
use crate::cancel::CancelSignal;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::notifier::Notifier;
use crate::output::ResultSet;
use crate::sources::Resolver;

/// What to do with the given image identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Analyze(String),
    Diff(String, String),
}

impl Request {
    fn identifiers(&self) -> Vec<&str> {
        match self {
            Request::Analyze(image) => vec![image.as_str()],
            Request::Diff(image1, image2) => vec![image1.as_str(), image2.as_str()],
        }
    }
}

pub struct Report {
    /// Rendered output, ready to print.
    pub output: String,
    pub results: ResultSet,
    /// Filesystems kept on disk, by image identifier.
    pub preserved: Vec<(String, PathBuf)>,
}

pub struct Processor {
    resolver: Resolver,
    registry: AnalyzerRegistry,
    notifier: Arc<Notifier>,
    cancel: CancelSignal,
}

impl Processor {
    pub fn new(
        resolver: Resolver,
        registry: AnalyzerRegistry,
        notifier: Arc<Notifier>,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            resolver,
            registry,
            notifier,
            cancel,
        }
    }

    /// Resolves, analyzes and renders `request`.
    ///
    /// # Errors
    /// - [`Error::UnknownAnalyzer`] before any image is touched.
    /// - Any resolution error, including [`Error::Cancelled`].
    /// - [`Error::Render`] when structured output cannot be produced.
    pub fn run(&self, request: &Request, options: &Options) -> Result<Report> {
        self.registry.validate(&options.analyzers)?;

        let images = self.resolve_all(&request.identifiers())?;
        let target = match images.as_slice() {
            [image] => Target::Single(image),
            [image1, image2] => Target::Pair(image1, image2),
            _ => unreachable!("requests name one or two images"),
        };

        self.notifier.info("Running analyzers...");
        let results = self.run_analyzers(target, options);
        let rendered = results.render(options.format);

        let preserved = release(images, options);
        self.notifier.finish();

        Ok(Report {
            output: rendered?,
            results,
            preserved,
        })
    }

    fn resolve_all(&self, identifiers: &[&str]) -> Result<Vec<Image>> {
        self.notifier.info(&format!(
            "Retrieving image{} {}...",
            if identifiers.len() > 1 { "s" } else { "" },
            identifiers.join(" and ")
        ));

        let outcomes: Vec<Result<Image>> = thread::scope(|scope| {
            let workers: Vec<_> = identifiers
                .iter()
                .map(|id| {
                    let worker = scope.spawn(|| self.resolver.resolve(id, &self.cancel));
                    (*id, worker)
                })
                .collect();

            workers
                .into_iter()
                .map(|(id, worker)| {
                    worker.join().unwrap_or_else(|_| {
                        Err(Error::source_failure("resolver", id, "resolution thread panicked"))
                    })
                })
                .collect()
        });

        // Images resolved before a failure are dropped, which removes them.
        outcomes.into_iter().collect()
    }

    fn run_analyzers(&self, target: Target<'_>, options: &Options) -> ResultSet {
        let mut results = ResultSet::new();
        thread::scope(|scope| {
            let workers: Vec<_> = options
                .analyzers
                .iter()
                .map(|name| {
                    let worker =
                        scope.spawn(move || run_analyzer(&self.registry, name, target, options));
                    (name, worker)
                })
                .collect();

            for (name, worker) in workers {
                let outcome = worker.join().unwrap_or_else(|_| {
                    Err(Error::Render {
                        analyzer: name.clone(),
                        reason: "analyzer thread panicked".to_string(),
                    })
                });
                if let Err(e) = &outcome {
                    log::warn!("{} analyzer failed: {}", name, e);
                }
                results.insert(name.as_str(), outcome);
            }
        });
        results
    }
}

/// Removes each image's filesystem, or keeps it when asked to.
fn release(images: Vec<Image>, options: &Options) -> Vec<(String, PathBuf)> {
    let mut preserved = Vec::new();
    for image in images {
        let source = image.source().to_string();
        if options.preserve_filesystem {
            let path = image.preserve();
            log::info!("Preserved filesystem of {} at {}", source, path.display());
            preserved.push((source, path));
        } else if let Err(e) = image.cleanup() {
            log::warn!("Failed to remove filesystem of {}: {}", source, e);
        }
    }
    preserved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputFormat;
    use crate::image::ConfigSchema;
    use crate::sources::Source;
    use crate::test_utils::write_files;
    use std::collections::BTreeSet;
    use std::path::Path;

    /// Fills every image with a dpkg database and a file named after the image.
    struct FixtureSource;

    impl Source for FixtureSource {
        fn name(&self) -> &str {
            "fixture"
        }

        fn supports_image(&self, identifier: &str) -> bool {
            !identifier.starts_with("missing")
        }

        fn materialize_filesystem(
            &self,
            identifier: &str,
            dest: &Path,
            _cancel: &CancelSignal,
        ) -> Result<()> {
            write_files(
                dest,
                &[
                    (
                        "var/lib/dpkg/status",
                        b"Package: base\nStatus: install ok installed\nVersion: 1\n",
                    ),
                    (identifier, b"contents"),
                ],
            );
            Ok(())
        }

        fn extract_config(&self, identifier: &str) -> Result<ConfigSchema> {
            Ok(ConfigSchema {
                env: Vec::new(),
                history: vec![crate::image::HistoryItem::new(format!("build {}", identifier))],
            })
        }
    }

    struct NeverSource;

    impl Source for NeverSource {
        fn name(&self) -> &str {
            "never"
        }

        fn supports_image(&self, _identifier: &str) -> bool {
            false
        }

        fn materialize_filesystem(&self, _: &str, _: &Path, _: &CancelSignal) -> Result<()> {
            unreachable!()
        }

        fn extract_config(&self, _: &str) -> Result<ConfigSchema> {
            unreachable!()
        }
    }

    fn processor() -> Processor {
        Processor::new(
            Resolver::with_sources(
                Box::new(FixtureSource),
                Box::new(NeverSource),
                Box::new(NeverSource),
            ),
            AnalyzerRegistry::default(),
            Arc::new(Notifier::new(1)),
            CancelSignal::new(),
        )
    }

    fn options(analyzers: &[&str], format: OutputFormat) -> Options {
        Options {
            analyzers: analyzers.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            format,
            ..Options::default()
        }
    }

    #[test]
    fn test_diff_runs_every_analyzer_and_cleans_up() {
        let report = processor()
            .run(
                &Request::Diff("one".to_string(), "two".to_string()),
                &options(&["history", "apt", "file"], OutputFormat::Json),
            )
            .unwrap();

        assert_eq!(report.results.len(), 3);
        assert_eq!(report.results.failures().count(), 0);
        assert!(report.preserved.is_empty());

        let parsed: serde_json::Value = serde_json::from_str(&report.output).unwrap();
        let kinds: Vec<&str> = parsed
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["DiffType"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["Apt", "File", "History"]);
        assert_eq!(parsed[1]["Diff"]["Adds"][0]["Name"], "/two");
        assert_eq!(parsed[1]["Diff"]["Dels"][0]["Name"], "/one");
    }

    #[test]
    fn test_unknown_analyzer_is_rejected_up_front() {
        let err = processor()
            .run(
                &Request::Analyze("one".to_string()),
                &options(&["apt", "rpm"], OutputFormat::Text),
            )
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownAnalyzer(ref n) if n == "rpm"));
    }

    #[test]
    fn test_unresolvable_image_is_fatal() {
        let err = processor()
            .run(
                &Request::Diff("one".to_string(), "missing".to_string()),
                &options(&["file"], OutputFormat::Text),
            )
            .err()
            .unwrap();
        assert!(matches!(err, Error::SourceUnresolved { ref image, .. } if image == "missing"));
    }

    #[test]
    fn test_preserve_keeps_filesystems() {
        let report = processor()
            .run(
                &Request::Analyze("one".to_string()),
                &Options {
                    preserve_filesystem: true,
                    ..options(&["file"], OutputFormat::Text)
                },
            )
            .unwrap();

        assert_eq!(report.preserved.len(), 1);
        let (source, path) = &report.preserved[0];
        assert_eq!(source, "one");
        assert!(path.join("one").exists());
        assert!(report.output.contains("-----File-----"));
        std::fs::remove_dir_all(path).unwrap();
    }

    #[test]
    fn test_analyze_is_idempotent() {
        let processor = processor();
        let request = Request::Analyze("one".to_string());
        let options = options(&["apt", "file", "history", "node", "pip"], OutputFormat::Json);

        let first = processor.run(&request, &options).unwrap().output;
        let second = processor.run(&request, &options).unwrap().output;
        assert_eq!(first, second);
    }
}
