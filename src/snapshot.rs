//! One snapshot run: scan, plan, fetch, store, rewrite, write.
//!
//! The phases never overlap. Scanning produces an immutable reference list,
//! fetching produces an immutable resolution per unique resource, and only
//! then is a fresh parse of the page rewritten on the calling task. The entry
//! document is written last, so an interrupted run leaves at most some
//! already-complete resource files behind, which the next run reuses.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::classifier::{Classified, ResourceCategory, UriClassifier};
use crate::config::{SnapshotConfig, UnresolvedPolicy};
use crate::downloader::{FetchOutcome, FetchReport, FetchedBody, ResourceFetcher};
use crate::error::{JobError, ReferenceError};
use crate::file_manager::{LocalStore, PathPlanner, PlannedResource, ResolvedResource};
use crate::html_parser::{scan, HtmlDocument, ResourceReference};
use crate::progress::{NoProgress, ProgressReporter, ProgressTracker, DOWNLOAD_START};
use crate::rewriter::{apply_rewrites, inject_metadata, Rewrite};

pub const GENERATOR: &str = concat!("page-mirror ", env!("CARGO_PKG_VERSION"));

/// A reference, or unique resource, that could not be mirrored.
#[derive(Debug)]
pub struct FailedReference {
    /// Raw value for classification failures, source key otherwise.
    pub source: String,
    pub category: ResourceCategory,
    pub error: ReferenceError,
}

#[derive(Debug)]
pub struct SnapshotReport {
    pub entry_path: PathBuf,
    /// Every resource present in the mirror, in order of first appearance.
    pub resources: Vec<ResolvedResource>,
    pub failures: Vec<FailedReference>,
    pub skipped: Vec<ReferenceError>,
    /// Resources reused from files an earlier run left on disk.
    pub cache_hits: usize,
    /// HTTP requests issued across all resources, retries included.
    pub http_attempts: u32,
    /// References whose value changed in the entry document.
    pub rewritten: usize,
}

struct ResolutionPlan {
    units: Vec<PlannedResource>,
    /// For each scanned reference, the unit it resolves through.
    assignment: Vec<Option<usize>>,
    failures: Vec<FailedReference>,
}

struct UnitResult {
    resolution: Result<ResolvedResource, ReferenceError>,
    cache_hit: bool,
    attempts: u32,
}

pub struct SnapshotJob {
    classifier: UriClassifier,
    output_root: PathBuf,
    config: SnapshotConfig,
    prefetched: HashMap<String, Vec<u8>>,
    progress: Arc<dyn ProgressReporter>,
}

impl SnapshotJob {
    pub fn new(
        base_url: &str,
        output_root: impl Into<PathBuf>,
        config: SnapshotConfig,
    ) -> Result<Self, JobError> {
        Ok(Self {
            classifier: UriClassifier::new(base_url)?,
            output_root: output_root.into(),
            config,
            prefetched: HashMap::new(),
            progress: Arc::new(NoProgress),
        })
    }

    /// Response bodies the caller already holds, keyed by absolute URL.
    pub fn with_prefetched(mut self, bodies: HashMap<String, Vec<u8>>) -> Self {
        self.prefetched = bodies;
        self
    }

    pub fn with_progress(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress = reporter;
        self
    }

    pub fn entry_path(&self) -> PathBuf {
        self.output_root.join(&self.config.entry_file)
    }

    /// Mirrors `html` into the output root.
    ///
    /// Always reports 100% at the end, also when a [`JobError`] is returned.
    pub async fn run(&self, html: &str) -> Result<SnapshotReport, JobError> {
        let tracker = ProgressTracker::new(self.progress.clone());
        tracker.report(0.0, "Preparing snapshot");

        let result = self.run_phases(html, &tracker).await;
        match &result {
            Ok(report) => {
                info!(
                    entry = %report.entry_path.display(),
                    resources = report.resources.len(),
                    failures = report.failures.len(),
                    cache_hits = report.cache_hits,
                    "snapshot complete"
                );
                tracker.report(100.0, "Snapshot complete");
            }
            Err(e) => tracker.report(100.0, &format!("Snapshot failed: {e}")),
        }
        result
    }

    async fn run_phases(
        &self,
        html: &str,
        tracker: &ProgressTracker,
    ) -> Result<SnapshotReport, JobError> {
        let store = LocalStore::new(&self.output_root)?;
        let fetcher = ResourceFetcher::new(&self.config)?.with_prefetched(self.prefetched.clone());

        tracker.report(5.0, "Parsing HTML");
        let scanned = scan(&HtmlDocument::parse(html));
        let mut plan = self.plan(&scanned.references);

        tracker.report(DOWNLOAD_START, "Downloading resources");
        let results = self.resolve_all(&plan.units, &store, &fetcher, tracker).await;

        tracker.report(90.0, "Updating resource paths");
        let replacements = self.replacements(&scanned.references, &plan, &results, &store);
        let (document, rewritten) = {
            let mut doc = HtmlDocument::parse(html);
            let rewrites: Vec<Rewrite<'_>> = scanned
                .references
                .iter()
                .zip(&replacements)
                .filter_map(|(reference, replacement)| {
                    replacement.as_deref().map(|replacement| Rewrite {
                        reference,
                        replacement,
                    })
                })
                .collect();
            let rewritten = apply_rewrites(&doc, &rewrites);

            tracker.report(95.0, "Adding metadata");
            inject_metadata(&mut doc, GENERATOR);
            (doc.to_html().map_err(JobError::Serialize)?, rewritten)
        };

        tracker.report(98.0, "Saving HTML file");
        let entry_path = self.entry_path();
        std::fs::write(&entry_path, document).map_err(|source| JobError::Output {
            path: entry_path.clone(),
            source,
        })?;

        let mut resources = Vec::new();
        let mut cache_hits = 0;
        let mut http_attempts = 0;
        for (unit, result) in plan.units.iter().zip(results) {
            http_attempts += result.attempts;
            match result.resolution {
                Ok(resolved) => {
                    if result.cache_hit {
                        cache_hits += 1;
                    }
                    resources.push(resolved);
                }
                Err(error) => plan.failures.push(FailedReference {
                    source: unit.source_key.clone(),
                    category: unit.category,
                    error,
                }),
            }
        }

        Ok(SnapshotReport {
            entry_path,
            resources,
            failures: plan.failures,
            skipped: scanned.skipped,
            cache_hits,
            http_attempts,
            rewritten,
        })
    }

    /// Classifies every reference and gives each distinct source one local path.
    fn plan(&self, references: &[ResourceReference]) -> ResolutionPlan {
        let mut planner = PathPlanner::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        let mut plan = ResolutionPlan {
            units: Vec::new(),
            assignment: Vec::with_capacity(references.len()),
            failures: Vec::new(),
        };

        for reference in references {
            let classified = match self.classifier.classify(&reference.raw_value) {
                Ok(classified) => classified,
                Err(error) => {
                    warn!(value = %reference.raw_value, %error, "reference left unresolved");
                    plan.failures.push(FailedReference {
                        source: reference.raw_value.clone(),
                        category: reference.category,
                        error,
                    });
                    plan.assignment.push(None);
                    continue;
                }
            };

            let key = crate::file_manager::source_key(&classified);
            let unit = *by_key.entry(key).or_insert_with(|| {
                plan.units.push(planner.plan(classified, reference.category));
                plan.units.len() - 1
            });
            plan.assignment.push(Some(unit));
        }

        plan
    }

    async fn resolve_all(
        &self,
        units: &[PlannedResource],
        store: &LocalStore,
        fetcher: &ResourceFetcher,
        tracker: &ProgressTracker,
    ) -> Vec<UnitResult> {
        let total = units.len();
        let mut pending: FuturesUnordered<_> = units
            .iter()
            .enumerate()
            .map(|(index, unit)| async move { (index, resolve_unit(unit, store, fetcher).await) })
            .collect();

        let mut results: Vec<Option<UnitResult>> = (0..total).map(|_| None).collect();
        let mut processed = 0;
        while let Some((index, result)) = pending.next().await {
            processed += 1;
            let unit = &units[index];
            let message = match &result.resolution {
                Ok(resolved) if result.cache_hit => format!("Using cache: {}", resolved.local_path),
                Ok(resolved) => format!("Saved resource: {}", resolved.local_path),
                Err(_) => format!("Failed: {}", unit.source_key),
            };
            tracker.report(ProgressTracker::download_percent(processed, total), &message);
            results[index] = Some(result);
        }

        results
            .into_iter()
            .zip(units)
            .map(|(result, unit)| {
                result.unwrap_or_else(|| UnitResult {
                    resolution: Err(ReferenceError::FetchPermanent {
                        url: unit.source_key.clone(),
                        reason: "fetch did not complete".to_string(),
                    }),
                    cache_hit: false,
                    attempts: 0,
                })
            })
            .collect()
    }

    fn replacements(
        &self,
        references: &[ResourceReference],
        plan: &ResolutionPlan,
        results: &[UnitResult],
        store: &LocalStore,
    ) -> Vec<Option<String>> {
        references
            .iter()
            .zip(&plan.assignment)
            .map(|(_, assignment)| {
                let unit = (*assignment)?;
                match &results[unit].resolution {
                    Ok(resolved) => Some(store.href_from(&self.config.entry_file, &resolved.local_path)),
                    Err(_) => match (&plan.units[unit].source, self.config.unresolved) {
                        (Classified::Network(url), UnresolvedPolicy::AbsoluteUrl) => {
                            Some(url.to_string())
                        }
                        _ => None,
                    },
                }
            })
            .collect()
    }
}

async fn resolve_unit(
    unit: &PlannedResource,
    store: &LocalStore,
    fetcher: &ResourceFetcher,
) -> UnitResult {
    if let Some(resolved) = store.cached(unit) {
        return UnitResult {
            resolution: Ok(resolved),
            cache_hit: true,
            attempts: 0,
        };
    }

    let (body, attempts) = match &unit.source {
        Classified::Data(data) => (decoded(fetcher.decode_data(data), &unit.source_key), 0),
        Classified::Network(url) => {
            let report = fetcher.fetch(url).await;
            let attempts = report.attempts;
            (report.into_result(&unit.source_key), attempts)
        }
    };

    let resolution =
        body.and_then(|body| store.store(unit, &body.bytes, body.content_type.as_deref()));
    if let Err(error) = &resolution {
        warn!(source = %unit.source_key, %error, "resource left unresolved");
    }

    UnitResult {
        resolution,
        cache_hit: false,
        attempts,
    }
}

fn decoded(report: FetchReport, source_key: &str) -> Result<FetchedBody, ReferenceError> {
    match report.outcome {
        FetchOutcome::Success(body) => Ok(body),
        FetchOutcome::PermanentFailure(reason) | FetchOutcome::TransientFailure(reason) => {
            Err(ReferenceError::classification(source_key, reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn job(root: &std::path::Path) -> SnapshotJob {
        SnapshotJob::new("https://example.com/page.html", root, SnapshotConfig::default()).unwrap()
    }

    #[test]
    fn test_plan_dedups_by_source_key() {
        let temp_dir = tempdir().unwrap();
        let doc = HtmlDocument::parse(
            r#"<img src="/a.png"><img src="https://example.com/a.png"><img srcset="a.png 1x, /b.png 2x">"#,
        );
        let scanned = scan(&doc);
        let plan = job(temp_dir.path()).plan(&scanned.references);

        assert_eq!(plan.units.len(), 2);
        assert_eq!(plan.assignment, vec![Some(0), Some(0), Some(0), Some(1)]);
        assert!(plan.failures.is_empty());
    }

    #[test]
    fn test_plan_records_malformed_data_uri_as_failure() {
        let temp_dir = tempdir().unwrap();
        let doc = HtmlDocument::parse(r#"<img src="data:image/png;base64"><img src="/ok.png">"#);
        let scanned = scan(&doc);
        let plan = job(temp_dir.path()).plan(&scanned.references);

        assert_eq!(plan.assignment, vec![None, Some(0)]);
        assert_eq!(plan.failures.len(), 1);
        assert!(matches!(
            plan.failures[0].error,
            ReferenceError::Classification { .. }
        ));
    }

    #[tokio::test]
    async fn test_data_uri_only_page_needs_no_network() {
        let temp_dir = tempdir().unwrap();
        let report = job(temp_dir.path())
            .run(r#"<html><body><img src="data:image/png;base64,AAAA"></body></html>"#)
            .await
            .unwrap();

        assert_eq!(report.http_attempts, 0);
        assert_eq!(report.resources.len(), 1);
        let resource = &report.resources[0];
        assert!(resource.local_path.starts_with("resources/images/data_uri_"));
        assert!(resource.local_path.ends_with(".png"));
        assert_eq!(resource.content_type, "image/png");
        assert_eq!(
            std::fs::read(temp_dir.path().join(&resource.local_path)).unwrap(),
            vec![0u8, 0, 0]
        );

        let html = std::fs::read_to_string(report.entry_path).unwrap();
        assert!(html.contains(&format!(r#"src="{}""#, resource.local_path)));
        assert!(html.contains(GENERATOR));
    }
}
