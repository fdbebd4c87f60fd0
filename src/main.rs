//! # vsmerger - entry point
//!
//! ## Startup Sequence
//!
//! 1. **Tracing** - `RUST_LOG`-driven filter, text or JSON output
//! 2. **Settings** - TOML file (optional) with CLI overrides
//! 3. **Cluster** - in-memory stores seeded from YAML manifests
//! 4. **Controller** - worker pool wired to both watch origins
//!
//! ## Modes
//!
//! By default the controller runs until Ctrl+C. With `--once` it converges
//! the seeded objects, prints every VirtualService as YAML and exits.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use vsmerger_core::{load_manifest_file, Manifest, ResultExt, TargetResource, TARGET_KIND};
use vsmerger_events::{InMemoryEventRecorder, TracingEventRecorder};
use vsmerger_reconciler::{InMemoryCluster, MergeController, RouteListMerge};

use crate::cli::Cli;
use crate::config::Settings;

const TARGET_API_VERSION: &str = "networking.istio.io/v1alpha3";

/// Namespace given to manifests without one when all namespaces are watched.
const FALLBACK_NAMESPACE: &str = "default";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = Settings::resolve(&cli).context("Failed to load settings")?;
    info!(
        namespace = %settings.namespace,
        workers = settings.workers,
        once = cli.once,
        "vsmerger starting"
    );

    // One-shot runs converge from the initial resync; no watch needed.
    let (cluster, sources) = if cli.once {
        (InMemoryCluster::new(), None)
    } else {
        let (cluster, sources) = InMemoryCluster::with_watch();
        (cluster, Some(sources))
    };

    if let Some(path) = &cli.manifests {
        let seeded = seed_cluster(&cluster, path, &settings.namespace).await?;
        info!(objects = seeded, path = %path.display(), "Seeded cluster from manifests");
    }

    let controller = Arc::new(
        MergeController::builder()
            .with_cluster(&cluster)
            .with_recorder(Arc::new(TracingEventRecorder::new(
                InMemoryEventRecorder::with_capacity(settings.recorded_events),
            )))
            .with_patcher(Arc::new(RouteListMerge::with_fields(
                settings.route_fields.iter().cloned(),
            )))
            .with_config(settings.controller_config())
            .build()
            .context("Invalid controller configuration")?,
    );
    if let Some(sources) = sources {
        controller
            .configure(sources)
            .context("Failed to register event sources")?;
    }

    let runner = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run().await })
    };

    if cli.once {
        if !controller.wait_idle(settings.idle_timeout()).await {
            warn!(
                timeout_secs = settings.idle_timeout().as_secs(),
                "Queue did not drain before timeout"
            );
        }
    } else {
        wait_for_shutdown_signal().await;
    }

    controller.stop();
    runner
        .await
        .context("Controller task panicked")?
        .context("Controller failed")?;

    if cli.once {
        print_targets(&cluster.targets.all().await)?;
    }

    info!("vsmerger stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Manifest files under `path`, or `path` itself when it is a file.
fn manifest_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    for extension in ["yaml", "yml"] {
        let pattern = path.join(format!("*.{extension}"));
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern)
            .with_context(|| format!("Invalid manifest pattern {pattern}"))?;
        files.extend(entries.filter_map(|entry| match entry {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable manifest entry");
                None
            }
        }));
    }
    files.sort();
    Ok(files)
}

/// Apply every manifest under `path` to the cluster; returns the object count.
///
/// Files that fail to parse are logged and skipped.
async fn seed_cluster(cluster: &InMemoryCluster, path: &Path, namespace: &str) -> Result<usize> {
    let default_namespace = if namespace.is_empty() {
        FALLBACK_NAMESPACE
    } else {
        namespace
    };

    let files = manifest_files(path)?;
    if files.is_empty() {
        warn!(path = %path.display(), "No manifests found");
    }

    let mut count = 0usize;
    for file in files {
        let context = format!("Skipping manifest file {}", file.display());
        let Some(manifests) = load_manifest_file(&file, default_namespace).into_option_logged(&context)
        else {
            continue;
        };
        for manifest in manifests {
            match manifest {
                Manifest::Target(target) => {
                    cluster.targets.apply(target).await;
                }
                Manifest::Merge(spec) => {
                    cluster.specs.apply(spec).await;
                }
            }
            count = count.saturating_add(1);
        }
    }
    Ok(count)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TargetDocument<'a> {
    api_version: &'static str,
    kind: &'static str,
    #[serde(flatten)]
    target: &'a TargetResource,
}

fn print_targets(targets: &[TargetResource]) -> Result<()> {
    let mut sorted: Vec<&TargetResource> = targets.iter().collect();
    sorted.sort_by_key(|t| t.key());

    for target in sorted {
        let document = TargetDocument {
            api_version: TARGET_API_VERSION,
            kind: TARGET_KIND,
            target,
        };
        let yaml = serde_yaml::to_string(&document)
            .with_context(|| format!("Failed to render {}", target.key()))?;
        println!("---\n{}", yaml.trim_end());
    }
    Ok(())
}

/// Wait for Ctrl+C.
async fn wait_for_shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown"),
        Err(err) => error!("Failed to listen for shutdown signal: {}", err),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use std::fs;
    use vsmerger_core::ObjectKey;

    const MANIFESTS: &str = r"
apiVersion: networking.istio.io/v1alpha3
kind: VirtualService
metadata:
  name: shared
spec:
  hosts: [reviews]
  http:
    - name: default
---
apiVersion: istiomerger.monime.sl/v1alpha1
kind: VirtualServiceMerge
metadata:
  name: products
spec:
  target:
    name: shared
  patch:
    http:
      - name: products
";

    #[tokio::test]
    async fn seeds_cluster_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.yaml"), MANIFESTS).unwrap();
        fs::write(dir.path().join("broken.yml"), "kind: [").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let cluster = InMemoryCluster::new();
        let count = seed_cluster(&cluster, dir.path(), "").await.unwrap();

        assert_eq!(count, 2);
        assert!(cluster
            .targets
            .snapshot(&ObjectKey::new(FALLBACK_NAMESPACE, "shared"))
            .await
            .is_some());
        assert!(cluster
            .specs
            .snapshot(&ObjectKey::new(FALLBACK_NAMESPACE, "products"))
            .await
            .is_some());
    }

    #[test]
    fn single_file_is_its_own_manifest_set() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("one.yaml");
        fs::write(&file, MANIFESTS).unwrap();

        assert_eq!(manifest_files(&file).unwrap(), vec![file]);
    }

    #[tokio::test]
    async fn once_mode_converges_seeded_objects() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.yaml"), MANIFESTS).unwrap();
        let cluster = InMemoryCluster::new();
        seed_cluster(&cluster, dir.path(), "mesh").await.unwrap();

        let settings = Settings::default();
        let controller = Arc::new(
            MergeController::builder()
                .with_cluster(&cluster)
                .with_config(settings.controller_config())
                .build()
                .unwrap(),
        );
        let runner = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run().await })
        };
        // The default namespace scope differs from "mesh"; nothing is in scope.
        assert!(controller.wait_idle(settings.idle_timeout()).await);
        controller.stop();
        runner.await.unwrap().unwrap();

        let target = cluster
            .targets
            .state(&ObjectKey::new("mesh", "shared"))
            .await
            .unwrap();
        assert_eq!(target["http"].as_array().unwrap().len(), 1);

        let scoped = Settings {
            namespace: "mesh".to_string(),
            ..Settings::default()
        };
        let controller = Arc::new(
            MergeController::builder()
                .with_cluster(&cluster)
                .with_config(scoped.controller_config())
                .build()
                .unwrap(),
        );
        let runner = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run().await })
        };
        assert!(controller.wait_idle(scoped.idle_timeout()).await);
        controller.stop();
        runner.await.unwrap().unwrap();

        let target = cluster
            .targets
            .state(&ObjectKey::new("mesh", "shared"))
            .await
            .unwrap();
        let names: Vec<&str> = target["http"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|r| r["name"].as_str())
            .collect();
        assert_eq!(names, vec!["products", "default"]);
    }

    #[test]
    fn printed_targets_carry_type_meta() {
        let target = TargetResource::new("mesh", "shared", serde_json::json!({"hosts": ["a"]}));
        let document = TargetDocument {
            api_version: TARGET_API_VERSION,
            kind: TARGET_KIND,
            target: &target,
        };
        let yaml = serde_yaml::to_string(&document).unwrap();
        assert!(yaml.contains("apiVersion: networking.istio.io/v1alpha3"));
        assert!(yaml.contains("kind: VirtualService"));
        assert!(yaml.contains("name: shared"));
    }
}
