//! CLI definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::Parser;

/// vsmerger - shared VirtualService merger
#[derive(Parser, Debug, Default)]
#[command(name = "vsmerger")]
#[command(version)]
#[command(about = "Merges route fragments from VirtualServiceMerge objects into shared VirtualServices")]
#[command(
    long_about = "vsmerger watches VirtualServiceMerge objects and keeps each referenced VirtualService converged with the union of the fragments declared against it."
)]
pub struct Cli {
    /// Namespace to watch; an empty value watches all namespaces
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory (or single file) of YAML manifests seeding the local cluster
    #[arg(short, long)]
    pub manifests: Option<PathBuf>,

    /// Number of reconcile workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Converge once, print the resulting VirtualServices and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}
