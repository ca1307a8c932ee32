//! Implementation of `xbk apply-delta`.

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use crate::{
    delta::{self, DeltaMeta, DELTA_SUFFIX, META_SUFFIX},
    Error, Result,
};

#[derive(Debug, Clone, Args)]
pub struct ApplyDeltaArgs {
    /// Tablespace file the pages are written into; created if missing.
    #[arg(long = "base")]
    pub base: PathBuf,

    /// `.delta` file from an incremental backup.
    #[arg(long = "delta")]
    pub delta: PathBuf,

    /// Sidecar with the page size; defaults to the delta path with `.meta`.
    #[arg(long = "meta")]
    pub meta: Option<PathBuf>,
}

pub fn execute(args: ApplyDeltaArgs) -> Result<()> {
    let meta_path = match args.meta {
        Some(path) => path,
        None => {
            let delta = args.delta.to_string_lossy();
            let stem = delta.strip_suffix(DELTA_SUFFIX).ok_or_else(|| {
                Error::Cli(format!(
                    "{} has no {DELTA_SUFFIX} suffix; pass --meta",
                    args.delta.display()
                ))
            })?;
            PathBuf::from(format!("{stem}{META_SUFFIX}"))
        }
    };
    let meta = DeltaMeta::read(&meta_path)?;
    let pages = delta::apply_delta(&args.base, &args.delta, &meta)?;
    info!(base = %args.base.display(), pages, "delta applied");
    Ok(())
}
