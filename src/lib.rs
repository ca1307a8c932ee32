use thiserror::Error;

pub mod backup;
pub mod changed;
pub mod cli;
pub mod compress;
pub mod copy;
pub mod datasink;
pub mod delta;
pub mod logging;
pub mod page;
pub mod pool;
pub mod redo;
pub mod xbcrypt;
pub mod xbstream;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("corrupted page {page_no} in {path} at offset {offset}")]
    Corruption {
        path: String,
        offset: u64,
        page_no: u64,
    },
    #[error("invalid {what} at offset {offset}: {reason}")]
    Format {
        what: &'static str,
        offset: u64,
        reason: String,
    },
    #[error("failed to decrypt chunk {chunk}: {reason} (likely wrong key)")]
    DecryptFailed { chunk: u64, reason: String },
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
    #[error("worker failed: {0}")]
    Worker(String),
    #[error("redo log corruption at lsn {lsn}: {reason}")]
    LogCorruption { lsn: u64, reason: String },
    #[error(
        "redo log was overwritten before it could be copied: last checkpoint at lsn \
         {checkpoint_lsn}, copied up to lsn {scanned_lsn}"
    )]
    LogOverwritten { checkpoint_lsn: u64, scanned_lsn: u64 },
    #[error("backup aborted: {0}")]
    Aborted(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error("I/O error on {path}: {source}")]
    FileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    logging::init_logging(cli_args.log_format)?;
    cli::dispatch(cli_args)
}
