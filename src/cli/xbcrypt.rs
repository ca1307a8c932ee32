//! Implementation of `xbk xbcrypt`.

use std::{
    fs::File,
    io::{self, Read},
    path::PathBuf,
    sync::Arc,
};

use clap::{Args, ValueEnum};
use tracing::info;

use crate::{
    datasink::{Datasink, FileDatasink, StdoutDatasink},
    xbcrypt::{CryptOptions, DecryptDatasink, EncryptDatasink, Version},
    Error, Result,
};

use super::EncryptKeyArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum XbcryptMode {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, Args)]
pub struct XbcryptArgs {
    #[arg(value_enum)]
    pub mode: XbcryptMode,

    /// Read from this file instead of stdin.
    #[arg(short = 'i', long = "input")]
    pub input: Option<PathBuf>,

    /// Write to this file instead of stdout.
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,

    /// Chunk format written when encrypting.
    #[arg(long = "format-version", value_enum, default_value = "3")]
    pub version: Version,

    #[command(flatten)]
    pub key: EncryptKeyArgs,
}

/// Push everything from `input` through one file opened on `sink`.
pub fn pipe(mut input: impl Read, sink: &dyn Datasink, name: &str) -> Result<u64> {
    let mut out = sink.open(name)?;
    let mut buf = vec![0u8; 1 << 20];
    let mut total = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write(&buf[..n])?;
        total += n as u64;
    }
    out.close()?;
    sink.finish()?;
    Ok(total)
}

pub fn execute(args: XbcryptArgs) -> Result<()> {
    let key = args.key.require()?;
    let opts = CryptOptions {
        threads: args.key.threads,
        chunk_size: args.key.chunk_size,
        version: args.version,
    };
    let dest: Arc<dyn Datasink> = match &args.output {
        Some(path) => Arc::new(FileDatasink::new(path)),
        None => Arc::new(StdoutDatasink),
    };
    let sink: Box<dyn Datasink> = match args.mode {
        XbcryptMode::Encrypt => Box::new(EncryptDatasink::new(dest, key, opts)),
        XbcryptMode::Decrypt => Box::new(DecryptDatasink::new(dest, key, opts)),
    };

    let bytes = match &args.input {
        Some(path) => {
            let file = File::open(path).map_err(|source| Error::FileIo {
                path: path.display().to_string(),
                source,
            })?;
            pipe(file, sink.as_ref(), "input")?
        }
        None => pipe(io::stdin().lock(), sink.as_ref(), "input")?,
    };
    info!(mode = ?args.mode, bytes, "xbcrypt done");
    Ok(())
}
