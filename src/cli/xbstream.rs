//! Implementation of `xbk xbstream`.

use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
};

use clap::{Args, Subcommand};
use tracing::info;

use crate::{
    datasink::{Datasink, FileDatasink, StdoutDatasink},
    xbstream::{self, ExtractOptions, XbstreamDatasink},
    Error, Result,
};

#[derive(Debug, Clone, Args)]
pub struct XbstreamArgs {
    #[command(subcommand)]
    pub action: XbstreamAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum XbstreamAction {
    /// Pack files into a stream.
    Create {
        /// Write the stream here instead of stdout.
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Payload bytes per chunk.
        #[arg(long = "chunk-size", default_value_t = xbstream::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        /// Store zero-filled 4 KiB blocks as holes.
        #[arg(long = "sparse", default_value_t = false)]
        sparse: bool,
        /// Files to pack, stored under the relative paths given.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Unpack a stream into a directory.
    Extract {
        /// Read the stream from this file instead of stdin.
        #[arg(short = 'i', long = "input")]
        input: Option<PathBuf>,
        /// Directory the files are written under.
        #[arg(short = 'C', long = "directory", default_value = ".")]
        directory: PathBuf,
        /// Skip per-chunk CRC checks.
        #[arg(long = "no-verify", default_value_t = false)]
        no_verify: bool,
    },
    /// Print the files a stream contains.
    List {
        #[arg(short = 'i', long = "input")]
        input: Option<PathBuf>,
    },
}

fn open_input(input: Option<&Path>) -> Result<Box<dyn Read>> {
    match input {
        Some(path) => {
            let file = File::open(path).map_err(|source| Error::FileIo {
                path: path.display().to_string(),
                source,
            })?;
            Ok(Box::new(BufReader::new(file)))
        }
        None => Ok(Box::new(BufReader::new(io::stdin()))),
    }
}

fn stream_name(path: &Path) -> Result<String> {
    let name = path.to_string_lossy().trim_start_matches("./").to_string();
    if name.is_empty() || path.is_absolute() {
        return Err(Error::Cli(format!("{} must be a relative path", path.display())).into());
    }
    Ok(name)
}

/// Pack `files` into one stream written to `dest`.
pub fn create(
    files: &[PathBuf],
    dest: &dyn Datasink,
    chunk_size: usize,
    sparse: bool,
) -> Result<()> {
    let stream = XbstreamDatasink::new(dest, "stream", chunk_size)?;
    let mut buf = vec![0u8; chunk_size.clamp(4096, 1 << 20)];
    for path in files {
        let name = stream_name(path)?;
        let mut src = File::open(path).map_err(|source| Error::FileIo {
            path: path.display().to_string(),
            source,
        })?;
        let mut out = stream.open_file(&name)?;
        loop {
            let n = src.read(&mut buf)?;
            if n == 0 {
                break;
            }
            if sparse {
                out.write_punched(&buf[..n])?;
            } else {
                out.write_data(&buf[..n])?;
            }
        }
        out.finish()?;
    }
    stream.finish()
}

pub fn execute(args: XbstreamArgs) -> Result<()> {
    match args.action {
        XbstreamAction::Create {
            output,
            chunk_size,
            sparse,
            files,
        } => {
            match output {
                Some(path) => create(&files, &FileDatasink::new(path), chunk_size, sparse)?,
                None => create(&files, &StdoutDatasink, chunk_size, sparse)?,
            }
            info!(files = files.len(), "xbstream created");
            Ok(())
        }
        XbstreamAction::Extract {
            input,
            directory,
            no_verify,
        } => {
            let reader = open_input(input.as_deref())?;
            let opts = ExtractOptions {
                verify_checksums: !no_verify,
            };
            xbstream::extract(reader, &directory, &opts)?;
            Ok(())
        }
        XbstreamAction::List { input } => {
            let reader = open_input(input.as_deref())?;
            let mut out = io::stdout().lock();
            for path in xbstream::list(reader)? {
                writeln!(out, "{path}")?;
            }
            Ok(())
        }
    }
}
