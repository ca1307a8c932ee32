//! Command-line front end; one module per subcommand.

use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};

use crate::{
    logging::LogFormat,
    xbcrypt::{CryptAlgo, CryptKey},
    Error, Result,
};

pub mod apply_delta;
pub mod backup;
pub mod xbcrypt;
pub mod xbstream;

#[derive(Debug, Clone)]
pub enum Command {
    Backup(backup::BackupArgs),
    Xbstream(xbstream::XbstreamArgs),
    Xbcrypt(xbcrypt::XbcryptArgs),
    ApplyDelta(apply_delta::ApplyDeltaArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub log_format: LogFormat,
    pub command: Command,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Human,
            command: Command::None,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Backup(b) => backup::execute(b),
        Command::Xbstream(x) => xbstream::execute(x),
        Command::Xbcrypt(x) => xbcrypt::execute(x),
        Command::ApplyDelta(a) => apply_delta::execute(a),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(name = "xbk", version, about = "Online physical backup for InnoDB tablespaces")]
struct Cli {
    /// Format of log lines written to stderr.
    #[arg(long = "log-format", value_enum, default_value = "human", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Copy a running server's tablespaces and redo log into a target directory or stream.
    Backup(backup::BackupArgs),
    /// Create, extract or list xbstream archives.
    Xbstream(xbstream::XbstreamArgs),
    /// Encrypt or decrypt a file in the xbcrypt chunk format.
    Xbcrypt(xbcrypt::XbcryptArgs),
    /// Merge an incremental `.delta` file into its base tablespace.
    ApplyDelta(apply_delta::ApplyDeltaArgs),
}

/// Key options shared by every command that encrypts or decrypts.
#[derive(Debug, Clone, Args, Default)]
pub struct EncryptKeyArgs {
    /// Cipher used for xbcrypt chunks.
    #[arg(long = "encrypt", value_enum)]
    pub algo: Option<CryptAlgo>,

    /// Literal key; its length must match the cipher.
    #[arg(long = "encrypt-key", conflicts_with = "key_file")]
    pub key: Option<String>,

    /// File holding the key; one trailing newline is ignored.
    #[arg(long = "encrypt-key-file")]
    pub key_file: Option<PathBuf>,

    /// Worker threads for the cipher pool.
    #[arg(long = "encrypt-threads", default_value_t = 1)]
    pub threads: usize,

    /// Plaintext bytes per xbcrypt chunk.
    #[arg(long = "encrypt-chunk-size", default_value_t = crate::xbcrypt::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
}

impl EncryptKeyArgs {
    /// `None` when no cipher was requested.
    pub fn load(&self) -> Result<Option<CryptKey>> {
        let Some(algo) = self.algo else {
            if self.key.is_some() || self.key_file.is_some() {
                return Err(Error::Cli("--encrypt-key needs --encrypt".into()).into());
            }
            return Ok(None);
        };
        let key = match (&self.key, &self.key_file) {
            (Some(key), None) => CryptKey::new(algo, key.as_bytes())?,
            (None, Some(path)) => CryptKey::from_file(algo, path)?,
            _ => {
                return Err(
                    Error::Cli("--encrypt needs --encrypt-key or --encrypt-key-file".into()).into(),
                )
            }
        };
        Ok(Some(key))
    }

    pub fn require(&self) -> Result<CryptKey> {
        self.load()?
            .ok_or_else(|| Error::Cli("--encrypt is required".into()).into())
    }
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let command = match cli.command {
        Some(Subcommands::Backup(args)) => Command::Backup(args),
        Some(Subcommands::Xbstream(args)) => Command::Xbstream(args),
        Some(Subcommands::Xbcrypt(args)) => Command::Xbcrypt(args),
        Some(Subcommands::ApplyDelta(args)) => Command::ApplyDelta(args),
        None => Command::None,
    };

    Ok(CliArgs {
        log_format: cli.log_format,
        command,
    })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
