use std::{
    fmt,
    path::Path,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    compress::CompressAlgo,
    copy::{CopyReport, FileOutcome},
    xbcrypt::CryptAlgo,
    Error, Result,
};

/// Name of the LSN summary written next to the data files.
pub const CHECKPOINTS_FILE: &str = "xtrabackup_checkpoints";
pub const MANIFEST_FILE: &str = "backup_manifest.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackupType {
    /// A full copy, not yet prepared.
    FullBackuped,
    Incremental,
    /// Prepared and ready to restore.
    FullPrepared,
    LogApplied,
}

impl BackupType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::FullBackuped => "full-backuped",
            BackupType::Incremental => "incremental",
            BackupType::FullPrepared => "full-prepared",
            BackupType::LogApplied => "log-applied",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "full-backuped" => Ok(BackupType::FullBackuped),
            "incremental" => Ok(BackupType::Incremental),
            "full-prepared" => Ok(BackupType::FullPrepared),
            "log-applied" => Ok(BackupType::LogApplied),
            other => Err(Error::Format {
                what: "checkpoints file",
                offset: 0,
                reason: format!("unknown backup_type {other:?}"),
            }
            .into()),
        }
    }
}

/// Contents of `xtrabackup_checkpoints`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoints {
    pub backup_type: BackupType,
    /// Baseline LSN; 0 for full backups.
    pub from_lsn: u64,
    /// Checkpoint LSN when the copy ended.
    pub to_lsn: u64,
    /// End of the copied redo log.
    pub last_lsn: u64,
    pub compact: bool,
}

impl Checkpoints {
    pub fn to_text(&self) -> String {
        format!(
            "backup_type = {}\nfrom_lsn = {}\nto_lsn = {}\nlast_lsn = {}\ncompact = {}\n",
            self.backup_type,
            self.from_lsn,
            self.to_lsn,
            self.last_lsn,
            u8::from(self.compact)
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut backup_type = None;
        let mut from_lsn = None;
        let mut to_lsn = None;
        let mut last_lsn = None;
        let mut compact = false;

        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            let lsn = || {
                value.parse::<u64>().map_err(|_| Error::Format {
                    what: "checkpoints file",
                    offset: 0,
                    reason: format!("bad value for {key}: {value:?}"),
                })
            };
            match key {
                "backup_type" => backup_type = Some(value.parse::<BackupType>()?),
                "from_lsn" => from_lsn = Some(lsn()?),
                "to_lsn" => to_lsn = Some(lsn()?),
                "last_lsn" => last_lsn = Some(lsn()?),
                "compact" => compact = value == "1",
                _ => {}
            }
        }

        match (backup_type, from_lsn, to_lsn) {
            (Some(backup_type), Some(from_lsn), Some(to_lsn)) => Ok(Self {
                backup_type,
                from_lsn,
                to_lsn,
                last_lsn: last_lsn.unwrap_or(to_lsn),
                compact,
            }),
            _ => Err(Error::Format {
                what: "checkpoints file",
                offset: 0,
                reason: "backup_type, from_lsn and to_lsn are required".into(),
            }
            .into()),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "reading checkpoints");
        let text = std::fs::read_to_string(path).map_err(|source| Error::FileIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Baseline for an incremental backup on top of the backup in `dir`.
    pub fn incremental_base(dir: &Path) -> Result<u64> {
        Ok(Self::read(&dir.join(CHECKPOINTS_FILE))?.to_lsn)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    Full,
    Incremental,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    pub path: String,
    pub space_id: Option<u32>,
    pub pages: u64,
    pub bytes: u64,
    pub skipped: bool,
}

/// JSON summary of a finished backup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub backup_id: Uuid,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub mode: CopyMode,
    pub from_lsn: u64,
    pub to_lsn: u64,
    pub last_lsn: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressAlgo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<CryptAlgo>,
    pub streamed: bool,
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    pub fn new(mode: CopyMode, checkpoints: &Checkpoints, report: &CopyReport) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            backup_id: Uuid::new_v4(),
            created_at,
            mode,
            from_lsn: checkpoints.from_lsn,
            to_lsn: checkpoints.to_lsn,
            last_lsn: checkpoints.last_lsn,
            compression: None,
            encryption: None,
            streamed: false,
            files: report
                .files
                .iter()
                .map(|f| ManifestFile {
                    path: f.rel_path.clone(),
                    space_id: f.space_id,
                    pages: f.pages_read,
                    bytes: f.bytes_written,
                    skipped: f.outcome == FileOutcome::Skipped,
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
