use std::fs;

use tempfile::tempdir;
use xbk::{
    backup::{BackupType, Checkpoints, CopyMode, Manifest, CHECKPOINTS_FILE},
    compress::CompressAlgo,
    copy::{CopyReport, FileOutcome, FileReport},
    xbcrypt::CryptAlgo,
    Error,
};

fn report() -> CopyReport {
    CopyReport {
        files: vec![
            FileReport {
                rel_path: "db/a.ibd".into(),
                space_id: Some(5),
                outcome: FileOutcome::Copied,
                pages_read: 6,
                bytes_written: 6 * 16384,
                retries: 1,
            },
            FileReport {
                rel_path: "db/gone.ibd".into(),
                space_id: None,
                outcome: FileOutcome::Skipped,
                pages_read: 0,
                bytes_written: 0,
                retries: 0,
            },
        ],
    }
}

#[test]
fn checkpoints_text_round_trips() -> xbk::Result<()> {
    let cp = Checkpoints {
        backup_type: BackupType::Incremental,
        from_lsn: 1000,
        to_lsn: 5000,
        last_lsn: 5120,
        compact: false,
    };
    let text = cp.to_text();
    assert!(text.starts_with("backup_type = incremental\nfrom_lsn = 1000\n"));
    assert_eq!(Checkpoints::parse(&text)?, cp);
    Ok(())
}

#[test]
fn checkpoints_tolerate_unknown_keys_and_missing_last_lsn() -> xbk::Result<()> {
    let cp = Checkpoints::parse(
        "backup_type = full-backuped\nfrom_lsn = 0\nto_lsn = 42\nflushed_lsn = 7\ncompact = 1\n",
    )?;
    assert_eq!(cp.backup_type, BackupType::FullBackuped);
    assert_eq!(cp.last_lsn, 42);
    assert!(cp.compact);
    Ok(())
}

#[test]
fn malformed_checkpoints_are_format_errors() {
    for text in [
        "backup_type = weird\nfrom_lsn = 0\nto_lsn = 1\n",
        "backup_type = incremental\nfrom_lsn = x\nto_lsn = 1\n",
        "from_lsn = 0\nto_lsn = 1\n",
    ] {
        let err = Checkpoints::parse(text).unwrap_err();
        assert!(
            matches!(err.downcast_ref::<Error>(), Some(Error::Format { .. })),
            "{text:?} gave {err}"
        );
    }
}

#[test]
fn incremental_base_reads_to_lsn_from_directory() -> xbk::Result<()> {
    let dir = tempdir()?;
    let cp = Checkpoints {
        backup_type: BackupType::FullBackuped,
        from_lsn: 0,
        to_lsn: 777,
        last_lsn: 800,
        compact: false,
    };
    fs::write(dir.path().join(CHECKPOINTS_FILE), cp.to_text())?;
    assert_eq!(Checkpoints::incremental_base(dir.path())?, 777);

    let empty = tempdir()?;
    assert!(Checkpoints::incremental_base(empty.path()).is_err());
    Ok(())
}

#[test]
fn manifest_lists_copied_and_skipped_files() -> xbk::Result<()> {
    let cp = Checkpoints {
        backup_type: BackupType::FullBackuped,
        from_lsn: 0,
        to_lsn: 9000,
        last_lsn: 9100,
        compact: false,
    };
    let mut manifest = Manifest::new(CopyMode::Full, &cp, &report());
    manifest.compression = Some(CompressAlgo::Zstd);
    manifest.encryption = Some(CryptAlgo::Aes256);

    let json = manifest.to_json()?;
    let value: serde_json::Value = serde_json::from_slice(&json)?;
    assert_eq!(value["mode"], "full");
    assert_eq!(value["compression"], "zstd");
    assert_eq!(value["encryption"], "AES256");
    assert_eq!(value["files"][1]["skipped"], true);
    assert_eq!(value["files"][0]["bytes"], 6 * 16384);

    assert_eq!(Manifest::from_json(&json)?, manifest);
    Ok(())
}

#[test]
fn manifest_omits_unset_codecs() -> xbk::Result<()> {
    let cp = Checkpoints {
        backup_type: BackupType::Incremental,
        from_lsn: 1,
        to_lsn: 2,
        last_lsn: 2,
        compact: false,
    };
    let manifest = Manifest::new(CopyMode::Incremental, &cp, &CopyReport::default());
    let value: serde_json::Value = serde_json::from_slice(&manifest.to_json()?)?;
    assert!(value.get("compression").is_none());
    assert!(value.get("encryption").is_none());
    assert_eq!(value["mode"], "incremental");
    assert_eq!(value["files"].as_array().map(Vec::len), Some(0));
    Ok(())
}
