//! CLI contract tests for xbk argument validation.

use clap::error::ErrorKind;
use tempfile::tempdir;
use xbk::Error;

fn expect_error(args: &[&str], expected: Error) {
    let err = xbk::run(args.iter().copied()).expect_err("command should fail");
    let actual = err
        .downcast_ref::<Error>()
        .unwrap_or_else(|| panic!("unexpected error type: {err:?}"));
    match expected {
        Error::Cli(ref expected_msg) => {
            assert!(
                matches!(actual, Error::Cli(msg) if msg == expected_msg),
                "got {actual:?}"
            );
        }
        _ => {
            assert_eq!(
                std::mem::discriminant(actual),
                std::mem::discriminant(&expected)
            );
        }
    }
}

fn clap_error(args: &[&str]) -> ErrorKind {
    xbk::cli::clap_command()
        .try_get_matches_from(args)
        .expect_err("clap should reject the arguments")
        .kind()
}

#[test]
fn subcommands_are_listed() {
    let cmd = xbk::cli::clap_command();
    let names: Vec<&str> = cmd.get_subcommands().map(|c| c.get_name()).collect();
    assert_eq!(names, vec!["backup", "xbstream", "xbcrypt", "apply-delta"]);
}

#[test]
fn backup_needs_exactly_one_destination() {
    assert_eq!(
        clap_error(&["xbk", "backup", "--datadir", "/d"]),
        ErrorKind::MissingRequiredArgument
    );
    assert_eq!(
        clap_error(&["xbk", "backup", "--datadir", "/d", "--target-dir", "/t", "--stream"]),
        ErrorKind::ArgumentConflict
    );
    assert_eq!(
        clap_error(&[
            "xbk",
            "backup",
            "--datadir",
            "/d",
            "--target-dir",
            "/t",
            "--incremental-basedir",
            "/b",
            "--incremental-lsn",
            "5",
        ]),
        ErrorKind::ArgumentConflict
    );
}

#[test]
fn key_options_are_validated() {
    assert_eq!(
        clap_error(&[
            "xbk",
            "xbcrypt",
            "encrypt",
            "--encrypt",
            "AES256",
            "--encrypt-key",
            "k",
            "--encrypt-key-file",
            "/k",
        ]),
        ErrorKind::ArgumentConflict
    );
    assert_eq!(
        clap_error(&["xbk", "xbcrypt", "scramble"]),
        ErrorKind::InvalidValue
    );

    let target = tempdir().unwrap();
    let target = target.path().to_str().unwrap();
    expect_error(
        &[
            "xbk",
            "backup",
            "--datadir",
            "/no/such/datadir",
            "--target-dir",
            target,
            "--encrypt-key",
            "0123456789abcdef",
        ],
        Error::Cli("--encrypt-key needs --encrypt".into()),
    );
    expect_error(
        &[
            "xbk",
            "backup",
            "--datadir",
            "/no/such/datadir",
            "--target-dir",
            target,
            "--encrypt",
            "AES128",
        ],
        Error::Cli("--encrypt needs --encrypt-key or --encrypt-key-file".into()),
    );
    expect_error(
        &["xbk", "xbcrypt", "decrypt", "--encrypt", "AES256", "--encrypt-key", "short"],
        Error::InvalidKey(String::new()),
    );
    expect_error(
        &["xbk", "xbcrypt", "encrypt"],
        Error::Cli("--encrypt is required".into()),
    );
}

#[test]
fn changed_pages_need_an_incremental_backup() {
    let target = tempdir().unwrap();
    expect_error(
        &[
            "xbk",
            "backup",
            "--datadir",
            "/no/such/datadir",
            "--target-dir",
            target.path().to_str().unwrap(),
            "--changed-pages",
            "/no/such/list",
        ],
        Error::Cli("--changed-pages only applies to incremental backups".into()),
    );
}

#[test]
fn backup_of_a_missing_datadir_is_a_config_error() {
    let target = tempdir().unwrap();
    expect_error(
        &[
            "xbk",
            "backup",
            "--datadir",
            "/no/such/datadir",
            "--target-dir",
            target.path().to_str().unwrap(),
        ],
        Error::Config(String::new()),
    );
}

#[test]
fn apply_delta_without_suffix_needs_meta() {
    let dir = tempdir().unwrap();
    let delta = dir.path().join("pages.bin");
    std::fs::write(&delta, b"").unwrap();
    let base = dir.path().join("t.ibd");
    let err = xbk::run([
        "xbk",
        "apply-delta",
        "--base",
        base.to_str().unwrap(),
        "--delta",
        delta.to_str().unwrap(),
    ])
    .expect_err("missing suffix must fail");
    let actual = err
        .downcast_ref::<Error>()
        .expect("should downcast to xbk::Error");
    assert!(matches!(actual, Error::Cli(msg) if msg.contains("pass --meta")));

    // An explicit sidecar that does not exist is a file error.
    expect_error(
        &[
            "xbk",
            "apply-delta",
            "--base",
            base.to_str().unwrap(),
            "--delta",
            delta.to_str().unwrap(),
            "--meta",
            dir.path().join("absent.meta").to_str().unwrap(),
        ],
        Error::FileIo {
            path: String::new(),
            source: std::io::Error::other("absent"),
        },
    );
}
