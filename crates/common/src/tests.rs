use super::*;
use std::io;

#[test]
fn config_defaults_are_sane() {
    let cfg = Config::default();
    assert_eq!(cfg.block_size, 4096);
    assert_eq!(cfg.cache_size, 256);
}

#[test]
fn config_builder_overrides_defaults() {
    let cfg = Config::builder()
        .file_name("store.db")
        .block_size(8192)
        .cache_size(64)
        .build();
    assert_eq!(cfg.file_name, PathBuf::from("store.db"));
    assert_eq!(cfg.block_size, 8192);
    assert_eq!(cfg.cache_size, 64);
}

#[test]
fn bp_error_formats_cleanly() {
    let err = BpError::Corrupt("bad node tag".into());
    assert!(format!("{err}").contains("bad node tag"));
}

#[test]
fn io_error_converts() {
    let e = io::Error::other("oops");
    let err: BpError = e.into();
    assert!(matches!(err, BpError::Io(_)));
}

#[test]
fn invalid_sentinel_matches_spec() {
    assert_eq!(INVALID, 0xdead_beef);
}
