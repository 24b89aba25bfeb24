use assert_cmd::cargo::cargo_bin_cmd;

#[test]
fn show_missing_file() {
    cargo_bin_cmd!("global-mosaic")
        .args(["show", "nonexistent.pmtiles"])
        .assert()
        .failure();
}

#[test]
fn show_rejects_non_archive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.pmtiles");
    std::fs::write(&path, vec![0_u8; 200]).unwrap();

    cargo_bin_cmd!("global-mosaic")
        .arg("show")
        .arg(&path)
        .assert()
        .failure();
}
