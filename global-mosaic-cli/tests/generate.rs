use std::path::Path;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

const ITEMS: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {
      "type": "Feature", "id": "lagos", "collection": "openaerialmap",
      "geometry": {"type": "Polygon", "coordinates": [[[3.0,6.0],[4.0,6.0],[4.0,7.0],[3.0,7.0],[3.0,6.0]]]},
      "properties": {"datetime": "2023-03-01T00:00:00Z"}
    }
  ]
}"#;

/// An item without geometry next to a valid one.
const ITEMS_WITH_BROKEN_ITEM: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {
      "type": "Feature", "id": "lagos", "collection": "openaerialmap",
      "geometry": {"type": "Polygon", "coordinates": [[[3.0,6.0],[4.0,6.0],[4.0,7.0],[3.0,7.0],[3.0,6.0]]]},
      "properties": {}
    },
    {"type": "Feature", "id": "broken", "geometry": null, "properties": {}}
  ]
}"#;

fn global_mosaic() -> Command {
    let mut cmd = cargo_bin_cmd!("global-mosaic");
    for var in [
        "COLLECTION",
        "CATALOG",
        "PG_DSN",
        "OUTPUT_PM",
        "TEST_MODE",
        "ZOOM_MIN",
        "ZOOM_MAX",
        "IMAGERY_ZOOM",
        "S3_BUCKET",
        "S3_KEY",
        "S3_ACCESS_KEY",
        "S3_SECRET_KEY",
        "TILE_SIZE",
        "ERROR_LOG",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn coverage_run(catalog: &Path, output: &Path) -> Command {
    let mut cmd = global_mosaic();
    cmd.arg("generate")
        .arg("--catalog")
        .arg(catalog)
        .arg("--output")
        .arg(output)
        .args(["--zoom-max", "2", "--strategy", "coverage"]);
    cmd
}

#[test]
fn generates_coverage_archive() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("items.geojson");
    std::fs::write(&catalog, ITEMS).unwrap();
    let output = dir.path().join("out").join("mosaic.pmtiles");

    coverage_run(&catalog, &output)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));
    assert!(output.exists());
    assert!(!dir.path().join("out").join("mosaic.pmtiles.partial").exists());

    global_mosaic()
        .arg("show")
        .arg(&output)
        .assert()
        .success()
        .stdout(
            predicate::str::contains("tile type: png")
                .and(predicate::str::contains("max zoom: 2"))
                .and(predicate::str::contains("tile compression: none"))
                .and(predicate::str::contains("clustered: false")),
        );
}

#[test]
fn existing_output_skips_generation() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("items.geojson");
    std::fs::write(&catalog, ITEMS).unwrap();
    let output = dir.path().join("mosaic.pmtiles");
    std::fs::write(&output, b"previous run").unwrap();

    coverage_run(&catalog, &output)
        .assert()
        .success()
        .stderr(predicate::str::contains("skipping generation"));
    assert_eq!(std::fs::read(&output).unwrap(), b"previous run");
}

#[test]
fn missing_catalog_fails() {
    let dir = tempfile::tempdir().unwrap();
    coverage_run(&dir.path().join("nope.geojson"), &dir.path().join("out.pmtiles"))
        .assert()
        .failure();
    assert!(!dir.path().join("out.pmtiles").exists());
}

#[test]
fn empty_catalog_fails() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("items.geojson");
    std::fs::write(&catalog, r#"{"type": "FeatureCollection", "features": []}"#).unwrap();

    coverage_run(&catalog, &dir.path().join("out.pmtiles"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("NoFootprints"));
}

#[test]
fn no_catalog_configured_fails() {
    let dir = tempfile::tempdir().unwrap();
    global_mosaic()
        .arg("generate")
        .arg("--output")
        .arg(dir.path().join("out.pmtiles"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("--catalog"));
}

#[test]
fn bucket_without_credentials_fails_before_rendering() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("items.geojson");
    std::fs::write(&catalog, ITEMS).unwrap();
    let output = dir.path().join("out.pmtiles");

    coverage_run(&catalog, &output)
        .args(["--s3-bucket", "mosaics"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("secret key"));
    assert!(!output.exists());
}

#[test]
fn inverted_zoom_range_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("items.geojson");
    std::fs::write(&catalog, ITEMS).unwrap();

    coverage_run(&catalog, &dir.path().join("out.pmtiles"))
        .args(["--zoom-min", "3"])
        .assert()
        .failure();
}

#[test]
fn no_args_shows_help() {
    global_mosaic()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn warnings_go_to_the_error_log() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("items.geojson");
    std::fs::write(&catalog, ITEMS_WITH_BROKEN_ITEM).unwrap();
    let error_log = dir.path().join("global_mosaic_error.log");

    coverage_run(&catalog, &dir.path().join("out.pmtiles"))
        .arg("--error-log")
        .arg(&error_log)
        .assert()
        .success();

    let logged = std::fs::read_to_string(&error_log).unwrap();
    assert!(logged.contains("Skipping catalog item"), "{logged}");
    assert!(logged.contains("broken"), "{logged}");
    assert!(!logged.contains("Found 1 items"), "{logged}");
}

#[test]
fn clean_run_leaves_error_log_empty() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("items.geojson");
    std::fs::write(&catalog, ITEMS).unwrap();
    let error_log = dir.path().join("errors.log");

    coverage_run(&catalog, &dir.path().join("out.pmtiles"))
        .arg("--error-log")
        .arg(&error_log)
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&error_log).unwrap(), "");
}

#[test]
fn oversized_tiles_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = dir.path().join("items.geojson");
    std::fs::write(&catalog, ITEMS).unwrap();
    let output = dir.path().join("out.pmtiles");

    coverage_run(&catalog, &output)
        .args(["--tile-size", "100000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tile size"));
    assert!(!output.exists());
}

#[test]
fn every_flag_has_help() {
    global_mosaic()
        .args(["generate", "--help"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Lowest zoom level rendered")
                .and(predicate::str::contains("Highest zoom level rendered"))
                .and(predicate::str::contains("Worker threads"))
                .and(predicate::str::contains("Tile edge length in pixels"))
                .and(predicate::str::contains("S3 host name or URL"))
                .and(predicate::str::contains("S3 signing region"))
                .and(predicate::str::contains("File collecting warnings and errors")),
        );
}
