//! Show subcommand
//!
//! Inspect a local `PMTiles` archive.

use std::path::PathBuf;

use bytesize::ByteSize;
use clap::Parser;
use global_mosaic::{Compression, PmTilesReader, TileType};

#[derive(Parser, Debug)]
#[command(about = "Inspect a local archive")]
pub struct Args {
    /// Path to `PMTiles` archive
    #[arg(value_name = "PATH")]
    path: PathBuf,
}

fn format_compression(compression: Compression) -> &'static str {
    match compression {
        Compression::Gzip => "gzip",
        Compression::Brotli => "brotli",
        Compression::Zstd => "zstd",
        Compression::None => "none",
        Compression::Unknown => "unknown",
    }
}

fn format_tile_type(tile_type: TileType) -> &'static str {
    match tile_type {
        TileType::Jpeg => "jpeg",
        other => other.name(),
    }
}

pub fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let size = std::fs::metadata(&args.path)?.len();
    let mut reader = PmTilesReader::open(&args.path)?;
    let header = reader.get_header().clone();

    println!("pmtiles spec version: {}", header.spec_version());
    println!("archive size: {}", ByteSize::b(size));
    println!("tile type: {}", format_tile_type(header.tile_type));
    let bounds = header.get_bounds();
    println!(
        "bounds: (long: {:.6}, lat: {:.6}) (long: {:.6}, lat: {:.6})",
        bounds.left, bounds.bottom, bounds.right, bounds.top
    );
    println!("min zoom: {}", header.min_zoom);
    println!("max zoom: {}", header.max_zoom);
    let center = header.get_center();
    println!(
        "center: (long: {:.6}, lat: {:.6})",
        center.longitude, center.latitude
    );
    println!("center zoom: {}", center.zoom);
    println!("addressed tiles count: {}", header.addressed_tiles());
    println!("tile entries count: {}", header.tile_entries());
    println!("tile contents count: {}", header.tile_contents());
    println!("clustered: {}", header.is_clustered());
    println!(
        "internal compression: {}",
        format_compression(header.internal_compression())
    );
    println!(
        "tile compression: {}",
        format_compression(header.tile_compression)
    );

    let metadata = reader.get_metadata()?;
    if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str::<serde_json::Value>(&metadata) {
        for (key, value) in obj {
            let value_str = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                    "<object...>".to_string()
                }
                _ => value.to_string(),
            };
            println!("{key} {value_str}");
        }
    } else if !metadata.is_empty() {
        println!("Expected metadata as json object but got: {metadata}");
    }

    Ok(())
}
