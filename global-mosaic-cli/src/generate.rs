//! Generate subcommand
//!
//! Loads footprints from a catalog, renders the archive and hands it to object storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use global_mosaic::cache::RenderCache;
use global_mosaic::catalog::{Catalog, GeoJsonCatalog};
use global_mosaic::coverage::DEFAULT_COVERAGE_COLOR;
use global_mosaic::fetch::{HttpTileClient, RemoteFetch, UrlTemplate};
use global_mosaic::footprint::Footprint;
use global_mosaic::mosaic::{DirectMosaic, MosaicConfig};
use global_mosaic::pipeline::FetchConfig;
use global_mosaic::raster::TileDirSource;
use global_mosaic::render::{RenderPolicy, RenderStrategy};
use global_mosaic::upload::{
    ArchiveUploader, DEFAULT_S3_ENDPOINT, DEFAULT_S3_REGION, PMTILES_CONTENT_TYPE, S3Config,
    S3Uploader, upload_error_log,
};
use global_mosaic::{
    BoundingBox, MosaicError, MosaicResult, Pipeline, PipelineConfig, PmTilesWriter, RunSummary,
    TileFormat,
};
use tokio_util::sync::CancellationToken;

/// Area rendered when `TEST_MODE` is set.
const TEST_MODE_BBOX: BoundingBox = BoundingBox {
    min_lon: -20.0,
    min_lat: 0.0,
    max_lon: 10.0,
    max_lat: 30.0,
};

#[derive(Parser, Debug)]
#[command(about = "Render coverage and imagery tiles of a collection into an archive")]
pub struct Args {
    /// Imagery collection to mosaic
    #[arg(long, env = "COLLECTION", default_value = "openaerialmap")]
    collection: String,

    /// GeoJSON `FeatureCollection` or STAC `ItemCollection` with the footprints
    #[arg(long, env = "CATALOG", value_name = "PATH")]
    catalog: Option<PathBuf>,

    /// `PgSTAC` connection string, used when no catalog file is given
    #[arg(long, env = "PG_DSN")]
    pg_dsn: Option<String>,

    /// Output archive. Generation is skipped if it already exists
    #[arg(long, env = "OUTPUT_PM", default_value = "/app/output/global-mosaic.pmtiles")]
    output: PathBuf,

    /// Regenerate even if the output archive already exists
    #[arg(long)]
    overwrite: bool,

    /// Only render a small area around West Africa
    #[arg(long, env = "TEST_MODE", value_parser = clap::builder::BoolishValueParser::new())]
    test_mode: bool,

    /// Area to render as `west,south,east,north`, overriding `--test-mode`
    #[arg(long, allow_hyphen_values = true)]
    bbox: Option<BoundingBox>,

    /// Lowest zoom level rendered
    #[arg(long, env = "ZOOM_MIN", default_value_t = 0)]
    zoom_min: u8,

    /// Highest zoom level rendered
    #[arg(long, env = "ZOOM_MAX", default_value_t = 14)]
    zoom_max: u8,

    /// First zoom rendered with imagery instead of coverage
    #[arg(long, env = "IMAGERY_ZOOM", default_value_t = 11)]
    imagery_zoom: u8,

    /// How imagery zooms are rendered: fetch, mosaic or coverage
    #[arg(long, default_value = "fetch")]
    strategy: RenderStrategy,

    /// Tile URL with `{collection}`, `{z}`, `{x}` and `{y}` placeholders
    #[arg(long, env = "TILE_URL_TEMPLATE", default_value_t = UrlTemplate::default().as_str().to_string())]
    tile_url_template: String,

    /// Worker threads, used to derive the default concurrency
    #[arg(long, env = "THREADS", default_value_t = 16)]
    threads: usize,

    /// Renders in flight per thread
    #[arg(long, env = "BATCH_FACTOR", default_value_t = 5)]
    batch_factor: usize,

    /// Maximum renders in flight, defaults to `max(threads * batch_factor, 16)`
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-request timeout in seconds
    #[arg(long, env = "HTTP_TIMEOUT", default_value_t = 30)]
    http_timeout: u64,

    /// Retries after a failed tile request
    #[arg(long, env = "RETRIES", default_value_t = 2)]
    retries: u32,

    /// Tile edge length in pixels, at most 4096
    #[arg(long, env = "TILE_SIZE", default_value_t = 256)]
    tile_size: u32,

    /// Tile image format: png or webp
    #[arg(long, default_value = "png")]
    format: TileFormat,

    /// Log progress every this many tiles
    #[arg(long, env = "LOG_EVERY", default_value_t = 500)]
    log_every: u64,

    /// Most rasters composited into one tile by the mosaic strategy
    #[arg(long, default_value_t = 5)]
    max_sources: usize,

    /// Band count of usable rasters
    #[arg(long, default_value_t = 3)]
    expected_bands: usize,

    /// Bucket receiving the archive. Nothing is uploaded without it
    #[arg(long, env = "S3_BUCKET")]
    s3_bucket: Option<String>,

    /// Object key of the uploaded archive, defaults to the output file name
    #[arg(long, env = "S3_KEY")]
    s3_key: Option<String>,

    /// S3 host name or URL
    #[arg(long, env = "S3_ENDPOINT", default_value = DEFAULT_S3_ENDPOINT)]
    s3_endpoint: String,

    /// S3 signing region
    #[arg(long, env = "S3_REGION", default_value = DEFAULT_S3_REGION)]
    s3_region: String,

    /// S3 access key, required with --s3-bucket
    #[arg(long, env = "S3_ACCESS_KEY", hide_env_values = true)]
    s3_access_key: Option<String>,

    /// S3 secret key, required with --s3-bucket
    #[arg(long, env = "S3_SECRET_KEY", hide_env_values = true)]
    s3_secret_key: Option<String>,

    /// File collecting warnings and errors, uploaded next to the archive when not empty
    #[arg(long, env = "ERROR_LOG", value_name = "PATH")]
    error_log: Option<PathBuf>,
}

impl Args {
    pub fn error_log(&self) -> Option<&Path> {
        self.error_log.as_deref()
    }

    fn pipeline_config(&self) -> MosaicResult<PipelineConfig> {
        let bbox = match self.bbox {
            Some(bbox) => bbox,
            None if self.test_mode => TEST_MODE_BBOX,
            None => BoundingBox::WORLD,
        };
        let config = PipelineConfig {
            collection: self.collection.clone(),
            bbox,
            policy: RenderPolicy::hybrid(
                self.zoom_min,
                self.imagery_zoom,
                self.zoom_max,
                self.strategy,
            )?,
            concurrency: self
                .concurrency
                .unwrap_or_else(|| (self.threads * self.batch_factor).max(16)),
            tile_size: self.tile_size,
            format: self.format,
            coverage_color: DEFAULT_COVERAGE_COLOR,
            log_every: self.log_every,
            fetch: FetchConfig {
                template: UrlTemplate::new(self.tile_url_template.as_str())?,
                timeout: Duration::from_secs(self.http_timeout),
                retries: self.retries,
                ..FetchConfig::default()
            },
            mosaic: MosaicConfig {
                max_sources: self.max_sources,
                expected_bands: self.expected_bands,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn s3_config(&self) -> Option<S3Config> {
        self.s3_bucket.as_ref().map(|bucket| S3Config {
            endpoint: self.s3_endpoint.clone(),
            bucket: bucket.clone(),
            region: self.s3_region.clone(),
            access_key: self.s3_access_key.clone(),
            secret_key: self.s3_secret_key.clone(),
        })
    }

    fn object_key(&self) -> String {
        self.s3_key.clone().unwrap_or_else(|| {
            self.output.file_name().map_or_else(
                || "global-mosaic.pmtiles".to_string(),
                |name| name.to_string_lossy().into_owned(),
            )
        })
    }
}

pub async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    // Everything that can be rejected is rejected before any tile is rendered
    let config = args.pipeline_config()?;
    let uploader = match args.s3_config() {
        Some(s3) => Some(S3Uploader::new(&s3)?),
        None => None,
    };

    if args.output.exists() && !args.overwrite {
        log::info!(
            "{} already exists, skipping generation",
            args.output.display()
        );
    } else {
        generate(&args, config).await?;
    }

    let Some(uploader) = uploader else {
        log::info!("No S3 bucket configured, skipping upload");
        return Ok(());
    };
    uploader
        .upload(&args.output, &args.object_key(), PMTILES_CONTENT_TYPE)
        .await?;
    if let Some(path) = args.error_log() {
        log::logger().flush();
        let key = path.file_name().map_or_else(
            || "global_mosaic_error.log".to_string(),
            |name| name.to_string_lossy().into_owned(),
        );
        upload_error_log(&uploader, path, &key).await?;
    }
    Ok(())
}

async fn generate(args: &Args, config: PipelineConfig) -> MosaicResult<()> {
    let footprints = load_footprints(args, &config).await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, finishing tiles in flight");
                cancel.cancel();
            }
        }
    });

    let fetch = config.fetch.clone();
    let mosaic = config.mosaic;
    let (tile_size, format) = (config.tile_size, config.format);
    let uses_fetch = config.policy.uses(RenderStrategy::RemoteFetch);
    let uses_mosaic = config.policy.uses(RenderStrategy::DirectMosaic);
    let collection = config.collection.clone();

    let mut pipeline = Pipeline::new(config, footprints)?.with_cancellation(cancel.clone());
    if uses_fetch {
        let client = HttpTileClient::new(fetch.timeout)?;
        let strategy = RemoteFetch::new(
            client,
            fetch.template.clone(),
            collection,
            fetch.retry_policy(),
            cancel.clone(),
        );
        pipeline = pipeline.with_strategy(RenderStrategy::RemoteFetch, Arc::new(strategy));
    }
    if uses_mosaic {
        let strategy = DirectMosaic::new(
            TileDirSource,
            Arc::clone(pipeline.footprints()),
            Arc::new(RenderCache::default()),
            mosaic,
            tile_size,
            format,
        )
        .with_retry(fetch.retry_policy(), cancel.clone());
        pipeline = pipeline.with_strategy(RenderStrategy::DirectMosaic, Arc::new(strategy));
    }

    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    // Written next to the output and only renamed once every tile was rendered.
    // A later run skips generation whenever the output exists.
    let partial = partial_path(&args.output);
    let summary = pipeline.run(PmTilesWriter::create(&partial)?).await?;
    println!("{summary}");
    publish(&summary, &partial, &args.output).await?;
    println!("Wrote {}", args.output.display());
    Ok(())
}

/// Moves a finished archive into place. A cancelled run stays at `partial`.
async fn publish(summary: &RunSummary, partial: &Path, output: &Path) -> MosaicResult<()> {
    if summary.cancelled {
        log::warn!("Keeping the incomplete archive at {}", partial.display());
        return Err(MosaicError::Cancelled {
            processed: summary.processed,
            total: summary.total,
        });
    }
    tokio::fs::rename(partial, output).await?;
    Ok(())
}

async fn load_footprints(args: &Args, config: &PipelineConfig) -> MosaicResult<Vec<Footprint>> {
    if let Some(path) = &args.catalog {
        return GeoJsonCatalog::new(path)
            .footprints(&config.collection, &config.bbox)
            .await;
    }
    if let Some(dsn) = &args.pg_dsn {
        return query_pgstac(dsn, config).await;
    }
    Err(MosaicError::Config(
        "no footprint catalog given, use --catalog or --pg-dsn".into(),
    ))
}

#[cfg(feature = "pgstac")]
async fn query_pgstac(dsn: &str, config: &PipelineConfig) -> MosaicResult<Vec<Footprint>> {
    use global_mosaic::catalog::PgStacCatalog;

    PgStacCatalog::connect(dsn)
        .await?
        .footprints(&config.collection, &config.bbox)
        .await
}

#[cfg(not(feature = "pgstac"))]
#[expect(clippy::unused_async)]
async fn query_pgstac(_dsn: &str, _config: &PipelineConfig) -> MosaicResult<Vec<Footprint>> {
    Err(MosaicError::Config(
        "this build cannot query PgSTAC, rebuild with the pgstac feature".into(),
    ))
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    output.with_file_name(name)
}
