//! Footprint catalogs: where the imagery of a collection is.

use std::future::Future;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use geo::Geometry;
use geojson::{Feature, GeoJson, JsonObject, JsonValue};

use crate::footprint::Footprint;
use crate::{BoundingBox, MosaicError, MosaicResult};

/// Source of imagery footprints.
pub trait Catalog: Send + Sync {
    /// Footprints of `collection` intersecting `bbox`, newest first.
    ///
    /// Items with malformed geometry are skipped with a warning.
    fn footprints(
        &self,
        collection: &str,
        bbox: &BoundingBox,
    ) -> impl Future<Output = MosaicResult<Vec<Footprint>>> + Send;
}

/// Reads footprints from a GeoJSON `FeatureCollection`, such as a STAC `ItemCollection`.
///
/// The raster URL is taken from `assets.visual.href`, falling back to the `url`
/// property. Features naming another collection are ignored.
#[derive(Debug, Clone)]
pub struct GeoJsonCatalog {
    path: PathBuf,
}

impl GeoJsonCatalog {
    /// Catalog stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parses a GeoJSON document. `Feature` and `FeatureCollection` are accepted.
    pub fn parse(
        document: &str,
        collection: &str,
        bbox: &BoundingBox,
    ) -> MosaicResult<Vec<Footprint>> {
        let geojson: GeoJson = document
            .parse()
            .map_err(|e: geojson::Error| MosaicError::Catalog(e.to_string()))?;
        let features = match geojson {
            GeoJson::FeatureCollection(fc) => fc.features,
            GeoJson::Feature(f) => vec![f],
            GeoJson::Geometry(_) => {
                return Err(MosaicError::Catalog(
                    "expected a Feature or FeatureCollection".into(),
                ));
            }
        };

        let mut footprints = Vec::with_capacity(features.len());
        for (position, feature) in features.into_iter().enumerate() {
            if let Some(other) = member(&feature, "collection").and_then(JsonValue::as_str)
                && other != collection
            {
                continue;
            }
            match to_footprint(position, feature) {
                Ok(footprint) => {
                    let keep = footprint
                        .envelope()
                        .is_some_and(|(w, s, e, n)| bbox.intersects(w, s, e, n));
                    if keep {
                        footprints.push(footprint);
                    }
                }
                Err(e) => log::warn!("Skipping catalog item: {e}"),
            }
        }
        sort_newest_first(&mut footprints);
        Ok(footprints)
    }
}

impl Catalog for GeoJsonCatalog {
    async fn footprints(&self, collection: &str, bbox: &BoundingBox) -> MosaicResult<Vec<Footprint>> {
        let document = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            MosaicError::Catalog(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let footprints = Self::parse(&document, collection, bbox)?;
        log::info!(
            "Found {} items in {} for collection {collection}",
            footprints.len(),
            self.path.display()
        );
        Ok(footprints)
    }
}

/// Stable, so items with equal timestamps keep catalog order. Undated items go last.
fn sort_newest_first(footprints: &mut [Footprint]) {
    footprints.sort_by(|a, b| b.datetime.cmp(&a.datetime));
}

/// A STAC item member, looked up at the top level and then in `properties`.
fn member<'a>(feature: &'a Feature, name: &str) -> Option<&'a JsonValue> {
    feature
        .foreign_members
        .as_ref()
        .and_then(|m| m.get(name))
        .or_else(|| feature.properties.as_ref().and_then(|p| p.get(name)))
}

fn to_footprint(position: usize, feature: Feature) -> MosaicResult<Footprint> {
    let id = feature_id(position, &feature);
    let source = source_url(&feature);
    let datetime = member(&feature, "datetime")
        .and_then(JsonValue::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc));

    let Some(geometry) = feature.geometry else {
        return Err(MosaicError::InvalidGeometry {
            id,
            reason: "missing geometry".into(),
        });
    };
    let geometry = Geometry::<f64>::try_from(geometry).map_err(|e| MosaicError::InvalidGeometry {
        id: id.clone(),
        reason: e.to_string(),
    })?;
    Footprint::new(id, geometry, source, datetime)
}

fn feature_id(position: usize, feature: &Feature) -> String {
    match &feature.id {
        Some(geojson::feature::Id::String(s)) => s.clone(),
        Some(geojson::feature::Id::Number(n)) => n.to_string(),
        None => member(feature, "id")
            .and_then(JsonValue::as_str)
            .map_or_else(|| format!("#{position}"), str::to_string),
    }
}

fn source_url(feature: &Feature) -> Option<String> {
    let from_assets = feature
        .foreign_members
        .as_ref()
        .and_then(|m: &JsonObject| m.get("assets"))
        .and_then(|a| a.get("visual"))
        .and_then(|v| v.get("href"))
        .and_then(JsonValue::as_str);
    from_assets
        .or_else(|| {
            feature
                .properties
                .as_ref()
                .and_then(|p| p.get("url"))
                .and_then(JsonValue::as_str)
        })
        .map(str::to_string)
}

#[cfg(feature = "pgstac")]
pub use pgstac::PgStacCatalog;

#[cfg(feature = "pgstac")]
mod pgstac {
    use chrono::{DateTime, Utc};
    use sqlx::postgres::{PgPool, PgPoolOptions};
    use sqlx::Row;

    use super::{Catalog, sort_newest_first};
    use crate::footprint::Footprint;
    use crate::{BoundingBox, MosaicError, MosaicResult};

    const ITEMS_QUERY: &str = "\
        SELECT id::text AS id,
            content->'assets'->'visual'->>'href' AS url,
            ST_AsGeoJSON(geometry) AS geom,
            (content->>'datetime')::timestamptz AS datetime
        FROM pgstac.items
        WHERE collection = $1
            AND geometry && ST_MakeEnvelope($2, $3, $4, $5, 4326)
        ORDER BY (content->>'datetime')::timestamptz DESC";

    /// Queries the items table of a PgSTAC database.
    #[derive(Debug, Clone)]
    pub struct PgStacCatalog {
        pool: PgPool,
    }

    impl PgStacCatalog {
        /// Connects with a small pool.
        pub async fn connect(dsn: &str) -> MosaicResult<Self> {
            let pool = PgPoolOptions::new().max_connections(2).connect(dsn).await?;
            Ok(Self { pool })
        }

        /// Uses an existing pool.
        #[must_use]
        pub fn from_pool(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    impl Catalog for PgStacCatalog {
        async fn footprints(
            &self,
            collection: &str,
            bbox: &BoundingBox,
        ) -> MosaicResult<Vec<Footprint>> {
            let rows = sqlx::query(ITEMS_QUERY)
                .bind(collection)
                .bind(bbox.min_lon)
                .bind(bbox.min_lat)
                .bind(bbox.max_lon)
                .bind(bbox.max_lat)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| MosaicError::Catalog(e.to_string()))?;

            let mut footprints = Vec::with_capacity(rows.len());
            for row in rows {
                let id: String = row.try_get("id")?;
                let url: Option<String> = row.try_get("url")?;
                let geom: Option<String> = row.try_get("geom")?;
                let datetime: Option<DateTime<Utc>> = row.try_get("datetime")?;

                let parsed = geom
                    .ok_or_else(|| "missing geometry".to_string())
                    .and_then(|g| g.parse::<geojson::Geometry>().map_err(|e| e.to_string()))
                    .and_then(|g| geo::Geometry::<f64>::try_from(g).map_err(|e| e.to_string()));
                let footprint = match parsed {
                    Ok(geometry) => Footprint::new(id, geometry, url, datetime),
                    Err(reason) => Err(MosaicError::InvalidGeometry { id, reason }),
                };
                match footprint {
                    Ok(f) => footprints.push(f),
                    Err(e) => log::warn!("Skipping catalog item: {e}"),
                }
            }
            sort_newest_first(&mut footprints);
            log::info!("Found {} items in PgSTAC for collection {collection}", footprints.len());
            Ok(footprints)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEMS: &str = r#"{
      "type": "FeatureCollection",
      "features": [
        {
          "type": "Feature", "id": "old", "collection": "openaerialmap",
          "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]},
          "properties": {"datetime": "2019-05-01T00:00:00Z"},
          "assets": {"visual": {"href": "https://example.com/old.tif"}}
        },
        {
          "type": "Feature", "id": "new",
          "geometry": {"type": "MultiPolygon", "coordinates": [[[[2,2],[3,2],[3,3],[2,2]]]]},
          "properties": {"datetime": "2024-01-15T10:00:00+02:00", "url": "/data/new"}
        },
        {
          "type": "Feature", "id": "undated",
          "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]},
          "properties": {}
        },
        {
          "type": "Feature", "id": "point",
          "geometry": {"type": "Point", "coordinates": [0.5, 0.5]},
          "properties": {}
        },
        {
          "type": "Feature", "id": "elsewhere",
          "geometry": {"type": "Polygon", "coordinates": [[[100,50],[101,50],[101,51],[100,50]]]},
          "properties": {}
        },
        {
          "type": "Feature", "id": "other", "collection": "maxar",
          "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]]},
          "properties": {}
        },
        {
          "type": "Feature", "geometry": null, "properties": {}
        }
      ]
    }"#;

    fn bbox() -> BoundingBox {
        BoundingBox::from_wsen(-20.0, -20.0, 20.0, 20.0).unwrap()
    }

    #[test]
    fn parses_stac_items() {
        let footprints = GeoJsonCatalog::parse(ITEMS, "openaerialmap", &bbox()).unwrap();
        let ids: Vec<_> = footprints.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old", "undated"]);

        assert_eq!(footprints[0].source.as_deref(), Some("/data/new"));
        assert_eq!(
            footprints[1].source.as_deref(),
            Some("https://example.com/old.tif")
        );
        assert!(footprints[2].source.is_none());
        assert_eq!(
            footprints[0].datetime.unwrap().to_rfc3339(),
            "2024-01-15T08:00:00+00:00"
        );
    }

    #[test]
    fn rejects_bare_geometry() {
        let doc = r#"{"type": "Point", "coordinates": [0, 0]}"#;
        assert!(GeoJsonCatalog::parse(doc, "c", &bbox()).is_err());
        assert!(GeoJsonCatalog::parse("not json", "c", &bbox()).is_err());
    }

    #[tokio::test]
    async fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.geojson");
        std::fs::write(&path, ITEMS).unwrap();

        let catalog = GeoJsonCatalog::new(&path);
        let footprints = catalog.footprints("openaerialmap", &BoundingBox::WORLD).await.unwrap();
        assert_eq!(footprints.len(), 4);

        let missing = GeoJsonCatalog::new(dir.path().join("nope.geojson"));
        let err = missing.footprints("openaerialmap", &bbox()).await.unwrap_err();
        assert!(matches!(err, MosaicError::Catalog(_)));
    }
}
