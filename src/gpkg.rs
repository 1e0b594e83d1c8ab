//! Minimal GeoPackage writer: core metadata tables plus one feature table per
//! layer, geometries stored as GeoPackage binary (header + 2D WKB).

use std::path::Path;

use geojson::{Geometry, Value as GeoValue};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value as JsonValue;

use crate::domain::{Crs, Extent};
use crate::error::BratError;
use crate::features::{FeatureLayer, collect_points};

const APPLICATION_ID: i32 = 0x4750_4B47;
const USER_VERSION: i32 = 10_400;
const GEOMETRY_COLUMN: &str = "geom";

const WGS84_WKT: &str = r#"GEOGCS["WGS 84",DATUM["WGS_1984",SPHEROID["WGS 84",6378137,298.257223563,AUTHORITY["EPSG","7030"]],AUTHORITY["EPSG","6326"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4326"]]"#;
const BC_ALBERS_WKT: &str = r#"PROJCS["NAD83 / BC Albers",GEOGCS["NAD83",DATUM["North_American_Datum_1983",SPHEROID["GRS 1980",6378137,298.257222101,AUTHORITY["EPSG","7019"]],AUTHORITY["EPSG","6269"]],PRIMEM["Greenwich",0,AUTHORITY["EPSG","8901"]],UNIT["degree",0.0174532925199433,AUTHORITY["EPSG","9122"]],AUTHORITY["EPSG","4269"]],PROJECTION["Albers_Conic_Equal_Area"],PARAMETER["latitude_of_center",45],PARAMETER["longitude_of_center",-126],PARAMETER["standard_parallel_1",50],PARAMETER["standard_parallel_2",58.5],PARAMETER["false_easting",1000000],PARAMETER["false_northing",0],UNIT["metre",1,AUTHORITY["EPSG","9001"]],AUTHORITY["EPSG","3005"]]"#;

const CORE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS gpkg_spatial_ref_sys (
    srs_name TEXT NOT NULL,
    srs_id INTEGER NOT NULL PRIMARY KEY,
    organization TEXT NOT NULL,
    organization_coordsys_id INTEGER NOT NULL,
    definition TEXT NOT NULL,
    description TEXT
);
CREATE TABLE IF NOT EXISTS gpkg_contents (
    table_name TEXT NOT NULL PRIMARY KEY,
    data_type TEXT NOT NULL,
    identifier TEXT UNIQUE,
    description TEXT DEFAULT '',
    last_change DATETIME NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
    min_x DOUBLE,
    min_y DOUBLE,
    max_x DOUBLE,
    max_y DOUBLE,
    srs_id INTEGER,
    CONSTRAINT fk_gc_r_srs_id FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
CREATE TABLE IF NOT EXISTS gpkg_geometry_columns (
    table_name TEXT NOT NULL,
    column_name TEXT NOT NULL,
    geometry_type_name TEXT NOT NULL,
    srs_id INTEGER NOT NULL,
    z TINYINT NOT NULL,
    m TINYINT NOT NULL,
    CONSTRAINT pk_geom_cols PRIMARY KEY (table_name, column_name),
    CONSTRAINT uk_gc_table_name UNIQUE (table_name),
    CONSTRAINT fk_gc_tn FOREIGN KEY (table_name) REFERENCES gpkg_contents(table_name),
    CONSTRAINT fk_gc_srs FOREIGN KEY (srs_id) REFERENCES gpkg_spatial_ref_sys(srs_id)
);
"#;

/// An open GeoPackage file. Layer writes go through `&mut self`, so a single
/// handle serializes every writer of the container.
pub struct GeoPackage {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Boolean => "BOOLEAN",
        }
    }
}

impl GeoPackage {
    pub fn open(path: &Path) -> Result<Self, BratError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| BratError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        conn.pragma_update(None, "application_id", APPLICATION_ID)
            .map_err(store_err)?;
        conn.pragma_update(None, "user_version", USER_VERSION)
            .map_err(store_err)?;
        conn.execute_batch(CORE_TABLES).map_err(store_err)?;
        let srs_rows: [(&str, i64, &str, i64, &str); 4] = [
            ("Undefined cartesian SRS", -1, "NONE", -1, "undefined"),
            ("Undefined geographic SRS", 0, "NONE", 0, "undefined"),
            ("WGS 84 geodetic", 4326, "EPSG", 4326, WGS84_WKT),
            ("NAD83 / BC Albers", 3005, "EPSG", 3005, BC_ALBERS_WKT),
        ];
        for (name, id, org, org_id, definition) in srs_rows {
            conn.execute(
                "INSERT OR IGNORE INTO gpkg_spatial_ref_sys \
                 (srs_name, srs_id, organization, organization_coordsys_id, definition) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, id, org, org_id, definition],
            )
            .map_err(store_err)?;
        }
        Ok(Self { conn })
    }

    /// Write `layer` as a feature table named after it, replacing any table of
    /// the same name.
    pub fn write_layer(&mut self, layer: &FeatureLayer) -> Result<usize, BratError> {
        validate_table_name(&layer.name)?;
        let columns = infer_columns(layer);
        let srs_id = layer.crs.epsg() as i64;
        let geometry_type = geometry_type_name(layer);
        let extent = layer.extent();

        let tx = self.conn.transaction().map_err(store_err)?;
        tx.execute(&format!("DROP TABLE IF EXISTS \"{}\"", layer.name), [])
            .map_err(store_err)?;
        tx.execute(
            "DELETE FROM gpkg_geometry_columns WHERE table_name = ?1",
            params![layer.name],
        )
        .map_err(store_err)?;
        tx.execute(
            "DELETE FROM gpkg_contents WHERE table_name = ?1",
            params![layer.name],
        )
        .map_err(store_err)?;

        let mut ddl = format!(
            "CREATE TABLE \"{}\" (fid INTEGER PRIMARY KEY AUTOINCREMENT, {GEOMETRY_COLUMN} {geometry_type}",
            layer.name
        );
        for column in &columns {
            ddl.push_str(&format!(", \"{}\" {}", column.name, column.kind.sql()));
        }
        ddl.push(')');
        tx.execute(&ddl, []).map_err(store_err)?;

        let placeholders = (1..=columns.len() + 1)
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        let column_list = std::iter::once(GEOMETRY_COLUMN.to_string())
            .chain(columns.iter().map(|column| format!("\"{}\"", column.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let insert = format!(
            "INSERT INTO \"{}\" ({column_list}) VALUES ({placeholders})",
            layer.name
        );
        {
            let mut stmt = tx.prepare(&insert).map_err(store_err)?;
            for feature in &layer.features {
                let mut values = Vec::with_capacity(columns.len() + 1);
                values.push(match &feature.geometry {
                    Some(geometry) => SqlValue::Blob(encode_geometry(geometry, srs_id as i32)),
                    None => SqlValue::Null,
                });
                for column in &columns {
                    let value = feature
                        .properties
                        .as_ref()
                        .and_then(|properties| properties.get(&column.key));
                    values.push(to_sql_value(value, column.kind));
                }
                stmt.execute(params_from_iter(values)).map_err(store_err)?;
            }
        }

        tx.execute(
            "INSERT INTO gpkg_contents \
             (table_name, data_type, identifier, description, min_x, min_y, max_x, max_y, srs_id) \
             VALUES (?1, 'features', ?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                layer.name,
                layer.source,
                extent.map(|e| e.min_x),
                extent.map(|e| e.min_y),
                extent.map(|e| e.max_x),
                extent.map(|e| e.max_y),
                srs_id
            ],
        )
        .map_err(store_err)?;
        tx.execute(
            "INSERT INTO gpkg_geometry_columns \
             (table_name, column_name, geometry_type_name, srs_id, z, m) \
             VALUES (?1, ?2, ?3, ?4, 0, 0)",
            params![layer.name, GEOMETRY_COLUMN, geometry_type, srs_id],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(layer.len())
    }

    /// Feature layers in the order they were first written.
    pub fn list_layers(&self) -> Result<Vec<String>, BratError> {
        let mut stmt = self
            .conn
            .prepare("SELECT table_name FROM gpkg_contents WHERE data_type = 'features' ORDER BY rowid")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
    }

    pub fn count_features(&self, layer: &str) -> Result<usize, BratError> {
        validate_table_name(layer)?;
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{layer}\""), [], |row| {
                row.get(0)
            })
            .map_err(store_err)?;
        Ok(count as usize)
    }

    pub fn column_names(&self, layer: &str) -> Result<Vec<String>, BratError> {
        validate_table_name(layer)?;
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info(\"{layer}\")"))
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(store_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
    }

    pub fn layer_srs(&self, layer: &str) -> Result<Option<i64>, BratError> {
        self.conn
            .query_row(
                "SELECT srs_id FROM gpkg_geometry_columns WHERE table_name = ?1",
                params![layer],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)
    }
}

fn store_err(err: rusqlite::Error) -> BratError {
    BratError::SpatialStore(err.to_string())
}

fn validate_table_name(name: &str) -> Result<(), BratError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        && !name.starts_with("gpkg_");
    if valid {
        Ok(())
    } else {
        Err(BratError::SpatialStore(format!("invalid layer name: {name}")))
    }
}

#[derive(Debug, Clone)]
struct Column {
    key: String,
    name: String,
    kind: ColumnType,
}

/// One column per attribute key across all records (first-appearance order).
/// Records lacking a key store NULL; a key whose values disagree on type is
/// stored as TEXT, except integer/real mixes which widen to REAL.
fn infer_columns(layer: &FeatureLayer) -> Vec<Column> {
    layer
        .attribute_names()
        .into_iter()
        .map(|key| {
            let mut kind: Option<ColumnType> = None;
            for feature in &layer.features {
                let Some(value) = feature
                    .properties
                    .as_ref()
                    .and_then(|properties| properties.get(&key))
                else {
                    continue;
                };
                let Some(observed) = json_column_type(value) else {
                    continue;
                };
                kind = Some(match (kind, observed) {
                    (None, observed) => observed,
                    (Some(current), observed) if current == observed => current,
                    (Some(ColumnType::Integer), ColumnType::Real)
                    | (Some(ColumnType::Real), ColumnType::Integer) => ColumnType::Real,
                    _ => ColumnType::Text,
                });
            }
            let name = if key.eq_ignore_ascii_case("fid") || key.eq_ignore_ascii_case(GEOMETRY_COLUMN)
            {
                format!("{key}_attr")
            } else {
                key.replace('"', "")
            };
            Column {
                key,
                name,
                kind: kind.unwrap_or(ColumnType::Text),
            }
        })
        .collect()
}

fn json_column_type(value: &JsonValue) -> Option<ColumnType> {
    match value {
        JsonValue::Null => None,
        JsonValue::Bool(_) => Some(ColumnType::Boolean),
        JsonValue::Number(number) if number.is_i64() || number.is_u64() => {
            Some(ColumnType::Integer)
        }
        JsonValue::Number(_) => Some(ColumnType::Real),
        _ => Some(ColumnType::Text),
    }
}

fn to_sql_value(value: Option<&JsonValue>, kind: ColumnType) -> SqlValue {
    let Some(value) = value else {
        return SqlValue::Null;
    };
    match (kind, value) {
        (_, JsonValue::Null) => SqlValue::Null,
        (ColumnType::Boolean, JsonValue::Bool(flag)) => SqlValue::Integer(i64::from(*flag)),
        (ColumnType::Integer, JsonValue::Number(number)) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => number
                .as_f64()
                .map(SqlValue::Real)
                .unwrap_or(SqlValue::Null),
        },
        (ColumnType::Real, JsonValue::Number(number)) => number
            .as_f64()
            .map(SqlValue::Real)
            .unwrap_or(SqlValue::Null),
        (_, JsonValue::String(text)) => SqlValue::Text(text.clone()),
        (_, other) => SqlValue::Text(other.to_string()),
    }
}

fn geometry_type_name(layer: &FeatureLayer) -> &'static str {
    let mut names = layer
        .features
        .iter()
        .filter_map(|feature| feature.geometry.as_ref())
        .map(|geometry| wkb_type_name(&geometry.value));
    let Some(first) = names.next() else {
        return "GEOMETRY";
    };
    if names.all(|name| name == first) {
        first
    } else {
        "GEOMETRY"
    }
}

fn wkb_type_name(value: &GeoValue) -> &'static str {
    match value {
        GeoValue::Point(_) => "POINT",
        GeoValue::LineString(_) => "LINESTRING",
        GeoValue::Polygon(_) => "POLYGON",
        GeoValue::MultiPoint(_) => "MULTIPOINT",
        GeoValue::MultiLineString(_) => "MULTILINESTRING",
        GeoValue::MultiPolygon(_) => "MULTIPOLYGON",
        GeoValue::GeometryCollection(_) => "GEOMETRYCOLLECTION",
    }
}

/// GeoPackage binary: `GP`, version 0, little-endian flags with an XY
/// envelope, the srs id, then the geometry as 2D WKB.
pub fn encode_geometry(geometry: &Geometry, srs_id: i32) -> Vec<u8> {
    let mut points = Vec::new();
    collect_points(&geometry.value, &mut points);
    let envelope = Extent::from_points(points, Crs::Wgs84);

    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(b"GP");
    buf.push(0);
    match envelope {
        Some(envelope) => {
            buf.push(0b0000_0011);
            buf.extend_from_slice(&srs_id.to_le_bytes());
            for value in [envelope.min_x, envelope.max_x, envelope.min_y, envelope.max_y] {
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        None => {
            // empty geometry, no envelope
            buf.push(0b0001_0001);
            buf.extend_from_slice(&srs_id.to_le_bytes());
        }
    }
    write_wkb(&geometry.value, &mut buf);
    buf
}

fn write_wkb(value: &GeoValue, buf: &mut Vec<u8>) {
    let header = |buf: &mut Vec<u8>, kind: u32| {
        buf.push(1);
        buf.extend_from_slice(&kind.to_le_bytes());
    };
    match value {
        GeoValue::Point(position) => {
            header(buf, 1);
            write_position(position, buf);
        }
        GeoValue::LineString(line) => {
            header(buf, 2);
            write_positions(line, buf);
        }
        GeoValue::Polygon(rings) => {
            header(buf, 3);
            write_rings(rings, buf);
        }
        GeoValue::MultiPoint(points) => {
            header(buf, 4);
            write_count(points.len(), buf);
            for point in points {
                write_wkb(&GeoValue::Point(point.clone()), buf);
            }
        }
        GeoValue::MultiLineString(lines) => {
            header(buf, 5);
            write_count(lines.len(), buf);
            for line in lines {
                header(buf, 2);
                write_positions(line, buf);
            }
        }
        GeoValue::MultiPolygon(polygons) => {
            header(buf, 6);
            write_count(polygons.len(), buf);
            for rings in polygons {
                header(buf, 3);
                write_rings(rings, buf);
            }
        }
        GeoValue::GeometryCollection(geometries) => {
            header(buf, 7);
            write_count(geometries.len(), buf);
            for geometry in geometries {
                write_wkb(&geometry.value, buf);
            }
        }
    }
}

fn write_count(count: usize, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(count as u32).to_le_bytes());
}

fn write_position(position: &[f64], buf: &mut Vec<u8>) {
    let (x, y) = match position {
        [x, y, ..] => (*x, *y),
        _ => (f64::NAN, f64::NAN),
    };
    buf.extend_from_slice(&x.to_le_bytes());
    buf.extend_from_slice(&y.to_le_bytes());
}

fn write_positions(positions: &[Vec<f64>], buf: &mut Vec<u8>) {
    write_count(positions.len(), buf);
    for position in positions {
        write_position(position, buf);
    }
}

fn write_rings(rings: &[Vec<Vec<f64>>], buf: &mut Vec<u8>) {
    write_count(rings.len(), buf);
    for ring in rings {
        write_positions(ring, buf);
    }
}
