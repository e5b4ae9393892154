use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::InputConfig;
use crate::error::{PsfError, Result};

/// One detected object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRow {
    /// Position in the combined catalog; stable identifier for the whole run
    pub index: usize,
    /// Which input image the object was detected on
    pub image: usize,
    pub x: f64,
    pub y: f64,
    /// Focal-plane position
    pub u: f64,
    pub v: f64,
    pub flag: i64,
    pub properties: HashMap<String, f64>,
}

/// Ordered, immutable list of detected objects.
#[derive(Debug, Clone, Default)]
pub struct StarCatalog {
    rows: Vec<CatalogRow>,
}

impl StarCatalog {
    /// Build from rows, renumbering `index` to match the order given.
    pub fn from_rows(mut rows: Vec<CatalogRow>) -> Self {
        for (i, row) in rows.iter_mut().enumerate() {
            row.index = i;
        }
        Self { rows }
    }

    pub fn rows(&self) -> &[CatalogRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Load and concatenate the catalogs named in the input section. Catalog
    /// `i` is paired with image `i`.
    pub fn load(input: &InputConfig) -> Result<Self> {
        let mut rows = Vec::new();
        for (image, path) in input.catalog_paths().iter().enumerate() {
            let loaded = read_csv_catalog(path, image, input)?;
            tracing::info!("Read {} objects from {}", loaded.len(), path.display());
            rows.extend(loaded);
        }
        Ok(Self::from_rows(rows))
    }
}

fn column_index(headers: &csv::StringRecord, name: &str, path: &Path) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .ok_or_else(|| {
            PsfError::Config(format!("column '{}' not found in {}", name, path.display()))
        })
}

fn parse_field(record: &csv::StringRecord, col: usize, name: &str, line: usize) -> Result<f64> {
    let raw = record.get(col).unwrap_or("").trim();
    raw.parse::<f64>().map_err(|_| {
        PsfError::Config(format!(
            "row {}: column '{}' value '{}' is not numeric",
            line, name, raw
        ))
    })
}

/// Read a CSV catalog with a header row.
pub fn read_csv_catalog(path: &Path, image: usize, input: &InputConfig) -> Result<Vec<CatalogRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let x_col = column_index(&headers, &input.x_col, path)?;
    let y_col = column_index(&headers, &input.y_col, path)?;
    let u_col = input
        .u_col
        .as_deref()
        .map(|c| column_index(&headers, c, path))
        .transpose()?;
    let v_col = input
        .v_col
        .as_deref()
        .map(|c| column_index(&headers, c, path))
        .transpose()?;
    let flag_col = input
        .flag_col
        .as_deref()
        .map(|c| column_index(&headers, c, path))
        .transpose()?;
    let property_cols = input
        .property_cols
        .iter()
        .map(|c| column_index(&headers, c, path).map(|i| (c.clone(), i)))
        .collect::<Result<Vec<_>>>()?;

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let x = parse_field(&record, x_col, &input.x_col, line)?;
        let y = parse_field(&record, y_col, &input.y_col, line)?;
        let u = match u_col {
            Some(c) => parse_field(&record, c, "u", line)?,
            None => x * input.pixel_scale,
        };
        let v = match v_col {
            Some(c) => parse_field(&record, c, "v", line)?,
            None => y * input.pixel_scale,
        };
        let flag = match flag_col {
            Some(c) => parse_field(&record, c, "flag", line)? as i64,
            None => 0,
        };

        let mut properties = HashMap::new();
        for (name, col) in &property_cols {
            properties.insert(name.clone(), parse_field(&record, *col, name, line)?);
        }
        // Positions are always available to predicates.
        properties.insert(input.x_col.clone(), x);
        properties.insert(input.y_col.clone(), y);
        properties.insert("u".to_string(), u);
        properties.insert("v".to_string(), v);

        rows.push(CatalogRow {
            index: 0,
            image,
            x,
            y,
            u,
            v,
            flag,
            properties,
        });
    }
    Ok(rows)
}
