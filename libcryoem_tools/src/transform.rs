use rand::Rng;
use std::fmt;
use std::path::{Path, PathBuf};

use super::error::{StarError, TransformError};
use super::star::{StarBlock, StarFile, StarTable};
use super::targets::list_files;

/// Coordinate fields of a RELION particles table
pub const STAR_COORDINATE_FIELDS: [&str; 3] =
    ["_rlnCoordinateX", "_rlnCoordinateY", "_rlnCoordinateZ"];

/// Geometry fields of a crYOLO .cbox table
pub const CBOX_SCALED_FIELDS: [&str; 8] = [
    "_CoordinateX",
    "_CoordinateY",
    "_CoordinateZ",
    "_Width",
    "_Height",
    "_Depth",
    "_EstWidth",
    "_EstHeight",
];

pub const FILAMENT_ID_FIELD: &str = "_filamentid";

/// Suffix added to the stem of a rescaled file
pub const MODIFIED_SUFFIX: &str = "_modified";

/// The coordinate file formats understood by the scaler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateFormat {
    Star,
    Cbox,
    Box,
}

impl CoordinateFormat {
    pub fn from_path(path: &Path) -> Result<Self, TransformError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("star") => Ok(Self::Star),
            Some("cbox") => Ok(Self::Cbox),
            Some("box") => Ok(Self::Box),
            _ => Err(TransformError::UnsupportedExtension(path.to_path_buf())),
        }
    }

    /// Fields to scale for table based formats
    pub fn scaled_fields(&self) -> &'static [&'static str] {
        match self {
            Self::Star => &STAR_COORDINATE_FIELDS,
            Self::Cbox => &CBOX_SCALED_FIELDS,
            Self::Box => &[],
        }
    }
}

/// Multiply a numeric token and print it with two decimals. Anything that is not a
/// finite number is returned unchanged.
pub fn scale_value(token: &str, factor: f64) -> String {
    match token.parse::<f64>() {
        Ok(value) if value.is_finite() => format!("{:.2}", value * factor),
        _ => token.to_string(),
    }
}

/// Scale every listed field present in the table. Returns the number of columns scaled.
pub fn scale_columns(table: &mut StarTable, fields: &[&str], factor: f64) -> usize {
    let mut scaled = 0;
    for field in fields {
        if table
            .map_column(field, |token| scale_value(token, factor))
            .is_ok()
        {
            scaled += 1;
        }
    }
    scaled
}

/// Scale the listed fields in every table of a document
pub fn scale_star(star: &mut StarFile, fields: &[&str], factor: f64) -> usize {
    star.tables_mut()
        .map(|table| scale_columns(table, fields, factor))
        .sum()
}

/// A plain whitespace separated numeric table (EMAN/crYOLO .box)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoxFile {
    pub rows: Vec<Vec<f64>>,
}

impl BoxFile {
    pub fn parse(text: &str) -> Result<Self, TransformError> {
        let mut rows = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row = line
                .split_whitespace()
                .map(|token| {
                    token
                        .parse::<f64>()
                        .map_err(|_| TransformError::NotNumeric {
                            line: idx + 1,
                            value: token.to_string(),
                        })
                })
                .collect::<Result<Vec<f64>, TransformError>>()?;
            rows.push(row);
        }
        Ok(Self { rows })
    }

    pub fn read(path: &Path) -> Result<Self, TransformError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Every value is coordinate or box geometry, so everything is scaled
    pub fn scale(&mut self, factor: f64) {
        for value in self.rows.iter_mut().flatten() {
            *value *= factor;
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), TransformError> {
        std::fs::write(path, self.to_string())?;
        Ok(())
    }
}

impl fmt::Display for BoxFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.rows.iter() {
            let line: Vec<String> = row.iter().map(|value| format!("{value:.2}")).collect();
            writeln!(f, "{}", line.join("\t"))?;
        }
        Ok(())
    }
}

/// `<out_dir>/<stem>_modified<.ext>`
pub fn modified_path(input: &Path, out_dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = input
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    out_dir.join(format!("{stem}{MODIFIED_SUFFIX}{ext}"))
}

/// Rescale one coordinate file and write the result next to the others in `out_dir`
pub fn scale_file(input: &Path, factor: f64, out_dir: &Path) -> Result<PathBuf, TransformError> {
    let format = CoordinateFormat::from_path(input)?;
    let output = modified_path(input, out_dir);
    match format {
        CoordinateFormat::Box => {
            let mut boxes = BoxFile::read(input)?;
            boxes.scale(factor);
            boxes.write(&output)?;
        }
        CoordinateFormat::Star | CoordinateFormat::Cbox => {
            let mut star = StarFile::read(input)?;
            let scaled = scale_star(&mut star, format.scaled_fields(), factor);
            if scaled == 0 {
                log::warn!("No coordinate fields found in {}", input.display());
            }
            star.write(&output)?;
        }
    }
    log::info!("Scaled {} -> {}", input.display(), output.display());
    Ok(output)
}

/// Rescale every file in `dir` whose name ends with `label`
pub fn scale_directory(
    dir: &Path,
    label: &str,
    factor: f64,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, TransformError> {
    let inputs = list_files(dir, "", label, false)?;
    if inputs.is_empty() {
        log::warn!("No files ending with {label} in {}", dir.display());
    }
    std::fs::create_dir_all(out_dir)?;
    inputs
        .iter()
        .map(|input| scale_file(input, factor, out_dir))
        .collect()
}

/// Collapse each run of rows sharing a filament id into its first and last row, and
/// drop the id column. A filament of a single row yields that row twice so that every
/// filament is still described by two end points.
pub fn filament_endpoints(table: &StarTable) -> Result<StarTable, StarError> {
    let col = table
        .column(FILAMENT_ID_FIELD)
        .ok_or_else(|| StarError::MissingField(FILAMENT_ID_FIELD.to_string()))?;

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut run_start: Option<&Vec<String>> = None;
    let mut previous: Option<&Vec<String>> = None;
    for row in table.rows() {
        match (run_start, previous) {
            (Some(start), Some(prev)) if prev[col] != row[col] => {
                rows.push(start.clone());
                rows.push(prev.clone());
                run_start = Some(row);
            }
            (None, _) => run_start = Some(row),
            _ => (),
        }
        previous = Some(row);
    }
    if let (Some(start), Some(prev)) = (run_start, previous) {
        rows.push(start.clone());
        rows.push(prev.clone());
    }

    table.with_rows(rows)?.without_field(FILAMENT_ID_FIELD)
}

/// Convert a crYOLO .cbox document to a two column RELION coordinate file
pub fn cbox_to_star(cbox: &StarFile, factor: f64, filaments: bool) -> Result<StarFile, StarError> {
    let source = cbox
        .blocks
        .iter()
        .filter_map(|block| block.table.as_ref())
        .find(|table| table.has_field("_CoordinateX"))
        .ok_or(StarError::NoDataTable)?;

    let collapsed;
    let table = if filaments {
        collapsed = filament_endpoints(source)?;
        &collapsed
    } else {
        source
    };

    let xs: Vec<&str> = table.column_values("_CoordinateX")?.collect();
    let ys: Vec<&str> = table.column_values("_CoordinateY")?.collect();
    let rows = xs
        .iter()
        .zip(ys.iter())
        .map(|(x, y)| vec![scale_value(x, factor), scale_value(y, factor)])
        .collect();
    let coordinates = StarTable::from_names(&STAR_COORDINATE_FIELDS[..2], rows)?;
    Ok(StarFile {
        blocks: vec![StarBlock::new("", coordinates)],
    })
}

/// Convert one .cbox file to `<out_dir>/<stem>.star`
pub fn convert_cbox_file(
    input: &Path,
    factor: f64,
    filaments: bool,
    out_dir: &Path,
) -> Result<PathBuf, TransformError> {
    let cbox = StarFile::read(input)?;
    let star = cbox_to_star(&cbox, factor, filaments)?;
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let output = out_dir.join(format!("{stem}.star"));
    star.write(&output)?;
    log::info!("Converted {} -> {}", input.display(), output.display());
    Ok(output)
}

/// Replace a column of the main table with uniform random values in `[low, high]`
pub fn randomize_column<R: Rng>(
    star: &mut StarFile,
    field: &str,
    low: f64,
    high: f64,
    rng: &mut R,
) -> Result<(), TransformError> {
    if !low.is_finite() || !high.is_finite() || low > high {
        return Err(TransformError::EmptyRange(low, high));
    }
    let table = star.main_table_mut()?;
    table.map_column(field, |_| format!("{:.2}", rng.gen_range(low..=high)))?;
    Ok(())
}
