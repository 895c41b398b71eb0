//! Readers for the text files CTFFIND writes next to its diagnostic image: the per
//! micrograph fit results (`<output>.txt`) and the rotational averages
//! (`<output>_avrot.txt`).
//!
//! Both share a five line `#` header. Lines one to four describe the run, line five
//! declares the data columns:
//!
//! ```text
//! # Output from CTFFind version 4.1.14, run on 2023-05-02 14:11:05
//! # Input file: /data/mic_001.mrc ; Number of micrographs: 1
//! # Pixel size: 1.060 Angstroms ; acceleration voltage: 300.0 keV ; spherical aberration: 2.70 mm ; amplitude contrast: 0.07
//! # Box size: 512 pixels ; min. res.: 30.0 Angstroms ; max. res.: 5.0 Angstroms ; min. def.: 5000.0 um; max. def. 50000.0 um
//! # Columns: #1 - micrograph number; #2 - defocus 1 [Angstroms]; #3 - defocus 2; ...
//! ```
use fxhash::FxHashMap;
use regex::Regex;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::error::CtffindResultError;

pub const HEADER_LINES: usize = 5;
pub const AVROT_SUFFIX: &str = "_avrot.txt";

fn column_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"#(\d+)\s*-?\s*([^;]+)").expect("column pattern is valid"))
}

fn lines_per_micrograph_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"#\s*(\d+)\s+lines per micrograph").expect("avrot pattern is valid")
    })
}

/// Result columns CTFFIND may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtffindColumn {
    MicrographNumber,
    Defocus1,
    Defocus2,
    Azimuth,
    PhaseShift,
    CrossCorrelation,
    FitResolution,
    TiltAxisAngle,
    TiltAngle,
    Thickness,
}

impl CtffindColumn {
    pub fn from_description(description: &str) -> Option<Self> {
        match description.trim() {
            "micrograph number" => Some(Self::MicrographNumber),
            "defocus 1 [Angstroms]" => Some(Self::Defocus1),
            "defocus 2" | "defocus 2 [Angstroms]" => Some(Self::Defocus2),
            "azimuth of astigmatism" => Some(Self::Azimuth),
            "additional phase shift [radians]" => Some(Self::PhaseShift),
            "cross correlation" => Some(Self::CrossCorrelation),
            "spacing (in Angstroms) up to which CTF rings were fit successfully" => {
                Some(Self::FitResolution)
            }
            "Estimated tilt axis angle" => Some(Self::TiltAxisAngle),
            "Estimated tilt angle" => Some(Self::TiltAngle),
            "Estimated sample thickness (in Angstroms)" => Some(Self::Thickness),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MicrographNumber => "micrograph number",
            Self::Defocus1 => "defocus 1",
            Self::Defocus2 => "defocus 2",
            Self::Azimuth => "azimuth of astigmatism",
            Self::PhaseShift => "additional phase shift",
            Self::CrossCorrelation => "cross correlation",
            Self::FitResolution => "fit resolution",
            Self::TiltAxisAngle => "tilt axis angle",
            Self::TiltAngle => "tilt angle",
            Self::Thickness => "sample thickness",
        }
    }
}

/// Per-frequency curves in an `_avrot.txt` file, one line each per micrograph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AvrotColumn {
    SpatialFrequency,
    RotationalAverageNoAstigmatism,
    RotationalAverage,
    CtfFit,
    CrossCorrelation,
    NoiseTwoSigma,
}

impl AvrotColumn {
    pub fn from_description(description: &str) -> Option<Self> {
        match description.trim() {
            "spatial frequency (1/Angstroms)" => Some(Self::SpatialFrequency),
            "1D rotational average of spectrum (assuming no astigmatism)" => {
                Some(Self::RotationalAverageNoAstigmatism)
            }
            "1D rotational average of spectrum" => Some(Self::RotationalAverage),
            "CTF fit" => Some(Self::CtfFit),
            "cross-correlation between spectrum and CTF fit" => Some(Self::CrossCorrelation),
            "2sigma of expected cross correlation of noise" => Some(Self::NoiseTwoSigma),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SpatialFrequency => "spatial_frequency",
            Self::RotationalAverageNoAstigmatism => "rotational_average_no_astigmatism",
            Self::RotationalAverage => "rotational_average",
            Self::CtfFit => "ctf_fit",
            Self::CrossCorrelation => "fit_cross_correlation",
            Self::NoiseTwoSigma => "noise_two_sigma",
        }
    }
}

/// Convert a phase shift in radians to degrees folded into `[0, 90]`
pub fn phase_shift_degrees(radians: f64) -> f64 {
    let degrees = radians.to_degrees().rem_euclid(180.0);
    if degrees > 90.0 {
        180.0 - degrees
    } else {
        degrees
    }
}

/// Run parameters from header lines one to four
#[derive(Debug, Clone, PartialEq)]
pub struct CtffindHeader {
    pub version: String,
    pub run_on: String,
    pub input_file: String,
    pub micrograph_count: usize,
    pub pixel_size: f64,
    pub voltage: f64,
    pub spherical_aberration: f64,
    pub amplitude_contrast: f64,
    pub box_size: u32,
    pub min_resolution: f64,
    pub max_resolution: f64,
    pub min_defocus: f64,
    pub max_defocus: f64,
}

/// First word after the leading `#`, without punctuation
fn keyword(line: &str) -> String {
    line.trim_start_matches('#')
        .split_whitespace()
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect()
}

fn expect_keyword(
    line_number: usize,
    line: &str,
    expected: &'static str,
) -> Result<(), CtffindResultError> {
    if line.starts_with('#') && keyword(line) == expected {
        Ok(())
    } else {
        Err(CtffindResultError::BadHeaderLine {
            line: line_number,
            expected,
        })
    }
}

/// First token of every `;` separated segment that parses as a number
fn segment_numbers(line: &str) -> Vec<Option<f64>> {
    line.trim_start_matches('#')
        .split(';')
        .map(|segment| {
            segment
                .split_whitespace()
                .find_map(|token| token.trim_end_matches(',').parse::<f64>().ok())
        })
        .collect()
}

fn take_number(
    numbers: &[Option<f64>],
    index: usize,
    line: usize,
    field: &'static str,
) -> Result<f64, CtffindResultError> {
    numbers
        .get(index)
        .copied()
        .flatten()
        .ok_or(CtffindResultError::MissingHeaderValue { line, field })
}

impl CtffindHeader {
    /// Parse the first four header lines
    pub fn parse(lines: &[&str]) -> Result<Self, CtffindResultError> {
        let [first, second, third, fourth] = lines else {
            return Err(CtffindResultError::MissingHeaderValue {
                line: lines.len() + 1,
                field: "header",
            });
        };

        expect_keyword(1, first, "Output")?;
        let (version, run_on) = match first.split_once("run on") {
            Some((head, tail)) => (head, tail.trim().to_string()),
            None => (*first, String::new()),
        };
        let version = version
            .split_whitespace()
            .skip_while(|word| *word != "version")
            .nth(1)
            .map(|word| word.trim_end_matches(',').to_string())
            .ok_or(CtffindResultError::MissingHeaderValue {
                line: 1,
                field: "CTFFind version",
            })?;

        expect_keyword(2, second, "Input")?;
        let mut segments = second.trim_start_matches('#').split(';');
        let input_file = segments
            .next()
            .and_then(|segment| segment.split_once(':'))
            .map(|(_, file)| file.trim().to_string())
            .filter(|file| !file.is_empty())
            .ok_or(CtffindResultError::MissingHeaderValue {
                line: 2,
                field: "input file",
            })?;
        let numbers = segment_numbers(second);
        let micrograph_count = take_number(&numbers, 1, 2, "number of micrographs")? as usize;

        expect_keyword(3, third, "Pixel")?;
        let numbers = segment_numbers(third);
        let pixel_size = take_number(&numbers, 0, 3, "pixel size")?;
        let voltage = take_number(&numbers, 1, 3, "acceleration voltage")?;
        let spherical_aberration = take_number(&numbers, 2, 3, "spherical aberration")?;
        let amplitude_contrast = take_number(&numbers, 3, 3, "amplitude contrast")?;

        expect_keyword(4, fourth, "Box")?;
        let numbers = segment_numbers(fourth);
        let box_size = take_number(&numbers, 0, 4, "box size")? as u32;
        let min_resolution = take_number(&numbers, 1, 4, "min. res.")?;
        let max_resolution = take_number(&numbers, 2, 4, "max. res.")?;
        let min_defocus = take_number(&numbers, 3, 4, "min. def.")?;
        let max_defocus = take_number(&numbers, 4, 4, "max. def.")?;

        Ok(Self {
            version,
            run_on,
            input_file,
            micrograph_count,
            pixel_size,
            voltage,
            spherical_aberration,
            amplitude_contrast,
            box_size,
            min_resolution,
            max_resolution,
            min_defocus,
            max_defocus,
        })
    }
}

/// `#N - description` pairs of a column declaration line, placed at index N - 1
fn declared_columns<T>(
    line: &str,
    recognise: impl Fn(&str) -> Option<T>,
) -> Vec<Option<T>> {
    let mut columns: Vec<Option<T>> = Vec::new();
    for capture in column_pattern().captures_iter(line) {
        let Ok(number) = capture[1].parse::<usize>() else {
            continue;
        };
        if number == 0 {
            continue;
        }
        let description = capture[2].trim();
        let column = recognise(description);
        if column.is_none() {
            log::warn!("Ignoring unknown CTFFIND column #{number}: {description}");
        }
        if columns.len() < number {
            columns.resize_with(number, || None);
        }
        columns[number - 1] = column;
    }
    columns
}

fn parse_values(line_number: usize, line: &str) -> Result<Vec<f64>, CtffindResultError> {
    line.split_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| CtffindResultError::BadNumber {
                    line: line_number,
                    value: token.to_string(),
                })
        })
        .collect()
}

/// Data lines with their 1-based line numbers, comments after the header dropped
fn data_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .skip(HEADER_LINES)
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(number, line)| {
            if line.starts_with('#') {
                log::warn!("Ignoring comment on data line {number}: {line}");
                return false;
            }
            !line.is_empty()
        })
}

/// One fitted micrograph (one row of a results file)
#[derive(Debug, Clone, PartialEq)]
pub struct CtffindRecord {
    pub micrograph_number: u32,
    pub defocus_1: f64,
    pub defocus_2: f64,
    pub azimuth: f64,
    /// Radians, as written by CTFFIND
    pub phase_shift: Option<f64>,
    pub cross_correlation: Option<f64>,
    pub fit_resolution: Option<f64>,
    pub tilt_axis_angle: Option<f64>,
    pub tilt_angle: Option<f64>,
    pub thickness: Option<f64>,
}

impl CtffindRecord {
    pub fn phase_shift_degrees(&self) -> Option<f64> {
        self.phase_shift.map(phase_shift_degrees)
    }

    pub fn mean_defocus(&self) -> f64 {
        0.5 * (self.defocus_1 + self.defocus_2)
    }
}

/// Column positions resolved once from the declaration line
struct RecordLayout {
    width: usize,
    positions: FxHashMap<CtffindColumn, usize>,
}

impl RecordLayout {
    fn new(columns: &[Option<CtffindColumn>]) -> Result<Self, CtffindResultError> {
        let positions: FxHashMap<CtffindColumn, usize> = columns
            .iter()
            .enumerate()
            .filter_map(|(index, column)| column.map(|column| (column, index)))
            .collect();
        for required in [
            CtffindColumn::MicrographNumber,
            CtffindColumn::Defocus1,
            CtffindColumn::Defocus2,
            CtffindColumn::Azimuth,
        ] {
            if !positions.contains_key(&required) {
                return Err(CtffindResultError::MissingColumn(required.name()));
            }
        }
        Ok(Self {
            width: columns.len(),
            positions,
        })
    }

    fn get(&self, values: &[f64], column: CtffindColumn) -> Option<f64> {
        self.positions.get(&column).map(|index| values[*index])
    }

    fn record(&self, values: &[f64]) -> CtffindRecord {
        CtffindRecord {
            micrograph_number: self
                .get(values, CtffindColumn::MicrographNumber)
                .unwrap_or_default() as u32,
            defocus_1: self.get(values, CtffindColumn::Defocus1).unwrap_or_default(),
            defocus_2: self.get(values, CtffindColumn::Defocus2).unwrap_or_default(),
            azimuth: self.get(values, CtffindColumn::Azimuth).unwrap_or_default(),
            phase_shift: self.get(values, CtffindColumn::PhaseShift),
            cross_correlation: self.get(values, CtffindColumn::CrossCorrelation),
            fit_resolution: self.get(values, CtffindColumn::FitResolution),
            tilt_axis_angle: self.get(values, CtffindColumn::TiltAxisAngle),
            tilt_angle: self.get(values, CtffindColumn::TiltAngle),
            thickness: self.get(values, CtffindColumn::Thickness),
        }
    }
}

/// A parsed results file
#[derive(Debug, Clone, PartialEq)]
pub struct CtffindResult {
    pub path: PathBuf,
    pub header: CtffindHeader,
    pub records: Vec<CtffindRecord>,
}

/// Curves of one micrograph in a rotational average file
#[derive(Debug, Clone, PartialEq)]
pub struct AvrotMicrograph {
    pub micrograph_number: u32,
    pub curves: Vec<(AvrotColumn, Vec<f64>)>,
}

impl AvrotMicrograph {
    pub fn curve(&self, column: AvrotColumn) -> Option<&[f64]> {
        self.curves
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, values)| values.as_slice())
    }
}

/// A parsed `_avrot.txt` file
#[derive(Debug, Clone, PartialEq)]
pub struct AvrotTable {
    pub path: PathBuf,
    pub header: CtffindHeader,
    pub lines_per_micrograph: usize,
    pub micrographs: Vec<AvrotMicrograph>,
}

impl AvrotTable {
    pub fn micrograph(&self, number: u32) -> Option<&AvrotMicrograph> {
        self.micrographs
            .iter()
            .find(|micrograph| micrograph.micrograph_number == number)
    }
}

/// Either kind of CTFFIND text output, told apart by header line five
#[derive(Debug, Clone, PartialEq)]
pub enum CtffindOutput {
    Results(CtffindResult),
    Avrot(AvrotTable),
}

impl CtffindOutput {
    pub fn read(path: &Path) -> Result<Self, CtffindResultError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, CtffindResultError> {
        let header_lines: Vec<&str> = text.lines().take(HEADER_LINES).map(str::trim).collect();
        if header_lines.len() < HEADER_LINES {
            return Err(CtffindResultError::TruncatedHeader(path.to_path_buf()));
        }
        let header = CtffindHeader::parse(&header_lines[..4])?;
        let declaration = header_lines[4];

        if let Some(capture) = lines_per_micrograph_pattern().captures(declaration) {
            let lines_per_micrograph = capture[1].parse::<usize>().unwrap_or(0);
            let columns = declared_columns(declaration, AvrotColumn::from_description);
            let micrographs = parse_avrot(text, lines_per_micrograph, &columns)?;
            return Ok(Self::Avrot(AvrotTable {
                path: path.to_path_buf(),
                header,
                lines_per_micrograph,
                micrographs,
            }));
        }

        expect_keyword(5, declaration, "Columns")?;
        let columns = declared_columns(declaration, CtffindColumn::from_description);
        let layout = RecordLayout::new(&columns)?;
        let mut records = Vec::new();
        for (line_number, line) in data_lines(text) {
            let values = parse_values(line_number, line)?;
            if values.len() != layout.width {
                return Err(CtffindResultError::RowWidth {
                    line: line_number,
                    found: values.len(),
                    expected: layout.width,
                });
            }
            records.push(layout.record(&values));
        }
        Ok(Self::Results(CtffindResult {
            path: path.to_path_buf(),
            header,
            records,
        }))
    }
}

fn parse_avrot(
    text: &str,
    lines_per_micrograph: usize,
    columns: &[Option<AvrotColumn>],
) -> Result<Vec<AvrotMicrograph>, CtffindResultError> {
    if lines_per_micrograph == 0 {
        return Err(CtffindResultError::MissingHeaderValue {
            line: 5,
            field: "lines per micrograph",
        });
    }
    let rows = data_lines(text)
        .map(|(line_number, line)| Ok((line_number, parse_values(line_number, line)?)))
        .collect::<Result<Vec<(usize, Vec<f64>)>, CtffindResultError>>()?;
    let trailing = rows.len() % lines_per_micrograph;
    if trailing != 0 {
        return Err(CtffindResultError::TruncatedAvrot {
            found: trailing,
            expected: lines_per_micrograph,
        });
    }

    let mut micrographs = Vec::with_capacity(rows.len() / lines_per_micrograph);
    for (index, chunk) in rows.chunks(lines_per_micrograph).enumerate() {
        let width = chunk[0].1.len();
        let mut curves = Vec::new();
        for (row, (line_number, values)) in chunk.iter().enumerate() {
            if values.len() != width {
                return Err(CtffindResultError::RowWidth {
                    line: *line_number,
                    found: values.len(),
                    expected: width,
                });
            }
            if let Some(Some(column)) = columns.get(row) {
                curves.push((*column, values.clone()));
            }
        }
        micrographs.push(AvrotMicrograph {
            micrograph_number: index as u32 + 1,
            curves,
        });
    }
    Ok(micrographs)
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

/// Results of many files, with rotational averages attached where available
#[derive(Debug, Default)]
pub struct CtffindSummary {
    results: Vec<CtffindResult>,
    avrots: Vec<AvrotTable>,
}

impl CtffindSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every file, sorting it by its header into results or rotational averages
    pub fn from_files(paths: &[PathBuf]) -> Result<Self, CtffindResultError> {
        let mut summary = Self::new();
        for path in paths.iter() {
            summary.add(CtffindOutput::read(path)?);
        }
        Ok(summary)
    }

    pub fn add(&mut self, output: CtffindOutput) {
        match output {
            CtffindOutput::Results(result) => self.results.push(result),
            CtffindOutput::Avrot(table) => self.avrots.push(table),
        }
    }

    pub fn results(&self) -> &[CtffindResult] {
        &self.results
    }

    pub fn record_count(&self) -> usize {
        self.results.iter().map(|result| result.records.len()).sum()
    }

    /// Rotational average matching a record, joined on input file and micrograph number
    pub fn avrot_for(&self, input_file: &str, micrograph_number: u32) -> Option<&AvrotMicrograph> {
        self.avrots
            .iter()
            .filter(|table| table.header.input_file == input_file)
            .find_map(|table| table.micrograph(micrograph_number))
    }

    /// Render every record as one CSV row. Rotational average curves are written as
    /// space separated lists when a matching `_avrot.txt` was read.
    pub fn to_csv(&self) -> String {
        let with_avrot = !self.avrots.is_empty();
        let mut csv = String::from(
            "file,input_file,micrograph_number,defocus_1,defocus_2,azimuth,\
             phase_shift_deg,cross_correlation,fit_resolution,tilt_axis_angle,\
             tilt_angle,thickness,pixel_size,voltage,spherical_aberration,\
             amplitude_contrast,ctffind_version",
        );
        let avrot_columns = [
            AvrotColumn::SpatialFrequency,
            AvrotColumn::RotationalAverageNoAstigmatism,
            AvrotColumn::RotationalAverage,
            AvrotColumn::CtfFit,
            AvrotColumn::CrossCorrelation,
            AvrotColumn::NoiseTwoSigma,
        ];
        if with_avrot {
            for column in avrot_columns.iter() {
                let _ = write!(csv, ",{}", column.name());
            }
        }
        csv.push('\n');

        for result in self.results.iter() {
            let header = &result.header;
            for record in result.records.iter() {
                let _ = write!(
                    csv,
                    "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                    csv_field(&result.path.display().to_string()),
                    csv_field(&header.input_file),
                    record.micrograph_number,
                    record.defocus_1,
                    record.defocus_2,
                    record.azimuth,
                    optional(record.phase_shift_degrees()),
                    optional(record.cross_correlation),
                    optional(record.fit_resolution),
                    optional(record.tilt_axis_angle),
                    optional(record.tilt_angle),
                    optional(record.thickness),
                    header.pixel_size,
                    header.voltage,
                    header.spherical_aberration,
                    header.amplitude_contrast,
                    csv_field(&header.version),
                );
                if with_avrot {
                    let avrot = self.avrot_for(&header.input_file, record.micrograph_number);
                    for column in avrot_columns.iter() {
                        let values = avrot
                            .and_then(|micrograph| micrograph.curve(*column))
                            .map(|values| {
                                values
                                    .iter()
                                    .map(|v| v.to_string())
                                    .collect::<Vec<String>>()
                                    .join(" ")
                            })
                            .unwrap_or_default();
                        let _ = write!(csv, ",{values}");
                    }
                }
                csv.push('\n');
            }
        }
        csv
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), CtffindResultError> {
        std::fs::write(path, self.to_csv())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const HEADER: &str = "\
# Output from CTFFind version 4.1.14, run on 2023-05-02 14:11:05
# Input file: /data/mic_001.mrc ; Number of micrographs: 1
# Pixel size: 1.060 Angstroms ; acceleration voltage: 300.0 keV ; spherical aberration: 2.70 mm ; amplitude contrast: 0.07
# Box size: 512 pixels ; min. res.: 30.0 Angstroms ; max. res.: 5.0 Angstroms ; min. def.: 5000.0 um; max. def. 50000.0 um
";

    fn results_text() -> String {
        format!(
            "{HEADER}# Columns: #1 - micrograph number; #2 - defocus 1 [Angstroms]; #3 - defocus 2; \
             #4 - azimuth of astigmatism; #5 - additional phase shift [radians]; #6 - cross correlation; \
             #7 - spacing (in Angstroms) up to which CTF rings were fit successfully\n\
             1.000000 12345.67 12001.00 -45.2 3.141593 0.1234 4.2\n"
        )
    }

    fn avrot_text() -> String {
        format!(
            "{HEADER}# 6 lines per micrograph: #1 - spatial frequency (1/Angstroms); \
             #2 - 1D rotational average of spectrum (assuming no astigmatism); \
             #3 - 1D rotational average of spectrum; #4 - CTF fit; \
             #5 - cross-correlation between spectrum and CTF fit; \
             #6 - 2sigma of expected cross correlation of noise\n\
             0.0 0.1 0.2\n1 2 3\n4 5 6\n0.5 0.6 0.7\n0.9 0.8 0.7\n0.01 0.02 0.03\n"
        )
    }

    #[rstest]
    #[case(0.0, 0.0)]
    #[case(std::f64::consts::FRAC_PI_4, 45.0)]
    #[case(std::f64::consts::FRAC_PI_2 + std::f64::consts::FRAC_PI_4, 45.0)]
    #[case(std::f64::consts::PI, 0.0)]
    #[case(-std::f64::consts::FRAC_PI_4, 45.0)]
    fn phase_shift_folding(#[case] radians: f64, #[case] degrees: f64) {
        assert!((phase_shift_degrees(radians) - degrees).abs() < 1e-9);
    }

    #[test]
    fn header_values() {
        let text = results_text();
        let lines: Vec<&str> = text.lines().take(4).collect();
        let header = CtffindHeader::parse(&lines).unwrap();
        assert_eq!(header.version, "4.1.14");
        assert_eq!(header.run_on, "2023-05-02 14:11:05");
        assert_eq!(header.input_file, "/data/mic_001.mrc");
        assert_eq!(header.micrograph_count, 1);
        assert_eq!(header.pixel_size, 1.06);
        assert_eq!(header.amplitude_contrast, 0.07);
        assert_eq!(header.box_size, 512);
        assert_eq!(header.max_defocus, 50000.0);
    }

    #[test]
    fn results_rows() {
        let output = CtffindOutput::parse(Path::new("mic_001_ctf.txt"), &results_text()).unwrap();
        let CtffindOutput::Results(result) = output else {
            panic!("expected a results file");
        };
        assert_eq!(result.records.len(), 1);
        let record = &result.records[0];
        assert_eq!(record.micrograph_number, 1);
        assert_eq!(record.defocus_2, 12001.0);
        assert_eq!(record.fit_resolution, Some(4.2));
        assert_eq!(record.thickness, None);
        assert!(record.phase_shift_degrees().unwrap() < 1e-3);
    }

    #[test]
    fn wrong_keyword_is_rejected() {
        let text = results_text().replacen("# Pixel", "# Pitch", 1);
        assert!(matches!(
            CtffindOutput::parse(Path::new("x.txt"), &text),
            Err(CtffindResultError::BadHeaderLine { line: 3, .. })
        ));
    }

    #[test]
    fn short_row_is_rejected() {
        let text = format!("{}2 1 2 3\n", results_text());
        assert!(matches!(
            CtffindOutput::parse(Path::new("x.txt"), &text),
            Err(CtffindResultError::RowWidth {
                line: 7,
                found: 4,
                expected: 7
            })
        ));
    }

    #[test]
    fn avrot_curves() {
        let output = CtffindOutput::parse(Path::new("mic_001_ctf_avrot.txt"), &avrot_text()).unwrap();
        let CtffindOutput::Avrot(table) = output else {
            panic!("expected an avrot file");
        };
        assert_eq!(table.lines_per_micrograph, 6);
        assert_eq!(table.micrographs.len(), 1);
        let micrograph = table.micrograph(1).unwrap();
        assert_eq!(
            micrograph.curve(AvrotColumn::CtfFit),
            Some([0.5, 0.6, 0.7].as_slice())
        );
    }

    #[test]
    fn truncated_avrot() {
        let text = format!("{}0.1 0.2 0.3\n", avrot_text());
        assert!(matches!(
            CtffindOutput::parse(Path::new("x_avrot.txt"), &text),
            Err(CtffindResultError::TruncatedAvrot {
                found: 1,
                expected: 6
            })
        ));
    }

    #[test]
    fn summary_joins_avrot() {
        let mut summary = CtffindSummary::new();
        summary.add(CtffindOutput::parse(Path::new("a_ctf.txt"), &results_text()).unwrap());
        summary.add(CtffindOutput::parse(Path::new("a_ctf_avrot.txt"), &avrot_text()).unwrap());
        assert_eq!(summary.record_count(), 1);
        let csv = summary.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("noise_two_sigma"));
        assert!(lines[1].starts_with("a_ctf.txt,/data/mic_001.mrc,1,12345.67,12001,-45.2,"));
        assert!(lines[1].ends_with(",0.01 0.02 0.03"));
    }

    #[test]
    fn truncated_header() {
        assert!(matches!(
            CtffindOutput::parse(Path::new("x.txt"), "# Output from CTFFind\n"),
            Err(CtffindResultError::TruncatedHeader(_))
        ));
    }
}
