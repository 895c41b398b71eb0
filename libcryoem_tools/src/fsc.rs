//! Fourier Shell Correlation curves from the usual export formats and the resolution
//! at which they cross a threshold.
use regex::Regex;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::error::FscError;

pub const GOLD_STANDARD_THRESHOLD: f64 = 0.143;
const BISECTION_STEPS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveKind {
    Fsc,
    HalfBit,
    ThreeSigma,
}

impl std::fmt::Display for CurveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fsc => write!(f, "FSC"),
            Self::HalfBit => write!(f, "half-bit"),
            Self::ThreeSigma => write!(f, "3-sigma"),
        }
    }
}

/// One sampled curve. `frequency` is in 1/Å.
#[derive(Debug, Clone, PartialEq)]
pub struct FscCurve {
    pub name: String,
    pub kind: CurveKind,
    pub pixel_size: f64,
    pub frequency: Vec<f64>,
    pub fsc: Vec<f64>,
    pub fraction_of_nyquist: Vec<f64>,
}

impl FscCurve {
    pub fn new(
        name: &str,
        kind: CurveKind,
        frequency: Vec<f64>,
        fsc: Vec<f64>,
        pixel_size: f64,
    ) -> Result<Self, FscError> {
        if !(pixel_size > 0.0) {
            return Err(FscError::BadPixelSize(pixel_size));
        }
        if frequency.len() != fsc.len() {
            return Err(FscError::LengthMismatch {
                name: name.to_string(),
                frequencies: frequency.len(),
                values: fsc.len(),
            });
        }
        let fraction_of_nyquist = frequency.iter().map(|f| 2.0 * pixel_size * f).collect();
        Ok(Self {
            name: name.to_string(),
            kind,
            pixel_size,
            frequency,
            fsc,
            fraction_of_nyquist,
        })
    }

    pub fn len(&self) -> usize {
        self.fsc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fsc.is_empty()
    }

    fn to_angstrom(&self, fraction: f64) -> f64 {
        2.0 * self.pixel_size / fraction
    }

    /// Resolution in Å where the curve first drops to `threshold`
    pub fn resolution(&self, threshold: f64) -> Option<f64> {
        resolution_at_threshold(&self.fraction_of_nyquist, &self.fsc, threshold)
            .map(|fraction| self.to_angstrom(fraction))
    }

    /// Resolution in Å where the curve first drops onto a reference curve such as
    /// half-bit
    pub fn resolution_against(&self, reference: &FscCurve) -> Option<f64> {
        resolution_at_curve(
            &self.fraction_of_nyquist,
            &self.fsc,
            &reference.fraction_of_nyquist,
            &reference.fsc,
        )
        .map(|fraction| self.to_angstrom(fraction))
    }

    /// `fraction_of_nyquist<TAB>fsc` per sample
    pub fn to_tsv(&self) -> String {
        let mut tsv = String::from("fraction_of_nyquist\tfsc\n");
        for (fraction, value) in self.fraction_of_nyquist.iter().zip(self.fsc.iter()) {
            let _ = writeln!(tsv, "{fraction:.4}\t{value:.4}");
        }
        tsv
    }
}

/// Piecewise-linear interpolation, clamped at both ends
pub fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let n = xs.len().min(ys.len());
    if n == 0 {
        return f64::NAN;
    }
    if x <= xs[0] {
        return ys[0];
    }
    if x >= xs[n - 1] {
        return ys[n - 1];
    }
    let upper = xs[..n].partition_point(|&sample| sample <= x).min(n - 1);
    let lower = upper - 1;
    let span = xs[upper] - xs[lower];
    if span == 0.0 {
        return ys[lower];
    }
    ys[lower] + (ys[upper] - ys[lower]) * (x - xs[lower]) / span
}

/// Locate the first sample pair where `difference` goes from positive to zero or
/// negative and bisect between them.
fn first_crossing(xs: &[f64], difference: impl Fn(f64) -> f64) -> Option<f64> {
    let pair = xs.windows(2).find(|pair| {
        let (a, b) = (difference(pair[0]), difference(pair[1]));
        a > 0.0 && b <= 0.0
    })?;
    let (mut low, mut high) = (pair[0], pair[1]);
    if difference(high) == 0.0 {
        return Some(high);
    }
    for _ in 0..BISECTION_STEPS {
        let middle = 0.5 * (low + high);
        if difference(middle) > 0.0 {
            low = middle;
        } else {
            high = middle;
        }
        if high - low <= f64::EPSILON * high.abs().max(1.0) {
            break;
        }
    }
    Some(0.5 * (low + high))
}

/// The frequency at which `fsc` first falls from above `threshold` to at or below it.
/// `None` when it never does.
pub fn resolution_at_threshold(frequencies: &[f64], fsc: &[f64], threshold: f64) -> Option<f64> {
    let n = frequencies.len().min(fsc.len());
    first_crossing(&frequencies[..n], |x| {
        interpolate(&frequencies[..n], &fsc[..n], x) - threshold
    })
}

/// Like [resolution_at_threshold] against a sampled threshold curve
pub fn resolution_at_curve(
    frequencies: &[f64],
    fsc: &[f64],
    threshold_frequencies: &[f64],
    threshold: &[f64],
) -> Option<f64> {
    if threshold_frequencies.is_empty() || threshold.is_empty() {
        return None;
    }
    let n = frequencies.len().min(fsc.len());
    first_crossing(&frequencies[..n], |x| {
        interpolate(&frequencies[..n], &fsc[..n], x)
            - interpolate(threshold_frequencies, threshold, x)
    })
}

fn coordinate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)<coordinate>\s*<x>([^<]*)</x>\s*<y>([^<]*)</y>\s*</coordinate>")
            .expect("coordinate pattern is valid")
    })
}

fn number(line: usize, text: &str) -> Result<f64, FscError> {
    text.trim().parse::<f64>().map_err(|_| FscError::BadNumber {
        line,
        value: text.trim().to_string(),
    })
}

fn curve_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// EMDB style XML, `<coordinate><x>1/Å</x><y>FSC</y></coordinate>`
pub fn parse_xml(name: &str, text: &str, pixel_size: f64) -> Result<Vec<FscCurve>, FscError> {
    let mut frequency = Vec::new();
    let mut fsc = Vec::new();
    for capture in coordinate_pattern().captures_iter(text) {
        let line_of = |index: usize| {
            let start = capture.get(index).map_or(0, |m| m.start());
            text[..start].matches('\n').count() + 1
        };
        frequency.push(number(line_of(1), &capture[1])?);
        fsc.push(number(line_of(2), &capture[2])?);
    }
    Ok(vec![FscCurve::new(name, CurveKind::Fsc, frequency, fsc, pixel_size)?])
}

/// RELION `.dat`: frequency and FSC per line
pub fn parse_dat(name: &str, text: &str, pixel_size: f64) -> Result<Vec<FscCurve>, FscError> {
    let mut frequency = Vec::new();
    let mut fsc = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() < 2 {
            return Err(FscError::RowWidth {
                line: index + 1,
                found: words.len(),
                expected: 2,
            });
        }
        frequency.push(number(index + 1, words[0])?);
        fsc.push(number(index + 1, words[1])?);
    }
    Ok(vec![FscCurve::new(name, CurveKind::Fsc, frequency, fsc, pixel_size)?])
}

/// cisTEM statistics: `C` comment lines, a curve per `Class N` section, seven columns
/// with the shell resolution in Å at index 1 and the FSC at index 4.
pub fn parse_cistem(name: &str, text: &str, pixel_size: f64) -> Result<Vec<FscCurve>, FscError> {
    const WIDTH: usize = 7;
    let mut sections: Vec<(String, Vec<f64>, Vec<f64>)> = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('C') {
            let comment = comment.trim();
            if comment.starts_with("Class") {
                sections.push((format!("{name} {comment}"), vec![], vec![]));
            }
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() != WIDTH {
            return Err(FscError::RowWidth {
                line: index + 1,
                found: words.len(),
                expected: WIDTH,
            });
        }
        let resolution = number(index + 1, words[1])?;
        let value = number(index + 1, words[4])?;
        if sections.is_empty() {
            sections.push((name.to_string(), vec![], vec![]));
        }
        if let Some((_, frequency, fsc)) = sections.last_mut() {
            frequency.push(1.0 / resolution);
            fsc.push(value);
        }
    }
    sections
        .into_iter()
        .filter(|(_, _, fsc)| !fsc.is_empty())
        .map(|(section, frequency, fsc)| {
            FscCurve::new(&section, CurveKind::Fsc, frequency, fsc, pixel_size)
        })
        .collect()
}

/// cryoSPARC export: a header naming the columns, `wave_number` then one or more
/// `fsc_*` curves. Wave numbers are shell indices and are scaled so that the shell
/// after the last one is Nyquist.
pub fn parse_cryosparc(
    name: &str,
    text: &str,
    pixel_size: f64,
) -> Result<Vec<FscCurve>, FscError> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());
    let Some((_, header)) = lines.next() else {
        return Ok(vec![]);
    };
    let columns: Vec<&str> = header.split_whitespace().collect();
    let mut waves = Vec::new();
    let mut values: Vec<Vec<f64>> = vec![Vec::new(); columns.len()];
    for (index, line) in lines {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() != columns.len() {
            return Err(FscError::RowWidth {
                line: index + 1,
                found: words.len(),
                expected: columns.len(),
            });
        }
        for (column, word) in words.iter().enumerate() {
            let value = number(index + 1, word)?;
            if column == 0 {
                waves.push(value);
            }
            values[column].push(value);
        }
    }
    let shells = waves.len() as f64;
    let nyquist = 0.5 / pixel_size;
    let frequency: Vec<f64> = waves.iter().map(|k| k / shells * nyquist).collect();
    columns
        .iter()
        .zip(values)
        .filter(|(column, _)| column.starts_with("fsc"))
        .map(|(column, fsc)| {
            FscCurve::new(
                &format!("{name} {column}"),
                CurveKind::Fsc,
                frequency.clone(),
                fsc,
                pixel_size,
            )
        })
        .collect()
}

/// IMAGIC `.csv`: `ring;frequency;FSC;half-bit;3-sigma`, non-numeric lines skipped
pub fn parse_imagic(name: &str, text: &str, pixel_size: f64) -> Result<Vec<FscCurve>, FscError> {
    const WIDTH: usize = 5;
    let mut frequency = Vec::new();
    let mut curves: [Vec<f64>; 3] = [vec![], vec![], vec![]];
    for (index, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split(';').map(str::trim).collect();
        if fields[0].parse::<f64>().is_err() {
            continue;
        }
        if fields.len() < WIDTH {
            return Err(FscError::RowWidth {
                line: index + 1,
                found: fields.len(),
                expected: WIDTH,
            });
        }
        frequency.push(number(index + 1, fields[1])?);
        for (curve, field) in curves.iter_mut().zip(fields[2..WIDTH].iter()) {
            curve.push(number(index + 1, field)?);
        }
    }
    let [fsc, half_bit, three_sigma] = curves;
    Ok(vec![
        FscCurve::new(name, CurveKind::Fsc, frequency.clone(), fsc, pixel_size)?,
        FscCurve::new(
            &format!("{name} half-bit"),
            CurveKind::HalfBit,
            frequency.clone(),
            half_bit,
            pixel_size,
        )?,
        FscCurve::new(
            &format!("{name} 3-sigma"),
            CurveKind::ThreeSigma,
            frequency,
            three_sigma,
            pixel_size,
        )?,
    ])
}

/// Read every curve in a file, choosing the reader by extension (and for `.txt`, by
/// whether the first line names cryoSPARC columns)
pub fn read_curves(path: &Path, pixel_size: f64) -> Result<Vec<FscCurve>, FscError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| FscError::UnsupportedFormat(path.to_path_buf()))?;
    let text = std::fs::read_to_string(path)?;
    let name = curve_name(path);
    let curves = match extension.as_str() {
        "xml" => parse_xml(&name, &text, pixel_size)?,
        "dat" => parse_dat(&name, &text, pixel_size)?,
        "txt" => {
            let first = text.lines().find(|line| !line.trim().is_empty()).unwrap_or("");
            if first.contains("wave_number") {
                parse_cryosparc(&name, &text, pixel_size)?
            } else {
                parse_cistem(&name, &text, pixel_size)?
            }
        }
        "csv" => parse_imagic(&name, &text, pixel_size)?,
        _ => return Err(FscError::UnsupportedFormat(path.to_path_buf())),
    };
    if curves.iter().all(FscCurve::is_empty) {
        return Err(FscError::Empty(path.to_path_buf()));
    }
    Ok(curves)
}

fn format_resolution(resolution: Option<f64>) -> String {
    match resolution {
        Some(angstrom) => format!("{angstrom:.2}"),
        None => String::from("not determined"),
    }
}

/// One summary line per FSC curve of a file: the resolution at `threshold` and, when
/// the file carries them, against its half-bit and 3-sigma curves.
pub fn report(path: &Path, curves: &[FscCurve], threshold: f64) -> String {
    let half_bit = curves.iter().find(|c| c.kind == CurveKind::HalfBit);
    let three_sigma = curves.iter().find(|c| c.kind == CurveKind::ThreeSigma);
    let mut text = String::new();
    for curve in curves.iter().filter(|c| c.kind == CurveKind::Fsc) {
        let _ = write!(
            text,
            "{}\t{}\t{}\t{}",
            path.display(),
            curve.name,
            curve.kind,
            format_resolution(curve.resolution(threshold))
        );
        if let Some(reference) = half_bit {
            let _ = write!(
                text,
                "\thalf-bit {}",
                format_resolution(curve.resolution_against(reference))
            );
        }
        if let Some(reference) = three_sigma {
            let _ = write!(
                text,
                "\t3-sigma {}",
                format_resolution(curve.resolution_against(reference))
            );
        }
        text.push('\n');
    }
    text
}

/// Write `<dir>/<curve name>.tsv` for every curve, returning the files written
pub fn write_tsv(dir: &Path, curves: &[FscCurve]) -> Result<Vec<PathBuf>, FscError> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(curves.len());
    for curve in curves.iter() {
        let file_name: String = curve
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{file_name}.tsv"));
        std::fs::write(&path, curve.to_tsv())?;
        written.push(path);
    }
    Ok(written)
}
