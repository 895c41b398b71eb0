use fxhash::FxHashSet;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::error::{FilterError, StarError};
use super::star::{StarFile, StarKind, StarTable, IMAGE_NAME, MICROGRAPH_NAME, MOVIE_NAME};

/// Bytes read when classifying a reference STAR file
pub const SNIFF_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Keep rows whose key is referenced
    Extract,
    /// Keep rows whose key is not referenced
    Exclude,
}

/// What a reference input contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    ParticlesStar,
    MicrographsStar,
    /// Micrograph selection made on coarsened (`<stem>_c<N>`) images
    CoarsenedMicrographsStar,
    /// Plain text, one micrograph name per line
    MicrographsTxt,
}

/// How keys are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    /// Exact image name, `000001@Extract/job010/mic.mrcs`
    Particles,
    /// File stem of the micrograph, `mic`
    Micrographs,
}

impl ReferenceKind {
    pub fn family(&self) -> KeyFamily {
        match self {
            Self::ParticlesStar => KeyFamily::Particles,
            _ => KeyFamily::Micrographs,
        }
    }
}

fn coarsened_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(.+)_c\d+$").expect("valid coarsening pattern"))
}

/// File name of a path with its directories and last extension removed
pub fn micrograph_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// `mic_c8` -> `Some("mic")`, anything without a coarsening suffix -> `None`
pub fn strip_coarsening(stem: &str) -> Option<&str> {
    coarsened_pattern()
        .captures(stem)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Decide what a reference file holds. STAR files are classified from their header and
/// first rows; anything else is treated as a plain list of micrograph names.
pub fn classify_reference(path: &Path) -> Result<ReferenceKind, FilterError> {
    if path.extension().and_then(|ext| ext.to_str()) != Some("star") {
        log::warn!(
            "{} is not a STAR file; reading it as a list of micrograph names",
            path.display()
        );
        return Ok(ReferenceKind::MicrographsTxt);
    }
    let header = StarFile::sniff(path, SNIFF_LIMIT)?;
    match header.kind()? {
        StarKind::Particles => Ok(ReferenceKind::ParticlesStar),
        StarKind::Micrographs | StarKind::Movies => {
            let table = header.main_table()?;
            let key = key_column(table, header.kind()?)?;
            let coarsened = table
                .rows()
                .first()
                .is_some_and(|row| strip_coarsening(&micrograph_stem(&row[key])).is_some());
            if coarsened {
                Ok(ReferenceKind::CoarsenedMicrographsStar)
            } else {
                Ok(ReferenceKind::MicrographsStar)
            }
        }
    }
}

fn key_column(table: &StarTable, kind: StarKind) -> Result<usize, StarError> {
    table
        .column(kind.key_field())
        .ok_or_else(|| StarError::MissingField(kind.key_field().to_string()))
}

/// Normalised keys referenced by one file
pub fn reference_keys(path: &Path, kind: ReferenceKind) -> Result<Vec<String>, FilterError> {
    match kind {
        ReferenceKind::MicrographsTxt => Ok(std::fs::read_to_string(path)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(micrograph_stem)
            .collect()),
        ReferenceKind::ParticlesStar => {
            let star = StarFile::read(path)?;
            let keys = star
                .main_table()?
                .column_values(IMAGE_NAME)?
                .map(String::from)
                .collect();
            Ok(keys)
        }
        ReferenceKind::MicrographsStar | ReferenceKind::CoarsenedMicrographsStar => {
            let star = StarFile::read(path)?;
            let kind_field = star.kind()?.key_field();
            let keys = star
                .main_table()?
                .column_values(kind_field)?
                .map(|name| {
                    let stem = micrograph_stem(name);
                    match strip_coarsening(&stem) {
                        Some(base) if kind == ReferenceKind::CoarsenedMicrographsStar => {
                            base.to_string()
                        }
                        _ => stem,
                    }
                })
                .collect();
            Ok(keys)
        }
    }
}

/// The union of keys from a set of reference files of one family
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    family: KeyFamily,
    keys: FxHashSet<String>,
}

impl ReferenceSet {
    pub fn new<I: IntoIterator<Item = String>>(family: KeyFamily, keys: I) -> Self {
        Self {
            family,
            keys: keys.into_iter().collect(),
        }
    }

    /// Classify and read every reference file. All must belong to one key family.
    pub fn from_files(paths: &[PathBuf]) -> Result<Self, FilterError> {
        if paths.is_empty() {
            return Err(FilterError::NoReferences);
        }
        let mut family: Option<KeyFamily> = None;
        let mut keys: FxHashSet<String> = FxHashSet::default();
        for path in paths {
            let kind = classify_reference(path)?;
            match family {
                Some(existing) if existing != kind.family() => {
                    return Err(FilterError::MixedReferenceTypes(paths.to_vec()));
                }
                _ => family = Some(kind.family()),
            }
            let found = reference_keys(path, kind)?;
            log::info!(
                "Read {} reference key(s) from {} ({kind:?})",
                found.len(),
                path.display()
            );
            keys.extend(found);
        }
        Ok(Self {
            family: family.unwrap_or(KeyFamily::Micrographs),
            keys,
        })
    }

    pub fn family(&self) -> KeyFamily {
        self.family
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

/// Stem of the micrograph a particle came from: the micrograph name when present, or
/// else the stack path after `@` in the image name.
fn particle_micrograph_stem(
    row: &[String],
    micrograph: Option<usize>,
    image: Option<usize>,
) -> Option<String> {
    if let Some(col) = micrograph {
        return Some(micrograph_stem(&row[col]));
    }
    let name = &row[image?];
    let stack = name.split_once('@').map_or(name.as_str(), |(_, path)| path);
    Some(micrograph_stem(stack))
}

/// Compute the comparison key of every row of the primary table
pub fn row_keys(star: &StarFile, family: KeyFamily) -> Result<Vec<String>, FilterError> {
    let kind = star.kind()?;
    let table = star.main_table()?;
    match (kind, family) {
        (StarKind::Particles, KeyFamily::Particles) => Ok(table
            .column_values(IMAGE_NAME)?
            .map(String::from)
            .collect()),
        (StarKind::Particles, KeyFamily::Micrographs) => {
            let micrograph = table.column(MICROGRAPH_NAME);
            let image = table.column(IMAGE_NAME);
            table
                .rows()
                .iter()
                .map(|row| {
                    particle_micrograph_stem(row, micrograph, image)
                        .ok_or_else(|| StarError::MissingField(MICROGRAPH_NAME.to_string()))
                })
                .collect::<Result<Vec<String>, StarError>>()
                .map_err(FilterError::from)
        }
        (StarKind::Micrographs, KeyFamily::Micrographs) => Ok(table
            .column_values(MICROGRAPH_NAME)?
            .map(micrograph_stem)
            .collect()),
        (StarKind::Movies, KeyFamily::Micrographs) => Ok(table
            .column_values(MOVIE_NAME)?
            .map(micrograph_stem)
            .collect()),
        (table_kind, KeyFamily::Particles) => Err(FilterError::IncompatibleReferences {
            table: table_kind.to_string(),
        }),
    }
}

/// Keep or drop rows of the main table by reference membership.
///
/// The rows that survive keep their original order, and every other block (optics in
/// particular) is copied unchanged.
pub fn filter_star_file(
    star: &StarFile,
    references: &ReferenceSet,
    mode: FilterMode,
) -> Result<StarFile, FilterError> {
    let keys = row_keys(star, references.family())?;
    let table = star.main_table()?;
    let keep = |key: &str| match mode {
        FilterMode::Extract => references.contains(key),
        FilterMode::Exclude => !references.contains(key),
    };
    let rows: Vec<Vec<String>> = table
        .rows()
        .iter()
        .zip(keys.iter())
        .filter(|(_, key)| keep(key.as_str()))
        .map(|(row, _)| row.clone())
        .collect();
    log::info!("Kept {} of {} row(s) ({mode:?})", rows.len(), table.len());

    let filtered = table.with_rows(rows)?;
    let mut output = star.clone();
    if let Some(block) = output.main_block_mut() {
        block.table = Some(filtered);
    }
    Ok(output)
}

pub fn extract(star: &StarFile, references: &ReferenceSet) -> Result<StarFile, FilterError> {
    filter_star_file(star, references, FilterMode::Extract)
}

pub fn exclude(star: &StarFile, references: &ReferenceSet) -> Result<StarFile, FilterError> {
    filter_star_file(star, references, FilterMode::Exclude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const PARTICLES: &str = "
# version 30001

data_optics

loop_
_rlnOpticsGroup #1
1

# version 30001

data_particles

loop_
_rlnImageName #1
_rlnMicrographName #2
000001@Extract/job010/Movies/mic_1.mrcs MotionCorr/job002/Movies/mic_1.mrc
000002@Extract/job010/Movies/mic_1.mrcs MotionCorr/job002/Movies/mic_1.mrc
000001@Extract/job010/Movies/mic_2.mrcs MotionCorr/job002/Movies/mic_2.mrc
000001@Extract/job010/Movies/mic_3.mrcs MotionCorr/job002/Movies/mic_3.mrc
";

    const COARSENED: &str = "
data_micrographs

loop_
_rlnMicrographName #1
Coarsen/mic_3_c8.mrc
Coarsen/mic_1_c8.mrc
";

    fn image_names(star: &StarFile) -> Vec<String> {
        star.main_table()
            .unwrap()
            .column_values(IMAGE_NAME)
            .unwrap()
            .map(String::from)
            .collect()
    }

    #[rstest]
    #[case("MotionCorr/job002/mic_1.mrc", "mic_1")]
    #[case("mic_1.tiff", "mic_1")]
    #[case("mic_1", "mic_1")]
    fn stems(#[case] name: &str, #[case] stem: &str) {
        assert_eq!(micrograph_stem(name), stem);
    }

    #[rstest]
    #[case("mic_1_c8", Some("mic_1"))]
    #[case("FoilHole_1_c12", Some("FoilHole_1"))]
    #[case("mic_1", None)]
    #[case("_c8", None)]
    fn coarsening_suffix(#[case] stem: &str, #[case] base: Option<&str>) {
        assert_eq!(strip_coarsening(stem), base);
    }

    #[test]
    fn extract_and_exclude_are_complementary() {
        let star = StarFile::parse(PARTICLES).unwrap();
        let refs = ReferenceSet::new(
            KeyFamily::Micrographs,
            vec![String::from("mic_1"), String::from("mic_3")],
        );
        let kept = extract(&star, &refs).unwrap();
        let dropped = exclude(&star, &refs).unwrap();
        let kept_names = image_names(&kept);
        let dropped_names = image_names(&dropped);
        assert_eq!(kept_names.len() + dropped_names.len(), 4);
        assert!(kept_names.iter().all(|name| !dropped_names.contains(name)));
        assert_eq!(
            kept_names,
            vec![
                "000001@Extract/job010/Movies/mic_1.mrcs",
                "000002@Extract/job010/Movies/mic_1.mrcs",
                "000001@Extract/job010/Movies/mic_3.mrcs",
            ]
        );
        assert_eq!(kept.optics(), star.optics());
    }

    #[test]
    fn particle_references_use_exact_names() {
        let star = StarFile::parse(PARTICLES).unwrap();
        let refs = ReferenceSet::new(
            KeyFamily::Particles,
            vec![String::from("000002@Extract/job010/Movies/mic_1.mrcs")],
        );
        let kept = extract(&star, &refs).unwrap();
        assert_eq!(kept.main_table().unwrap().len(), 1);
    }

    #[test]
    fn image_name_fallback() {
        let text = "data_particles\nloop_\n_rlnImageName #1\n1@Extract/mic_9.mrcs\n1@Extract/mic_8.mrcs\n";
        let star = StarFile::parse(text).unwrap();
        let keys = row_keys(&star, KeyFamily::Micrographs).unwrap();
        assert_eq!(keys, vec!["mic_9", "mic_8"]);
    }

    #[test]
    fn micrograph_table_rejects_particle_references() {
        let star = StarFile::parse(COARSENED).unwrap();
        let refs = ReferenceSet::new(KeyFamily::Particles, vec![]);
        assert!(matches!(
            extract(&star, &refs),
            Err(FilterError::IncompatibleReferences { .. })
        ));
    }

    #[test]
    fn coarsened_reference_file() {
        let dir = tempfile::tempdir().unwrap();
        let coarse = dir.path().join("selected_c8.star");
        std::fs::write(&coarse, COARSENED).unwrap();
        assert_eq!(
            classify_reference(&coarse).unwrap(),
            ReferenceKind::CoarsenedMicrographsStar
        );

        let refs = ReferenceSet::from_files(&[coarse]).unwrap();
        assert!(refs.contains("mic_1"));
        assert!(refs.contains("mic_3"));
        let star = StarFile::parse(PARTICLES).unwrap();
        let kept = extract(&star, &refs).unwrap();
        assert_eq!(kept.main_table().unwrap().len(), 3);
    }

    #[test]
    fn text_references_and_mixing() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("bad_micrographs.txt");
        std::fs::write(&list, "mic_2.mrc\n\n  mic_3.mrc  \n").unwrap();
        let particles = dir.path().join("particles.star");
        std::fs::write(&particles, PARTICLES).unwrap();

        let refs = ReferenceSet::from_files(&[list.clone()]).unwrap();
        assert_eq!(refs.len(), 2);
        let star = StarFile::parse(PARTICLES).unwrap();
        let kept = exclude(&star, &refs).unwrap();
        assert_eq!(kept.main_table().unwrap().len(), 2);

        assert!(matches!(
            ReferenceSet::from_files(&[list, particles]),
            Err(FilterError::MixedReferenceTypes(_))
        ));
        assert!(matches!(
            ReferenceSet::from_files(&[]),
            Err(FilterError::NoReferences)
        ));
    }
}
