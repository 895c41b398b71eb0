use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use super::error::StarError;

/// Version reported for files without a `# version` comment
pub const UNKNOWN_VERSION: &str = "unknown";
/// Name of the RELION 3.1+ optics block
pub const OPTICS_BLOCK: &str = "optics";

pub const IMAGE_NAME: &str = "_rlnImageName";
pub const MICROGRAPH_NAME: &str = "_rlnMicrographName";
pub const MOVIE_NAME: &str = "_rlnMicrographMovieName";

/// A column declaration of a `loop_` table, e.g. `_rlnCoordinateX #1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StarField {
    pub name: String,
    pub index: usize,
}

impl StarField {
    pub fn new(name: &str, index: usize) -> Self {
        Self {
            name: name.to_string(),
            index,
        }
    }
}

/// A `loop_` table. Field indices always run from 1 to the number of fields and every
/// row has one value per field; both are checked when the table is built.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StarTable {
    fields: Vec<StarField>,
    rows: Vec<Vec<String>>,
}

impl StarTable {
    /// Build a table, sorting the fields by index and checking the table shape
    pub fn new(mut fields: Vec<StarField>, rows: Vec<Vec<String>>) -> Result<Self, StarError> {
        fields.sort_by_key(|field| field.index);
        let count = fields.len();
        for (position, field) in fields.iter().enumerate() {
            if field.index != position + 1 {
                return Err(StarError::BadFieldIndex {
                    name: field.name.clone(),
                    index: field.index,
                    count,
                });
            }
        }
        for (row_idx, row) in rows.iter().enumerate() {
            if row.len() != count {
                return Err(StarError::RowWidth {
                    row: row_idx + 1,
                    found: row.len(),
                    expected: count,
                });
            }
        }
        Ok(Self { fields, rows })
    }

    /// Build a table whose fields are numbered in the order given
    pub fn from_names(names: &[&str], rows: Vec<Vec<String>>) -> Result<Self, StarError> {
        let fields = names
            .iter()
            .enumerate()
            .map(|(idx, name)| StarField::new(name, idx + 1))
            .collect();
        Self::new(fields, rows)
    }

    pub fn fields(&self) -> &[StarField] {
        &self.fields
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Zero-based column position of a field
    pub fn column(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn value(&self, row: usize, name: &str) -> Option<&str> {
        let col = self.column(name)?;
        self.rows.get(row).map(|values| values[col].as_str())
    }

    /// Iterate over the values of a single column
    pub fn column_values(&self, name: &str) -> Result<impl Iterator<Item = &str>, StarError> {
        let col = self
            .column(name)
            .ok_or_else(|| StarError::MissingField(name.to_string()))?;
        Ok(self.rows.iter().map(move |row| row[col].as_str()))
    }

    /// Replace every value of a column with the result of `f`
    pub fn map_column<F>(&mut self, name: &str, mut f: F) -> Result<(), StarError>
    where
        F: FnMut(&str) -> String,
    {
        let col = self
            .column(name)
            .ok_or_else(|| StarError::MissingField(name.to_string()))?;
        for row in self.rows.iter_mut() {
            row[col] = f(&row[col]);
        }
        Ok(())
    }

    /// Same fields, different rows. The rows are checked against the fields.
    pub fn with_rows(&self, rows: Vec<Vec<String>>) -> Result<Self, StarError> {
        Self::new(self.fields.clone(), rows)
    }

    /// Drop a column and renumber the remaining fields
    pub fn without_field(&self, name: &str) -> Result<Self, StarError> {
        let col = self
            .column(name)
            .ok_or_else(|| StarError::MissingField(name.to_string()))?;
        let fields = self
            .fields
            .iter()
            .filter(|field| field.name != name)
            .enumerate()
            .map(|(idx, field)| StarField::new(&field.name, idx + 1))
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(idx, _)| *idx != col)
                    .map(|(_, value)| value.clone())
                    .collect()
            })
            .collect();
        Self::new(fields, rows)
    }
}

/// One `data_<name>` block: optional version comment, key/value pairs and at most one table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StarBlock {
    pub name: String,
    pub version: Option<String>,
    pub pairs: Vec<(String, String)>,
    pub table: Option<StarTable>,
}

impl StarBlock {
    pub fn new(name: &str, table: StarTable) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            pairs: vec![],
            table: Some(table),
        }
    }
}

/// The data type of a STAR file, judged from the name of its main block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarKind {
    Particles,
    Micrographs,
    Movies,
}

impl StarKind {
    pub fn from_block_name(name: &str) -> Option<Self> {
        match name {
            "particles" => Some(Self::Particles),
            "micrographs" => Some(Self::Micrographs),
            "movies" => Some(Self::Movies),
            _ => None,
        }
    }

    /// The field that identifies a record of this kind
    pub fn key_field(&self) -> &'static str {
        match self {
            Self::Particles => IMAGE_NAME,
            Self::Micrographs => MICROGRAPH_NAME,
            Self::Movies => MOVIE_NAME,
        }
    }
}

impl fmt::Display for StarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Particles => write!(f, "particles"),
            Self::Micrographs => write!(f, "micrographs"),
            Self::Movies => write!(f, "movies"),
        }
    }
}

/// An in-memory STAR document (RELION .star or crYOLO .cbox)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StarFile {
    pub blocks: Vec<StarBlock>,
}

impl StarFile {
    /// Read and parse a whole file
    pub fn read(path: &Path) -> Result<Self, StarError> {
        if !path.exists() {
            return Err(StarError::BadFilePath(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse only the leading part of a file: whole lines are read until at least `limit`
    /// bytes have been consumed. Used to classify large files by their header.
    pub fn sniff(path: &Path, limit: usize) -> Result<Self, StarError> {
        if !path.exists() {
            return Err(StarError::BadFilePath(path.to_path_buf()));
        }
        let mut reader = BufReader::new(File::open(path)?);
        let mut parser = Parser::default();
        let mut consumed = 0;
        let mut line = String::new();
        let mut number = 0;
        while consumed < limit {
            line.clear();
            let read = reader.read_line(&mut line)?;
            if read == 0 {
                break;
            }
            consumed += read;
            number += 1;
            parser.feed(number, &line)?;
        }
        parser.finish()
    }

    pub fn parse(text: &str) -> Result<Self, StarError> {
        let mut parser = Parser::default();
        for (idx, line) in text.lines().enumerate() {
            parser.feed(idx + 1, line)?;
        }
        parser.finish()
    }

    /// Write the canonical serialization of the document
    pub fn write(&self, path: &Path) -> Result<(), StarError> {
        std::fs::write(path, self.to_string())?;
        Ok(())
    }

    /// The version of the first block that declares one, or [`UNKNOWN_VERSION`]
    pub fn version(&self) -> &str {
        self.blocks
            .iter()
            .find_map(|block| block.version.as_deref())
            .unwrap_or(UNKNOWN_VERSION)
    }

    pub fn block(&self, name: &str) -> Option<&StarBlock> {
        self.blocks.iter().find(|block| block.name == name)
    }

    pub fn optics(&self) -> Option<&StarBlock> {
        self.block(OPTICS_BLOCK)
    }

    /// The first block that is not the optics block and carries a table
    pub fn main_block(&self) -> Option<&StarBlock> {
        self.blocks
            .iter()
            .find(|block| block.name != OPTICS_BLOCK && block.table.is_some())
    }

    pub fn main_block_mut(&mut self) -> Option<&mut StarBlock> {
        self.blocks
            .iter_mut()
            .find(|block| block.name != OPTICS_BLOCK && block.table.is_some())
    }

    pub fn main_table(&self) -> Result<&StarTable, StarError> {
        self.main_block()
            .and_then(|block| block.table.as_ref())
            .ok_or(StarError::NoDataTable)
    }

    pub fn main_table_mut(&mut self) -> Result<&mut StarTable, StarError> {
        self.main_block_mut()
            .and_then(|block| block.table.as_mut())
            .ok_or(StarError::NoDataTable)
    }

    pub fn kind(&self) -> Result<StarKind, StarError> {
        self.main_block()
            .and_then(|block| StarKind::from_block_name(&block.name))
            .ok_or(StarError::UnknownDataType)
    }

    /// Every table of the document, main and optics alike
    pub fn tables_mut(&mut self) -> impl Iterator<Item = &mut StarTable> {
        self.blocks
            .iter_mut()
            .filter_map(|block| block.table.as_mut())
    }
}

impl FromStr for StarFile {
    type Err = StarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for StarFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in self.blocks.iter() {
            writeln!(f)?;
            if let Some(version) = &block.version {
                writeln!(f, "# version {version}")?;
                writeln!(f)?;
            }
            writeln!(f, "data_{}", block.name)?;
            writeln!(f)?;
            for (key, value) in block.pairs.iter() {
                writeln!(f, "{key} {value}")?;
            }
            if let Some(table) = &block.table {
                if !block.pairs.is_empty() {
                    writeln!(f)?;
                }
                writeln!(f, "loop_")?;
                for field in table.fields() {
                    writeln!(f, "{} #{}", field.name, field.index)?;
                }
                for row in table.rows() {
                    writeln!(f, "{}", row.join(" "))?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Block under construction
#[derive(Debug, Default)]
struct PendingBlock {
    name: String,
    version: Option<String>,
    pairs: Vec<(String, String)>,
    in_loop: bool,
    fields: Vec<StarField>,
    rows: Vec<Vec<String>>,
}

impl PendingBlock {
    fn finish(self) -> Result<StarBlock, StarError> {
        let table = if self.in_loop {
            Some(StarTable::new(self.fields, self.rows)?)
        } else {
            None
        };
        Ok(StarBlock {
            name: self.name,
            version: self.version,
            pairs: self.pairs,
            table,
        })
    }
}

/// Line driven STAR parser
#[derive(Debug, Default)]
struct Parser {
    blocks: Vec<StarBlock>,
    current: Option<PendingBlock>,
    pending_version: Option<String>,
}

impl Parser {
    fn feed(&mut self, number: usize, line: &str) -> Result<(), StarError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }

        if let Some(comment) = trimmed.strip_prefix('#') {
            let mut words = comment.split_whitespace();
            if words.next() == Some("version") {
                self.pending_version = words.next().map(String::from);
            }
            return Ok(());
        }

        if let Some(name) = trimmed.strip_prefix("data_") {
            if let Some(block) = self.current.take() {
                self.blocks.push(block.finish()?);
            }
            self.current = Some(PendingBlock {
                name: name.trim().to_string(),
                version: self.pending_version.take(),
                ..Default::default()
            });
            return Ok(());
        }

        let block = self
            .current
            .as_mut()
            .ok_or(StarError::OutsideBlock(number))?;

        if trimmed.starts_with("loop_") {
            block.in_loop = true;
            return Ok(());
        }

        if trimmed.starts_with('_') {
            let mut words = trimmed.split_whitespace();
            let name = words.next().unwrap_or_default();
            let rest = words.next();
            if !block.in_loop {
                let value = trimmed[name.len()..].trim();
                block.pairs.push((name.to_string(), value.to_string()));
                return Ok(());
            }
            if !block.rows.is_empty() {
                return Err(StarError::BadFieldDeclaration {
                    line: number,
                    text: trimmed.to_string(),
                });
            }
            let index = match rest {
                None => block.fields.len() + 1,
                Some(token) => token
                    .strip_prefix('#')
                    .and_then(|idx| idx.parse::<usize>().ok())
                    .ok_or_else(|| StarError::BadFieldDeclaration {
                        line: number,
                        text: trimmed.to_string(),
                    })?,
            };
            block.fields.push(StarField::new(name, index));
            return Ok(());
        }

        if !block.in_loop || block.fields.is_empty() {
            return Err(StarError::RowOutsideTable(number));
        }
        block
            .rows
            .push(trimmed.split_whitespace().map(String::from).collect());
        Ok(())
    }

    fn finish(mut self) -> Result<StarFile, StarError> {
        if let Some(block) = self.current.take() {
            self.blocks.push(block.finish()?);
        }
        Ok(StarFile {
            blocks: self.blocks,
        })
    }
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
_rlnImagePixelSize #2
1 1.06

# version 30001

data_particles

loop_
_rlnCoordinateX #1
_rlnCoordinateY #2
_rlnImageName #3
_rlnMicrographName #4
100.0 200.0 000001@Extract/job010/mic_1.mrcs MotionCorr/mic_1.mrc
150.5 250.5 000002@Extract/job010/mic_1.mrcs MotionCorr/mic_1.mrc
";

    #[test]
    fn parse_relion_particles() {
        let star = StarFile::parse(PARTICLES).unwrap();
        assert_eq!(star.blocks.len(), 2);
        assert_eq!(star.version(), "30001");
        assert_eq!(star.kind().unwrap(), StarKind::Particles);
        let optics = star.optics().unwrap();
        assert_eq!(optics.table.as_ref().unwrap().len(), 1);
        let table = star.main_table().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.value(1, "_rlnCoordinateY"), Some("250.5"));
        assert_eq!(table.column(IMAGE_NAME), Some(2));
    }

    #[test]
    fn write_then_parse_is_identity() {
        let star = StarFile::parse(PARTICLES).unwrap();
        let text = star.to_string();
        let again = StarFile::parse(&text).unwrap();
        assert_eq!(star, again);
        assert_eq!(text, again.to_string());
    }

    #[test]
    fn fields_are_sorted_by_index() {
        let text = "data_\nloop_\n_b #2\n_a #1\n1 2\n";
        let star = StarFile::parse(text).unwrap();
        let table = star.blocks[0].table.as_ref().unwrap();
        assert_eq!(table.fields()[0].name, "_a");
        assert_eq!(table.fields()[1].name, "_b");
    }

    #[test]
    fn missing_version_is_unknown() {
        let star = StarFile::parse("data_\nloop_\n_rlnCoordinateX #1\n5\n").unwrap();
        assert_eq!(star.version(), UNKNOWN_VERSION);
        assert!(matches!(star.kind(), Err(StarError::UnknownDataType)));
    }

    #[test]
    fn key_value_pairs() {
        let text = "data_general\n_rlnImageSizeX 128\n_rlnTitle some words here\n";
        let star = StarFile::parse(text).unwrap();
        let block = &star.blocks[0];
        assert!(block.table.is_none());
        assert_eq!(block.pairs[1].1, "some words here");
    }

    #[rstest]
    #[case("data_\nloop_\n_a #1\n_b #3\n1 2\n")]
    #[case("data_\nloop_\n_a #1\n_b #1\n1 2\n")]
    #[case("data_\nloop_\n_a #0\n1\n")]
    fn bad_field_indices(#[case] text: &str) {
        assert!(matches!(
            StarFile::parse(text),
            Err(StarError::BadFieldIndex { .. })
        ));
    }

    #[test]
    fn row_width_is_checked() {
        let text = "data_\nloop_\n_a #1\n_b #2\n1 2\n3\n";
        match StarFile::parse(text) {
            Err(StarError::RowWidth {
                row,
                found,
                expected,
            }) => {
                assert_eq!(row, 2);
                assert_eq!(found, 1);
                assert_eq!(expected, 2);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[rstest]
    #[case("loop_\n", 1)]
    #[case("data_\n_a 1\n5 6\n", 3)]
    fn structural_errors_report_line(#[case] text: &str, #[case] line: usize) {
        match StarFile::parse(text) {
            Err(StarError::OutsideBlock(found)) | Err(StarError::RowOutsideTable(found)) => {
                assert_eq!(found, line)
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn malformed_field_index() {
        let text = "data_\nloop_\n_a #x\n";
        assert!(matches!(
            StarFile::parse(text),
            Err(StarError::BadFieldDeclaration { line: 3, .. })
        ));
    }

    #[test]
    fn drop_field_renumbers() {
        let table = StarTable::from_names(
            &["_a", "_b", "_c"],
            vec![vec!["1".into(), "2".into(), "3".into()]],
        )
        .unwrap();
        let reduced = table.without_field("_b").unwrap();
        assert_eq!(reduced.fields()[1], StarField::new("_c", 2));
        assert_eq!(reduced.rows()[0], vec!["1".to_string(), "3".to_string()]);
    }

    #[test]
    fn sniff_reads_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("particles.star");
        let mut text = String::from(PARTICLES);
        for idx in 0..5000 {
            text.push_str(&format!(
                "1.0 2.0 {idx:06}@Extract/job010/mic_2.mrcs MotionCorr/mic_2.mrc\n"
            ));
        }
        std::fs::write(&path, &text).unwrap();
        let sniffed = StarFile::sniff(&path, 1000).unwrap();
        assert_eq!(sniffed.kind().unwrap(), StarKind::Particles);
        assert!(sniffed.main_table().unwrap().len() < 5002);
        let full = StarFile::read(&path).unwrap();
        assert_eq!(full.main_table().unwrap().len(), 5002);
    }
}
