use std::path::Path;

use super::error::MdocError;

/// One `[ZValue = N]` section of an mdoc file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MdocTilt {
    pub z_value: u32,
    pub entries: Vec<(String, String)>,
}

impl MdocTilt {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn tilt_angle(&self) -> Option<f64> {
        self.get("TiltAngle")?.parse().ok()
    }

    /// File name of the frames recorded for this tilt. SerialEM writes Windows paths, so
    /// both separators are accepted.
    pub fn frame_file_name(&self) -> Option<&str> {
        let path = self.get("SubFramePath")?;
        path.rsplit(['\\', '/']).next().filter(|name| !name.is_empty())
    }
}

/// SerialEM tilt-series metadata
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MdocFile {
    /// Global `key = value` lines and bracketed `[T = ...]` titles before the first section
    pub header: Vec<(String, String)>,
    pub tilts: Vec<MdocTilt>,
}

fn split_entry(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    Some((key.trim().to_string(), value.trim().to_string()))
}

impl MdocFile {
    pub fn read(path: &Path) -> Result<Self, MdocError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, MdocError> {
        let mut mdoc = MdocFile::default();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                match split_entry(inner) {
                    Some((key, value)) if key == "ZValue" => {
                        let z_value = value.parse::<u32>().map_err(|_| MdocError::BadZValue {
                            line: idx + 1,
                            text: line.to_string(),
                        })?;
                        mdoc.tilts.push(MdocTilt {
                            z_value,
                            entries: vec![],
                        });
                    }
                    Some(entry) if mdoc.tilts.is_empty() => mdoc.header.push(entry),
                    _ => log::debug!("Ignoring mdoc line {}: {line}", idx + 1),
                }
                continue;
            }
            let Some(entry) = split_entry(line) else {
                continue;
            };
            match mdoc.tilts.last_mut() {
                Some(tilt) => tilt.entries.push(entry),
                None => mdoc.header.push(entry),
            }
        }
        Ok(mdoc)
    }

    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Frame files referenced by the mdoc that are not present in `frames_dir`
    pub fn missing_frames(&self, frames_dir: &Path) -> Vec<String> {
        self.tilts
            .iter()
            .filter_map(|tilt| tilt.frame_file_name())
            .filter(|name| !frames_dir.join(name).exists())
            .map(String::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MDOC: &str = r"PixelSpacing = 2.678
Voltage = 300
ImageFile = ts_01.mrc
ImageSize = 4096 4096
DataMode = 1

[T = SerialEM: Digitized on EMBL Krios   22-Jan-24  10:15:44    ]

[ZValue = 0]
TiltAngle = 0.00
ExposureDose = 3.4
SubFramePath = X:\data\frames\ts_01_000_0.0.eer

[ZValue = 1]
TiltAngle = 3.00
SubFramePath = X:\data\frames\ts_01_001_3.0.eer
";

    #[test]
    fn parse_sections() {
        let mdoc = MdocFile::parse(MDOC).unwrap();
        assert_eq!(mdoc.header_value("PixelSpacing"), Some("2.678"));
        assert_eq!(
            mdoc.header_value("T"),
            Some("SerialEM: Digitized on EMBL Krios   22-Jan-24  10:15:44")
        );
        assert_eq!(mdoc.tilts.len(), 2);
        assert_eq!(mdoc.tilts[1].z_value, 1);
        assert_eq!(mdoc.tilts[1].tilt_angle(), Some(3.0));
        assert_eq!(mdoc.tilts[0].frame_file_name(), Some("ts_01_000_0.0.eer"));
    }

    #[test]
    fn missing_frames_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ts_01_000_0.0.eer"), b"").unwrap();
        let mdoc = MdocFile::parse(MDOC).unwrap();
        assert_eq!(mdoc.missing_frames(dir.path()), vec!["ts_01_001_3.0.eer"]);
    }

    #[test]
    fn bad_section_header() {
        assert!(matches!(
            MdocFile::parse("[ZValue = x]\n"),
            Err(MdocError::BadZValue { line: 1, .. })
        ));
    }
}
