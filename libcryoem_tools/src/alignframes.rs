use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::config::YamlConfig;
use super::error::{ConfigError, WrapperError};
use super::mdoc::MdocFile;
use super::process::{BatchJob, BatchTask};
use super::targets::{find_targets, Target, TargetSpec};
use super::tool::{ExternalTool, ToolInvocation};

/// Join values the way IMOD expects lists: `2,1`
pub fn comma_list<T: ToString>(values: &[T]) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<String>>()
        .join(",")
}

/// Keep an optional reference file only if it exists
pub fn existing_reference(kind: &str, path: Option<&Path>) -> Option<PathBuf> {
    let path = path?;
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        log::warn!("{kind} file {} does not exist and is ignored", path.display());
        None
    }
}

/// Batch IMOD alignframes over SerialEM tilt series, one run per `.mdoc`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignframesConfig {
    pub software: String,
    pub frames_dir: PathBuf,
    pub mdoc_dir: PathBuf,
    pub mdoc_suffix: String,
    pub dir_out: PathBuf,
    pub suffix_out: String,
    pub binning: Vec<u32>,
    pub vary: f64,
    pub gpu: Vec<u32>,
    /// Overrides the pixel size recorded in the mdoc
    pub pixel_size: Option<f64>,
    pub gain: Option<PathBuf>,
    pub defect: Option<PathBuf>,
    pub dark: Option<PathBuf>,
    /// Warn about frames listed in an mdoc but absent from `frames_dir`
    pub check_frames: bool,
}

impl Default for AlignframesConfig {
    fn default() -> Self {
        Self {
            software: String::from("alignframes"),
            frames_dir: PathBuf::from("./"),
            mdoc_dir: PathBuf::from("./"),
            mdoc_suffix: String::from(".mrc.mdoc"),
            dir_out: PathBuf::from("../aliframes_TS"),
            suffix_out: String::from("_alifr.mrc"),
            binning: vec![2, 1],
            vary: 0.25,
            gpu: vec![],
            pixel_size: None,
            gain: None,
            defect: None,
            dark: None,
            check_frames: true,
        }
    }
}

impl YamlConfig for AlignframesConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.binning.is_empty() || self.binning.contains(&0) {
            return Err(ConfigError::InvalidValue {
                field: "binning",
                reason: String::from("needs one or more factors of at least 1"),
            });
        }
        Ok(())
    }
}

impl AlignframesConfig {
    pub fn invocation(&self, program: &Path, target: &Target) -> ToolInvocation {
        let mut invocation = ToolInvocation::new(program)
            .flag_path("-mdoc", &target.input)
            .flag_path("-output", &target.output)
            .flag("-binning", comma_list(&self.binning))
            .flag_path("-path", &self.frames_dir);
        if !self.gpu.is_empty() {
            invocation = invocation.flag("-gpu", comma_list(&self.gpu));
        }
        invocation
            .flag_opt("-pixel", self.pixel_size)
            .flag_path_opt(
                "-gain",
                existing_reference("Gain", self.gain.as_deref()).as_deref(),
            )
            .flag_path_opt(
                "-defect",
                existing_reference("Defect", self.defect.as_deref()).as_deref(),
            )
            .flag_path_opt(
                "-dark",
                existing_reference("Dark", self.dark.as_deref()).as_deref(),
            )
            .flag("-vary", self.vary)
    }

    fn check_mdoc(&self, target: &Target) -> Result<(), WrapperError> {
        let mdoc = MdocFile::read(&target.input)?;
        let missing = mdoc.missing_frames(&self.frames_dir);
        if !missing.is_empty() {
            log::warn!(
                "{}: {} of {} frame file(s) missing from {}",
                target.stem,
                missing.len(),
                mdoc.tilts.len(),
                self.frames_dir.display()
            );
        }
        Ok(())
    }
}

impl BatchJob for AlignframesConfig {
    fn name(&self) -> &'static str {
        "alignframes"
    }

    fn prepare(&self) -> Result<Vec<BatchTask>, WrapperError> {
        let tool = ExternalTool::locate(&self.software)?;
        let targets = find_targets(&TargetSpec {
            dir_in: &self.mdoc_dir,
            suffix_in: &self.mdoc_suffix,
            dir_out: &self.dir_out,
            suffix_out: &self.suffix_out,
            recursive_out: false,
        })?;
        std::fs::create_dir_all(&self.dir_out)?;
        let mut tasks = Vec::with_capacity(targets.len());
        for target in targets.iter() {
            if self.check_frames {
                self.check_mdoc(target)?;
            }
            tasks.push(BatchTask {
                label: target.stem.clone(),
                invocation: self.invocation(tool.path(), target),
                log_file: Some(target.output.with_extension("log")),
            });
        }
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn command_line() {
        let dir = tempfile::tempdir().unwrap();
        let gain = dir.path().join("gain.mrc");
        std::fs::write(&gain, b"").unwrap();
        let config = AlignframesConfig {
            frames_dir: PathBuf::from("frames"),
            gpu: vec![0],
            gain: Some(gain.clone()),
            dark: Some(dir.path().join("missing_dark.mrc")),
            ..Default::default()
        };
        let target = Target {
            stem: String::from("ts_01"),
            input: PathBuf::from("ts_01.mrc.mdoc"),
            output: PathBuf::from("out/ts_01_alifr.mrc"),
        };
        let invocation = config.invocation(Path::new("alignframes"), &target);
        let mut expected: Vec<OsString> = [
            "-mdoc",
            "ts_01.mrc.mdoc",
            "-output",
            "out/ts_01_alifr.mrc",
            "-binning",
            "2,1",
            "-path",
            "frames",
            "-gpu",
            "0",
            "-gain",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        expected.push(gain.clone().into_os_string());
        expected.push(OsString::from("-vary"));
        expected.push(OsString::from("0.25"));
        assert_eq!(invocation.args(), expected.as_slice());
    }

    #[test]
    fn zero_binning_is_invalid() {
        let config = AlignframesConfig {
            binning: vec![2, 0],
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(AlignframesConfig::default().validate().is_ok());
    }
}
