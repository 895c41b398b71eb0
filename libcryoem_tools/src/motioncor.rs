use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::alignframes::existing_reference;
use super::config::{require_positive, YamlConfig};
use super::error::{ConfigError, WrapperError};
use super::process::{BatchJob, BatchTask};
use super::targets::{find_targets, Target, TargetSpec};
use super::tool::{ExternalTool, ToolInvocation};

/// MotionCor2 input flag for a movie file, chosen by extension
pub fn input_flag(movie: &Path) -> Option<&'static str> {
    let ext = movie.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "tif" | "tiff" => Some("-InTiff"),
        "mrc" | "mrcs" => Some("-InMrc"),
        "eer" => Some("-InEer"),
        _ => None,
    }
}

/// Batch MotionCor2 over a directory of movies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotioncorConfig {
    pub software: String,
    pub dir_in: PathBuf,
    pub suffix_in: String,
    pub dir_out: PathBuf,
    pub suffix_out: String,
    pub gain: Option<PathBuf>,
    /// 0 none, 1 90°, 2 180°, 3 270°
    pub rot_gain: u8,
    /// 0 none, 1 upside down, 2 left right
    pub flip_gain: u8,
    pub dark: Option<PathBuf>,
    pub defect_file: Option<PathBuf>,
    pub patch: [u32; 2],
    pub iterations: u32,
    pub tolerance: f64,
    pub split_sum: bool,
    pub voltage: f64,
    pub pixel_size: Option<f64>,
    pub frame_dose: Option<f64>,
    pub b_factors: [f64; 2],
    pub gpu_mem_usage: f64,
    pub ft_bin: f64,
    pub gpu: Vec<u32>,
    pub log_dir: Option<PathBuf>,
    pub out_star: bool,
    pub extra_args: Vec<String>,
}

impl Default for MotioncorConfig {
    fn default() -> Self {
        Self {
            software: String::from("MotionCor2"),
            dir_in: PathBuf::from("./"),
            suffix_in: String::from(".tiff"),
            dir_out: PathBuf::from("../motioncorr"),
            suffix_out: String::from("_alimc.mrc"),
            gain: None,
            rot_gain: 0,
            flip_gain: 0,
            dark: None,
            defect_file: None,
            patch: [5, 5],
            iterations: 15,
            tolerance: 0.2,
            split_sum: false,
            voltage: 300.0,
            pixel_size: None,
            frame_dose: None,
            b_factors: [500.0, 100.0],
            gpu_mem_usage: 0.75,
            ft_bin: 1.0,
            gpu: vec![0],
            log_dir: None,
            out_star: false,
            extra_args: vec![],
        }
    }
}

impl YamlConfig for MotioncorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if input_flag(Path::new(&format!("movie{}", self.suffix_in))).is_none() {
            return Err(ConfigError::InvalidValue {
                field: "suffix_in",
                reason: format!("{} is not a .tif, .tiff, .mrc, .mrcs or .eer suffix", self.suffix_in),
            });
        }
        if self.rot_gain > 3 || self.flip_gain > 2 {
            return Err(ConfigError::InvalidValue {
                field: "rot_gain",
                reason: String::from("rot_gain must be 0-3 and flip_gain 0-2"),
            });
        }
        require_positive("ft_bin", self.ft_bin)?;
        if let Some(pixel_size) = self.pixel_size {
            require_positive("pixel_size", pixel_size)?;
        }
        Ok(())
    }
}

impl MotioncorConfig {
    pub fn invocation(
        &self,
        program: &Path,
        target: &Target,
    ) -> Result<ToolInvocation, WrapperError> {
        let flag = input_flag(&target.input).ok_or_else(|| WrapperError::InvalidOption {
            option: "suffix_in",
            reason: format!("cannot tell the movie format of {}", target.input.display()),
        })?;
        let mut invocation = ToolInvocation::new(program)
            .flag_path(flag, &target.input)
            .flag_path("-OutMrc", &target.output)
            .flag_path_opt(
                "-Gain",
                existing_reference("Gain", self.gain.as_deref()).as_deref(),
            )
            .flag("-RotGain", self.rot_gain)
            .flag("-FlipGain", self.flip_gain)
            .flag_path_opt(
                "-Dark",
                existing_reference("Dark", self.dark.as_deref()).as_deref(),
            )
            .flag_path_opt(
                "-DefectFile",
                existing_reference("Defect", self.defect_file.as_deref()).as_deref(),
            )
            .flag_values("-Patch", &self.patch)
            .flag("-Iter", self.iterations)
            .flag("-Tol", self.tolerance)
            .flag("-SplitSum", u8::from(self.split_sum))
            .flag("-kV", self.voltage)
            .flag_opt("-PixSize", self.pixel_size)
            .flag_opt("-FmDose", self.frame_dose)
            .flag_values("-Bft", &self.b_factors)
            .flag("-GpuMemUsage", self.gpu_mem_usage)
            .flag("-FtBin", self.ft_bin)
            .flag_path_opt("-LogDir", self.log_dir.as_deref())
            .flag("-OutStar", u8::from(self.out_star));
        if !self.gpu.is_empty() {
            invocation = invocation.flag_values("-Gpu", &self.gpu);
        }
        for arg in self.extra_args.iter() {
            invocation = invocation.arg(arg);
        }
        Ok(invocation)
    }
}

impl BatchJob for MotioncorConfig {
    fn name(&self) -> &'static str {
        "motioncor"
    }

    fn prepare(&self) -> Result<Vec<BatchTask>, WrapperError> {
        let tool = ExternalTool::locate(&self.software)?;
        let targets = find_targets(&TargetSpec {
            dir_in: &self.dir_in,
            suffix_in: &self.suffix_in,
            dir_out: &self.dir_out,
            suffix_out: &self.suffix_out,
            recursive_out: false,
        })?;
        std::fs::create_dir_all(&self.dir_out)?;
        targets
            .iter()
            .map(|target| {
                Ok(BatchTask {
                    label: target.stem.clone(),
                    invocation: self.invocation(tool.path(), target)?,
                    log_file: Some(target.output.with_extension("log")),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("mic.tiff", Some("-InTiff"))]
    #[case("mic.TIF", Some("-InTiff"))]
    #[case("mic.mrcs", Some("-InMrc"))]
    #[case("mic_EER.eer", Some("-InEer"))]
    #[case("mic.jpg", None)]
    fn input_flags(#[case] name: &str, #[case] flag: Option<&str>) {
        assert_eq!(input_flag(Path::new(name)), flag);
    }

    #[test]
    fn command_line() {
        let config = MotioncorConfig {
            gpu: vec![0, 1],
            pixel_size: Some(0.83),
            ..Default::default()
        };
        let target = Target {
            stem: String::from("mic_001"),
            input: PathBuf::from("movies/mic_001.eer"),
            output: PathBuf::from("mc/mic_001_alimc.mrc"),
        };
        let invocation = config
            .invocation(Path::new("MotionCor2"), &target)
            .unwrap();
        let args = invocation
            .args()
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        assert!(args.starts_with("-InEer movies/mic_001.eer -OutMrc mc/mic_001_alimc.mrc"));
        assert!(args.contains("-Patch 5 5 -Iter 15 -Tol 0.2"));
        assert!(args.contains("-PixSize 0.83"));
        assert!(args.contains("-Bft 500 100"));
        assert!(!args.contains("-Gain"));
        assert!(args.ends_with("-Gpu 0 1"));
    }

    #[test]
    fn validation() {
        assert!(MotioncorConfig::default().validate().is_ok());
        let bad = MotioncorConfig {
            suffix_in: String::from(".png"),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
