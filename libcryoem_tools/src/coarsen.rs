use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::config::{require_positive, YamlConfig};
use super::error::{ConfigError, WrapperError};
use super::process::{BatchJob, BatchTask};
use super::targets::{find_targets, Target, TargetSpec};
use super::tool::{ExternalTool, ToolInvocation};

/// Bin micrographs with `relion_image_handler` for fast screening.
///
/// `mic_noDW.mrc` becomes `mic_noDW_c8.mrc` next to it for a factor of 8.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoarsenConfig {
    pub software: String,
    pub dir: PathBuf,
    pub suffix_in: String,
    pub factor: u32,
    pub pixel_size: f64,
}

impl Default for CoarsenConfig {
    fn default() -> Self {
        Self {
            software: String::from("relion_image_handler"),
            dir: PathBuf::from("./"),
            suffix_in: String::from("_noDW.mrc"),
            factor: 8,
            pixel_size: 1.0,
        }
    }
}

impl YamlConfig for CoarsenConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("pixel_size", self.pixel_size)?;
        if self.factor < 2 {
            return Err(ConfigError::InvalidValue {
                field: "factor",
                reason: format!("coarsening factor must be at least 2, got {}", self.factor),
            });
        }
        Ok(())
    }
}

impl CoarsenConfig {
    /// `_noDW.mrc` -> `_noDW_c8.mrc`
    pub fn suffix_out(&self) -> String {
        let base = self
            .suffix_in
            .strip_suffix(".mrc")
            .unwrap_or(&self.suffix_in);
        format!("{base}_c{}.mrc", self.factor)
    }

    pub fn invocation(&self, program: &Path, target: &Target) -> ToolInvocation {
        ToolInvocation::new(program)
            .flag_path("--i", &target.input)
            .flag_path("--o", &target.output)
            .flag("--angpix", self.pixel_size)
            .flag("--rescale_angpix", self.pixel_size * self.factor as f64)
    }
}

impl BatchJob for CoarsenConfig {
    fn name(&self) -> &'static str {
        "coarsen"
    }

    fn prepare(&self) -> Result<Vec<BatchTask>, WrapperError> {
        let tool = ExternalTool::locate(&self.software)?;
        let suffix_out = self.suffix_out();
        let targets = find_targets(&TargetSpec {
            dir_in: &self.dir,
            suffix_in: &self.suffix_in,
            dir_out: &self.dir,
            suffix_out: &suffix_out,
            recursive_out: false,
        })?;
        Ok(targets
            .iter()
            .map(|target| BatchTask {
                label: target.stem.clone(),
                invocation: self.invocation(tool.path(), target),
                log_file: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coarsened_names_and_scale() {
        let config = CoarsenConfig {
            pixel_size: 0.85,
            factor: 4,
            ..Default::default()
        };
        assert_eq!(config.suffix_out(), "_noDW_c4.mrc");
        let target = Target {
            stem: String::from("mic_1"),
            input: PathBuf::from("mic_1_noDW.mrc"),
            output: PathBuf::from("mic_1_noDW_c4.mrc"),
        };
        let invocation = config.invocation(Path::new("relion_image_handler"), &target);
        assert_eq!(
            invocation.args(),
            &[
                "--i",
                "mic_1_noDW.mrc",
                "--o",
                "mic_1_noDW_c4.mrc",
                "--angpix",
                "0.85",
                "--rescale_angpix",
                "3.4"
            ]
        );
    }

    #[test]
    fn coarsened_outputs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a_noDW.mrc", "b_noDW.mrc", "a_noDW_c8.mrc"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let config = CoarsenConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let suffix_out = config.suffix_out();
        let targets = find_targets(&TargetSpec {
            dir_in: &config.dir,
            suffix_in: &config.suffix_in,
            dir_out: &config.dir,
            suffix_out: &suffix_out,
            recursive_out: false,
        })
        .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].output, dir.path().join("b_noDW_c8.mrc"));
    }
}
