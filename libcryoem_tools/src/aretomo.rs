use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::config::{require_positive, YamlConfig};
use super::error::{ConfigError, WrapperError};
use super::process::{BatchJob, BatchTask};
use super::targets::{find_targets, Target, TargetSpec};
use super::tool::{ExternalTool, ToolInvocation};

fn bit(value: bool) -> u8 {
    u8::from(value)
}

/// Batch AreTomo tilt-series alignment and reconstruction.
///
/// Optional fields are only passed to AreTomo when set, so its own defaults apply
/// otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AretomoConfig {
    pub software: String,
    pub dir_in: PathBuf,
    pub suffix_in: String,
    pub dir_out: PathBuf,
    pub suffix_out: String,
    /// Directory of per tilt-series angle files `<stem><ang_file_suffix>`
    pub ang_file_dir: Option<PathBuf>,
    pub ang_file_suffix: String,
    pub pixel_size: f64,
    pub voltage: f64,
    pub spherical_aberration: f64,
    pub out_bin: u32,
    pub vol_z: u32,
    pub align: bool,
    pub flip_vol: bool,
    pub flip_int: Option<bool>,
    pub wbp: bool,
    pub patch: Option<[u32; 2]>,
    pub dark_tol: f64,
    pub out_imod: Option<u32>,
    pub tilt_range: Option<[f64; 2]>,
    pub recon_range: Option<[f64; 2]>,
    pub tilt_axis: Vec<f64>,
    pub tilt_cor: Option<i32>,
    pub img_dose: Option<f64>,
    pub defocus: Option<f64>,
    pub aln_file: Option<PathBuf>,
    pub roi_file: Option<PathBuf>,
    pub b_factors: Vec<f64>,
    pub align_z: Option<u32>,
    pub out_xf: Option<u32>,
    pub intp_cor: Option<u32>,
    pub gpu: Vec<u32>,
    /// Passed verbatim after everything else
    pub extra_args: Vec<String>,
}

impl Default for AretomoConfig {
    fn default() -> Self {
        Self {
            software: String::from("AreTomo"),
            dir_in: PathBuf::from("./"),
            suffix_in: String::from("_ali.mrc"),
            dir_out: PathBuf::from("./aretomo"),
            suffix_out: String::from("_rec.mrc"),
            ang_file_dir: None,
            ang_file_suffix: String::from("_tlt.txt"),
            pixel_size: 1.0,
            voltage: 300.0,
            spherical_aberration: 2.7,
            out_bin: 4,
            vol_z: 1600,
            align: true,
            flip_vol: true,
            flip_int: None,
            wbp: true,
            patch: Some([5, 4]),
            dark_tol: 0.7,
            out_imod: Some(1),
            tilt_range: None,
            recon_range: None,
            tilt_axis: vec![],
            tilt_cor: None,
            img_dose: None,
            defocus: None,
            aln_file: None,
            roi_file: None,
            b_factors: vec![],
            align_z: None,
            out_xf: None,
            intp_cor: None,
            gpu: vec![],
            extra_args: vec![],
        }
    }
}

impl YamlConfig for AretomoConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("pixel_size", self.pixel_size)?;
        if self.out_bin == 0 {
            return Err(ConfigError::InvalidValue {
                field: "out_bin",
                reason: String::from("must be at least 1"),
            });
        }
        Ok(())
    }
}

impl AretomoConfig {
    /// `<ang_file_dir>/<stem><ang_file_suffix>`, which must exist when a directory is set
    pub fn ang_file(&self, target: &Target) -> Result<Option<PathBuf>, WrapperError> {
        let Some(dir) = &self.ang_file_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("{}{}", target.stem, self.ang_file_suffix));
        if path.exists() {
            Ok(Some(path))
        } else {
            Err(WrapperError::MissingAngFile(path))
        }
    }

    pub fn invocation(
        &self,
        program: &Path,
        target: &Target,
    ) -> Result<ToolInvocation, WrapperError> {
        let mut invocation = ToolInvocation::new(program)
            .flag_path("-InMrc", &target.input)
            .flag_path("-OutMrc", &target.output)
            .flag_path_opt("-AngFile", self.ang_file(target)?.as_deref())
            .flag("-PixSize", self.pixel_size)
            .flag("-Kv", self.voltage)
            .flag("-Cs", self.spherical_aberration)
            .flag("-OutBin", self.out_bin)
            .flag("-VolZ", self.vol_z)
            .flag("-Align", bit(self.align))
            .flag("-FlipVol", bit(self.flip_vol))
            .flag_opt("-FlipInt", self.flip_int.map(bit))
            .flag("-Wbp", bit(self.wbp))
            .flag("-DarkTol", self.dark_tol)
            .flag_opt("-OutImod", self.out_imod)
            .flag_opt("-TiltCor", self.tilt_cor)
            .flag_opt("-ImgDose", self.img_dose)
            .flag_opt("-Defocus", self.defocus)
            .flag_opt("-AlgnZ", self.align_z)
            .flag_opt("-OutXF", self.out_xf)
            .flag_opt("-IntpCor", self.intp_cor)
            .flag_path_opt("-AlnFile", self.aln_file.as_deref())
            .flag_path_opt("-RoiFile", self.roi_file.as_deref());
        if let Some(patch) = &self.patch {
            invocation = invocation.flag_values("-Patch", patch);
        }
        if let Some(range) = &self.tilt_range {
            invocation = invocation.flag_values("-TiltRange", range);
        }
        if let Some(range) = &self.recon_range {
            invocation = invocation.flag_values("-ReconRange", range);
        }
        if !self.tilt_axis.is_empty() {
            invocation = invocation.flag_values("-TiltAxis", &self.tilt_axis);
        }
        if !self.b_factors.is_empty() {
            invocation = invocation.flag_values("-Bft", &self.b_factors);
        }
        if !self.gpu.is_empty() {
            invocation = invocation.flag_values("-Gpu", &self.gpu);
        }
        for arg in self.extra_args.iter() {
            invocation = invocation.arg(arg);
        }
        Ok(invocation)
    }

    fn target_spec(&self) -> TargetSpec<'_> {
        TargetSpec {
            dir_in: &self.dir_in,
            suffix_in: &self.suffix_in,
            dir_out: &self.dir_out,
            suffix_out: &self.suffix_out,
            recursive_out: true,
        }
    }
}

impl BatchJob for AretomoConfig {
    fn name(&self) -> &'static str {
        "aretomo"
    }

    fn prepare(&self) -> Result<Vec<BatchTask>, WrapperError> {
        let tool = ExternalTool::locate(&self.software)?;
        let targets = find_targets(&self.target_spec())?;
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
