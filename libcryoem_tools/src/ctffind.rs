use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};

use super::config::{require_ordered, require_positive, YamlConfig};
use super::error::{ConfigError, WrapperError};
use super::process::{BatchJob, BatchTask};
use super::targets::{find_targets, Target, TargetSpec};
use super::tool::{ExternalTool, ToolInvocation};

/// What CTFFIND is given as input. This decides whether it asks about movie frames.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputKind {
    /// A single image. CTFFIND does not ask about frames.
    Micrograph,
    /// A stack of independent images, e.g. a tilt series
    Stack,
    /// A stack of movie frames that CTFFIND averages in groups
    Movie { frames_to_average: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Astigmatism {
    /// Astigmatism is known and not searched for
    Known { astigmatism: f64, angle: f64 },
    /// Astigmatism is searched for, optionally restrained to an expected value
    Unknown { restraint: Option<f64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseShiftSearch {
    /// Radians
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Default for PhaseShiftSearch {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 3.15,
            step: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThicknessSearch {
    pub brute_force_1d: bool,
    pub refine_2d: bool,
    pub nodes_low_resolution: f64,
    pub nodes_high_resolution: f64,
    pub rounded_square: bool,
    pub downweight_nodes: bool,
}

impl Default for ThicknessSearch {
    fn default() -> Self {
        Self {
            brute_force_1d: true,
            refine_2d: true,
            nodes_low_resolution: 30.0,
            nodes_high_resolution: 3.0,
            rounded_square: false,
            downweight_nodes: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KnownDefocus {
    pub defocus_1: f64,
    pub defocus_2: f64,
    pub astigmatism_angle: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpertOptions {
    /// Target pixel size when resampling small pixels; `None` disables resampling
    pub resample_to: Option<f64>,
    pub known_defocus: Option<KnownDefocus>,
    pub weight_down_low_resolution: bool,
    pub threads: u32,
}

impl Default for ExpertOptions {
    fn default() -> Self {
        Self {
            resample_to: Some(1.4),
            known_defocus: None,
            weight_down_low_resolution: true,
            threads: 12,
        }
    }
}

/// One interactive question and the answer we give it
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub question: &'static str,
    pub answer: String,
}

#[derive(Debug, Default)]
struct PromptList(Vec<Prompt>);

impl PromptList {
    fn ask(&mut self, question: &'static str, answer: impl Display) {
        self.0.push(Prompt {
            question,
            answer: answer.to_string(),
        });
    }

    fn confirm(&mut self, question: &'static str, answer: bool) {
        self.ask(question, yes_no(answer));
    }
}

fn yes_no(answer: bool) -> &'static str {
    if answer {
        "Yes"
    } else {
        "No"
    }
}

/// Batch CTFFIND5 configuration.
///
/// The optional searches are modelled as optional sub-configurations, so a question is
/// only ever answered when the branch it belongs to is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtffindConfig {
    pub software: String,
    pub dir_in: PathBuf,
    pub suffix_in: String,
    pub dir_out: PathBuf,
    pub suffix_out: String,
    /// Write the here-document used for every input to `<input>.com`
    pub write_com_scripts: bool,
    pub input: InputKind,
    pub pixel_size: f64,
    pub voltage: f64,
    pub spherical_aberration: f64,
    pub amplitude_contrast: f64,
    pub spectrum_size: u32,
    pub min_resolution: f64,
    pub max_resolution: f64,
    pub min_defocus: f64,
    pub max_defocus: f64,
    pub defocus_step: f64,
    pub astigmatism: Astigmatism,
    pub exhaustive_search: bool,
    pub phase_shift: Option<PhaseShiftSearch>,
    /// Only asked when no phase shift search is done
    pub determine_tilt: bool,
    pub thickness: Option<ThicknessSearch>,
    pub expert: Option<ExpertOptions>,
}

impl Default for CtffindConfig {
    fn default() -> Self {
        Self {
            software: String::from("ctffind"),
            dir_in: PathBuf::from("./"),
            suffix_in: String::from("_alifr.mrc"),
            dir_out: PathBuf::from("./"),
            suffix_out: String::from("_alifr_ctf.mrc"),
            write_com_scripts: true,
            input: InputKind::Micrograph,
            pixel_size: 1.0,
            voltage: 300.0,
            spherical_aberration: 2.7,
            amplitude_contrast: 0.07,
            spectrum_size: 512,
            min_resolution: 30.0,
            max_resolution: 5.0,
            min_defocus: 5000.0,
            max_defocus: 50000.0,
            defocus_step: 100.0,
            astigmatism: Astigmatism::Unknown { restraint: None },
            exhaustive_search: false,
            phase_shift: None,
            determine_tilt: false,
            thickness: None,
            expert: None,
        }
    }
}

impl YamlConfig for CtffindConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        require_positive("pixel_size", self.pixel_size)?;
        require_positive("voltage", self.voltage)?;
        require_positive("defocus_step", self.defocus_step)?;
        // Resolutions are in Angstrom, so the low resolution limit is the larger number
        require_ordered("max_resolution", self.max_resolution, self.min_resolution)?;
        require_ordered("min_defocus", self.min_defocus, self.max_defocus)?;
        if let Some(search) = &self.phase_shift {
            require_ordered("phase_shift", search.min, search.max)?;
            require_positive("phase_shift.step", search.step)?;
        }
        if let InputKind::Movie { frames_to_average } = self.input {
            if frames_to_average == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "input.frames_to_average",
                    reason: String::from("must be at least 1"),
                });
            }
        }
        if let Some(expert) = &self.expert {
            if expert.threads == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "expert.threads",
                    reason: String::from("must be at least 1"),
                });
            }
        }
        Ok(())
    }
}

impl CtffindConfig {
    /// The answers to CTFFIND's questions, in the order it asks them
    pub fn prompts(&self, target: &Target) -> Vec<Prompt> {
        let mut prompts = PromptList::default();
        prompts.ask("Input image file name", target.input.display());
        match self.input {
            InputKind::Micrograph => (),
            InputKind::Stack => prompts.confirm("Input is a movie (stack of frames)", false),
            InputKind::Movie { frames_to_average } => {
                prompts.confirm("Input is a movie (stack of frames)", true);
                prompts.ask("Number of frames to average together", frames_to_average);
            }
        }
        prompts.ask("Output diagnostic image file name", target.output.display());
        prompts.ask("Pixel size", self.pixel_size);
        prompts.ask("Acceleration voltage", self.voltage);
        prompts.ask("Spherical aberration", self.spherical_aberration);
        prompts.ask("Amplitude contrast", self.amplitude_contrast);
        prompts.ask("Size of amplitude spectrum to compute", self.spectrum_size);
        prompts.ask("Minimum resolution", self.min_resolution);
        prompts.ask("Maximum resolution", self.max_resolution);
        prompts.ask("Minimum defocus", self.min_defocus);
        prompts.ask("Maximum defocus", self.max_defocus);
        prompts.ask("Defocus search step", self.defocus_step);

        let known = matches!(self.astigmatism, Astigmatism::Known { .. });
        prompts.confirm("Do you know what astigmatism is present?", known);
        prompts.confirm("Slower, more exhaustive search?", self.exhaustive_search);
        match self.astigmatism {
            Astigmatism::Known { astigmatism, angle } => {
                prompts.ask("Known astigmatism", astigmatism);
                prompts.ask("Known astigmatism angle", angle);
            }
            Astigmatism::Unknown { restraint } => {
                prompts.confirm("Use a restraint on astigmatism?", restraint.is_some());
                if let Some(tolerated) = restraint {
                    prompts.ask("Expected (tolerated) astigmatism", tolerated);
                }
            }
        }

        prompts.confirm("Find additional phase shift?", self.phase_shift.is_some());
        match &self.phase_shift {
            Some(search) => {
                prompts.ask("Minimum phase shift (rad)", search.min);
                prompts.ask("Maximum phase shift (rad)", search.max);
                prompts.ask("Phase shift search step", search.step);
            }
            None => prompts.confirm("Determine sample tilt?", self.determine_tilt),
        }

        prompts.confirm("Determine sample thickness?", self.thickness.is_some());
        if let Some(thickness) = &self.thickness {
            prompts.confirm("Use brute force 1D search?", thickness.brute_force_1d);
            prompts.confirm("Use 2D refinement?", thickness.refine_2d);
            prompts.ask(
                "Low resolution limit for nodes",
                thickness.nodes_low_resolution,
            );
            prompts.ask(
                "High resolution limit for nodes",
                thickness.nodes_high_resolution,
            );
            prompts.confirm("Use rounded square for nodes?", thickness.rounded_square);
            prompts.confirm("Downweight nodes?", thickness.downweight_nodes);
        }

        prompts.confirm("Do you want to set expert options?", self.expert.is_some());
        if let Some(expert) = &self.expert {
            prompts.confirm(
                "Resample micrograph if pixel size too small?",
                expert.resample_to.is_some(),
            );
            if let Some(pixel_size) = expert.resample_to {
                prompts.ask("Target pixel size after resampling", pixel_size);
            }
            prompts.confirm(
                "Do you already know the defocus?",
                expert.known_defocus.is_some(),
            );
            if let Some(defocus) = &expert.known_defocus {
                prompts.ask("Known defocus 1", defocus.defocus_1);
                prompts.ask("Known defocus 2", defocus.defocus_2);
                prompts.ask("Known astigmatism angle", defocus.astigmatism_angle);
            }
            prompts.confirm(
                "Weight down low resolution signal?",
                expert.weight_down_low_resolution,
            );
            prompts.ask("Desired number of parallel threads", expert.threads);
        }
        prompts.0
    }

    /// The answers as they are fed to CTFFIND's standard input
    pub fn answers(&self, target: &Target) -> String {
        self.prompts(target)
            .iter()
            .map(|prompt| format!("{}\n", prompt.answer))
            .collect()
    }

    /// A re-runnable shell script for one input
    pub fn com_script(&self, target: &Target) -> String {
        format!(
            "# Created by cryoem_tools ctffind {}\n{} <<EOF\n{}EOF\n",
            env!("CARGO_PKG_VERSION"),
            self.software,
            self.answers(target)
        )
    }

    pub fn invocation(&self, program: &Path, target: &Target) -> ToolInvocation {
        ToolInvocation::new(program).stdin(self.answers(target))
    }

    fn target_spec(&self) -> TargetSpec<'_> {
        TargetSpec {
            dir_in: &self.dir_in,
            suffix_in: &self.suffix_in,
            dir_out: &self.dir_out,
            suffix_out: &self.suffix_out,
            recursive_out: false,
        }
    }
}

impl BatchJob for CtffindConfig {
    fn name(&self) -> &'static str {
        "ctffind"
    }

    fn prepare(&self) -> Result<Vec<BatchTask>, WrapperError> {
        let tool = ExternalTool::locate(&self.software)?;
        let targets = find_targets(&self.target_spec())?;
        std::fs::create_dir_all(&self.dir_out)?;
        let mut tasks = Vec::with_capacity(targets.len());
        for target in targets.iter() {
            if self.write_com_scripts {
                let mut script = target.input.clone().into_os_string();
                script.push(".com");
                std::fs::write(&script, self.com_script(target))?;
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
    use rstest::rstest;

    fn target() -> Target {
        Target {
            stem: String::from("TS_01"),
            input: PathBuf::from("TS_01_alifr.mrc"),
            output: PathBuf::from("out/TS_01_alifr_ctf.mrc"),
        }
    }

    fn questions(config: &CtffindConfig) -> Vec<&'static str> {
        config
            .prompts(&target())
            .iter()
            .map(|prompt| prompt.question)
            .collect()
    }

    #[test]
    fn default_answers() {
        let config = CtffindConfig::default();
        let answers = config.answers(&target());
        let lines: Vec<&str> = answers.lines().collect();
        assert_eq!(
            lines,
            vec![
                "TS_01_alifr.mrc",
                "out/TS_01_alifr_ctf.mrc",
                "1",
                "300",
                "2.7",
                "0.07",
                "512",
                "30",
                "5",
                "5000",
                "50000",
                "100",
                "No",
                "No",
                "No",
                "No",
                "No",
                "No",
                "No",
            ]
        );
    }

    #[test]
    fn tilt_is_only_asked_without_phase_shift() {
        let mut config = CtffindConfig::default();
        assert!(questions(&config).contains(&"Determine sample tilt?"));
        config.phase_shift = Some(PhaseShiftSearch::default());
        let asked = questions(&config);
        assert!(!asked.contains(&"Determine sample tilt?"));
        assert!(asked.contains(&"Phase shift search step"));
    }

    #[rstest]
    #[case(InputKind::Micrograph, 0)]
    #[case(InputKind::Stack, 1)]
    #[case(InputKind::Movie { frames_to_average: 3 }, 2)]
    fn frame_questions(#[case] input: InputKind, #[case] extra: usize) {
        let config = CtffindConfig {
            input,
            ..Default::default()
        };
        let base = questions(&CtffindConfig::default()).len();
        assert_eq!(questions(&config).len(), base + extra);
    }

    #[test]
    fn astigmatism_branches() {
        let known = CtffindConfig {
            astigmatism: Astigmatism::Known {
                astigmatism: 150.0,
                angle: 45.0,
            },
            ..Default::default()
        };
        let asked = questions(&known);
        assert!(asked.contains(&"Known astigmatism angle"));
        assert!(!asked.contains(&"Use a restraint on astigmatism?"));

        let restrained = CtffindConfig {
            astigmatism: Astigmatism::Unknown {
                restraint: Some(200.0),
            },
            ..Default::default()
        };
        let prompts = restrained.prompts(&target());
        let tolerated = prompts
            .iter()
            .find(|prompt| prompt.question == "Expected (tolerated) astigmatism")
            .unwrap();
        assert_eq!(tolerated.answer, "200");
    }

    #[test]
    fn expert_subtree_ends_with_threads() {
        let config = CtffindConfig {
            thickness: Some(ThicknessSearch::default()),
            expert: Some(ExpertOptions {
                known_defocus: Some(KnownDefocus {
                    defocus_1: 12000.0,
                    defocus_2: 11500.0,
                    astigmatism_angle: 30.0,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let prompts = config.prompts(&target());
        let last = prompts.last().unwrap();
        assert_eq!(last.question, "Desired number of parallel threads");
        assert_eq!(last.answer, "12");
        assert!(prompts.iter().any(|p| p.answer == "11500"));
        assert!(prompts
            .iter()
            .any(|p| p.question == "Use rounded square for nodes?"));
    }

    #[test]
    fn com_script_is_a_here_document() {
        let config = CtffindConfig::default();
        let script = config.com_script(&target());
        assert!(script.starts_with("# Created by cryoem_tools ctffind"));
        assert!(script.contains("ctffind <<EOF\nTS_01_alifr.mrc\n"));
        assert!(script.ends_with("No\nEOF\n"));
    }

    #[test]
    fn validation() {
        assert!(CtffindConfig::default().validate().is_ok());
        let swapped = CtffindConfig {
            min_resolution: 3.0,
            max_resolution: 30.0,
            ..Default::default()
        };
        assert!(swapped.validate().is_err());
        let no_frames = CtffindConfig {
            input: InputKind::Movie {
                frames_to_average: 0,
            },
            ..Default::default()
        };
        assert!(no_frames.validate().is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let config = CtffindConfig {
            phase_shift: Some(PhaseShiftSearch::default()),
            expert: Some(ExpertOptions::default()),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: CtffindConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, config);
    }
}
