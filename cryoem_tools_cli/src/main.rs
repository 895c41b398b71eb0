use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::error::Error;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc::channel;

use libcryoem_tools::alarm::{AlarmConfig, FolderProbe, Monitor, MonitorOutcome, SmtpNotifier, SystemClock};
use libcryoem_tools::alignframes::AlignframesConfig;
use libcryoem_tools::aretomo::AretomoConfig;
use libcryoem_tools::coarsen::CoarsenConfig;
use libcryoem_tools::config::{expand_home, YamlConfig};
use libcryoem_tools::ctffind::CtffindConfig;
use libcryoem_tools::ctffind_results::{CtffindSummary, AVROT_SUFFIX};
use libcryoem_tools::filter::{filter_star_file, FilterMode, ReferenceSet};
use libcryoem_tools::fsc::{read_curves, report, write_tsv};
use libcryoem_tools::motioncor::MotioncorConfig;
use libcryoem_tools::process::{process, BatchJob, BatchOptions};
use libcryoem_tools::star::StarFile;
use libcryoem_tools::targets::list_files;
use libcryoem_tools::transform::{convert_cbox_file, randomize_column, scale_directory};

type CliResult = Result<(), Box<dyn Error>>;

const LOG_FILE: &str = "cryoem_tools.log";
const CONFIG_TOOLS: [&str; 6] = ["ctffind", "aretomo", "alignframes", "motioncor", "coarsen", "alarm"];

fn config_arg() -> Arg {
    Arg::new("path")
        .short('p')
        .long("path")
        .required(true)
        .help("Path to the YAML configuration file")
}

fn batch_command(name: &'static str, about: &'static str) -> Command {
    Command::new(name)
        .about(about)
        .arg(config_arg())
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Only log the commands that would run"),
        )
        .arg(
            Arg::new("keep-going")
                .long("keep-going")
                .action(ArgAction::SetTrue)
                .help("Continue with the next input after a failed one"),
        )
}

fn cli() -> Command {
    Command::new("cryoem_tools")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Utilities for cryo-EM data processing")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .subcommand(
            Command::new("new")
                .about("Make a template configuration yaml file")
                .arg(
                    Arg::new("tool")
                        .required(true)
                        .value_parser(CONFIG_TOOLS)
                        .help("Tool to write the template for"),
                )
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("mult-coord")
                .about("Scale the coordinates of .star, .cbox or .box files")
                .arg(Arg::new("dir").long("path").default_value("./"))
                .arg(Arg::new("label").long("label").default_value("star"))
                .arg(
                    Arg::new("factor")
                        .long("mult")
                        .required(true)
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(Arg::new("out").long("out").help("Output directory [default: --path]")),
        )
        .subcommand(
            Command::new("cbox-to-star")
                .about("Convert crYOLO .cbox files to RELION coordinate .star files")
                .arg(Arg::new("dir").long("path").default_value("./"))
                .arg(Arg::new("label").long("label").default_value("cbox"))
                .arg(
                    Arg::new("factor")
                        .long("mult")
                        .default_value("1")
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    Arg::new("filaments")
                        .long("filaments")
                        .action(ArgAction::SetTrue)
                        .help("Keep only the two end points of every filament"),
                )
                .arg(Arg::new("out").long("out").help("Output directory [default: --path]")),
        )
        .subcommand(
            Command::new("star-filter")
                .about("Extract or exclude rows of a STAR file by reference files")
                .arg(Arg::new("input").long("i").required(true))
                .arg(Arg::new("output").long("o").required(true))
                .arg(
                    Arg::new("extract")
                        .long("extract")
                        .num_args(1..)
                        .conflicts_with("exclude")
                        .required_unless_present("exclude"),
                )
                .arg(Arg::new("exclude").long("exclude").num_args(1..)),
        )
        .subcommand(
            Command::new("star-rand-col")
                .about("Fill a STAR column with uniform random values")
                .arg(Arg::new("input").long("i").default_value("particles.star"))
                .arg(Arg::new("output").long("o").required(true))
                .arg(Arg::new("column").long("col").required(true))
                .arg(
                    Arg::new("range")
                        .long("range")
                        .num_args(2)
                        .allow_negative_numbers(true)
                        .default_values(["-1", "1"])
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(batch_command("ctffind", "Run CTFFIND over unprocessed micrographs"))
        .subcommand(
            Command::new("ctffind-results")
                .about("Collect CTFFIND text outputs into a CSV table")
                .arg(Arg::new("dir").long("path").default_value("./"))
                .arg(Arg::new("suffix").long("suffix").default_value("_ctf.txt"))
                .arg(
                    Arg::new("avrot")
                        .long("avrot")
                        .action(ArgAction::SetTrue)
                        .help("Also join the matching _avrot.txt files"),
                )
                .arg(Arg::new("output").long("o").default_value("ctffind_results.csv")),
        )
        .subcommand(batch_command("aretomo", "Run AreTomo over unprocessed tilt series"))
        .subcommand(batch_command("alignframes", "Run IMOD alignframes for every .mdoc"))
        .subcommand(batch_command("motioncor", "Run MotionCor2 over unprocessed movies"))
        .subcommand(batch_command("coarsen", "Bin micrographs with relion_image_handler"))
        .subcommand(
            Command::new("fsc")
                .about("Report the resolution of FSC curves")
                .arg(Arg::new("input").long("i").required(true).num_args(1..))
                .arg(
                    Arg::new("pixel_size")
                        .long("pix")
                        .default_value("1")
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    Arg::new("threshold")
                        .long("threshold")
                        .default_value("0.143")
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    Arg::new("tsv")
                        .long("tsv")
                        .help("Directory to write the curves as TSV tables"),
                ),
        )
        .subcommand(
            Command::new("alarm")
                .about("Watch a data collection folder and e-mail on stalls")
                .arg(config_arg())
                .arg(
                    Arg::new("detach")
                        .long("detach")
                        .action(ArgAction::SetTrue)
                        .help("Keep monitoring in a background process and return"),
                ),
        )
}

fn init_logging() -> Result<MultiProgress, Box<dyn Error>> {
    let level = simplelog::LevelFilter::Info;
    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![simplelog::TermLogger::new(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )];
    match File::options().create(true).append(true).open(LOG_FILE) {
        Ok(file) => loggers.push(simplelog::WriteLogger::new(
            level,
            simplelog::Config::default(),
            file,
        )),
        Err(e) => eprintln!("Could not open {LOG_FILE}, logging to the terminal only: {e}"),
    }

    let pb_manager = MultiProgress::new();
    LogWrapper::new(pb_manager.clone(), simplelog::CombinedLogger::new(loggers)).try_init()?;
    log::set_max_level(level);
    Ok(pb_manager)
}

fn path_arg(matches: &ArgMatches, id: &str) -> PathBuf {
    matches
        .get_one::<String>(id)
        .map(|path| expand_home(Path::new(path)))
        .unwrap_or_default()
}

fn make_template(matches: &ArgMatches) -> CliResult {
    let path = path_arg(matches, "path");
    let tool = matches.get_one::<String>("tool").map(String::as_str);
    log::info!("Making a template config at {}...", path.display());
    match tool {
        Some("ctffind") => CtffindConfig::write_template(&path)?,
        Some("aretomo") => AretomoConfig::write_template(&path)?,
        Some("alignframes") => AlignframesConfig::write_template(&path)?,
        Some("motioncor") => MotioncorConfig::write_template(&path)?,
        Some("coarsen") => CoarsenConfig::write_template(&path)?,
        Some("alarm") => AlarmConfig::write_template(&path)?,
        _ => return Err("unknown tool".into()),
    }
    log::info!("Done.");
    Ok(())
}

fn run_batch_tool<J>(matches: &ArgMatches, pb_manager: &MultiProgress) -> CliResult
where
    J: YamlConfig + BatchJob + Send + 'static,
{
    let config_path = path_arg(matches, "path");
    log::info!("Loading config from {}...", config_path.display());
    let job = J::read_config_file(&config_path)?;
    log::info!("Config successfully loaded.");
    let options = BatchOptions {
        dry_run: matches.get_flag("dry-run"),
        keep_going: matches.get_flag("keep-going"),
    };

    let pb = pb_manager.add(ProgressBar::new(0));
    if let Ok(style) = ProgressStyle::with_template("{msg:20} [{bar:40}] {pos}/{len} ({elapsed})") {
        pb.set_style(style);
    }
    let (tx, rx) = channel();
    // Spawn the task!
    let handle = std::thread::spawn(move || process(&job, options, tx));

    // The channel closes once the worker returns
    for status in rx.iter() {
        pb.set_length(status.total as u64);
        pb.set_position(status.completed as u64);
        pb.set_message(status.task);
    }
    pb.finish();

    let summary = match handle.join() {
        Ok(result) => result?,
        Err(_) => return Err("failed to join the worker thread".into()),
    };
    if summary.is_success() {
        log::info!("Successfully processed {} input(s).", summary.succeeded);
        Ok(())
    } else {
        Err(format!(
            "{} input(s) failed: {}",
            summary.failed.len(),
            summary.failed.join(", ")
        )
        .into())
    }
}

fn mult_coord(matches: &ArgMatches) -> CliResult {
    let dir = path_arg(matches, "dir");
    let out = matches
        .get_one::<String>("out")
        .map(PathBuf::from)
        .unwrap_or_else(|| dir.clone());
    let label = matches.get_one::<String>("label").map(String::as_str).unwrap_or("star");
    let factor = matches.get_one::<f64>("factor").copied().unwrap_or(1.0);
    let written = scale_directory(&dir, label, factor, &out)?;
    log::info!("Scaled {} file(s) by {factor}.", written.len());
    Ok(())
}

fn cbox_to_star(matches: &ArgMatches) -> CliResult {
    let dir = path_arg(matches, "dir");
    let out = matches
        .get_one::<String>("out")
        .map(PathBuf::from)
        .unwrap_or_else(|| dir.clone());
    let label = matches.get_one::<String>("label").map(String::as_str).unwrap_or("cbox");
    let factor = matches.get_one::<f64>("factor").copied().unwrap_or(1.0);
    let filaments = matches.get_flag("filaments");
    let inputs = list_files(&dir, "", label, false)?;
    if inputs.is_empty() {
        return Err(format!("no files ending with {label} in {}", dir.display()).into());
    }
    std::fs::create_dir_all(&out)?;
    for input in inputs.iter() {
        convert_cbox_file(input, factor, filaments, &out)?;
    }
    log::info!("Converted {} file(s).", inputs.len());
    Ok(())
}

fn star_filter(matches: &ArgMatches) -> CliResult {
    let input = path_arg(matches, "input");
    let output = path_arg(matches, "output");
    let (mode, id) = if matches.contains_id("extract") {
        (FilterMode::Extract, "extract")
    } else {
        (FilterMode::Exclude, "exclude")
    };
    let reference_paths: Vec<PathBuf> = matches
        .get_many::<String>(id)
        .map(|values| values.map(|value| expand_home(Path::new(value))).collect())
        .unwrap_or_default();

    let references = ReferenceSet::from_files(&reference_paths)?;
    log::info!(
        "Loaded {} reference key(s) from {} file(s).",
        references.len(),
        reference_paths.len()
    );
    let star = StarFile::read(&input)?;
    let filtered = filter_star_file(&star, &references, mode)?;
    filtered.write(&output)?;
    log::info!("Wrote {}", output.display());
    Ok(())
}

fn star_rand_col(matches: &ArgMatches) -> CliResult {
    let input = path_arg(matches, "input");
    let output = path_arg(matches, "output");
    let column = matches
        .get_one::<String>("column")
        .ok_or("a column name is required")?;
    let range: Vec<f64> = matches
        .get_many::<f64>("range")
        .map(|values| values.copied().collect())
        .unwrap_or_default();
    let (low, high) = match range.as_slice() {
        [low, high] => (*low, *high),
        _ => return Err("--range needs two values".into()),
    };
    let mut rng = match matches.get_one::<u64>("seed") {
        Some(seed) => StdRng::seed_from_u64(*seed),
        None => StdRng::from_entropy(),
    };

    let mut star = StarFile::read(&input)?;
    randomize_column(&mut star, column, low, high, &mut rng)?;
    star.write(&output)?;
    log::info!(
        "Filled {column} with values in [{low}, {high}], wrote {}",
        output.display()
    );
    Ok(())
}

fn ctffind_results(matches: &ArgMatches) -> CliResult {
    let dir = path_arg(matches, "dir");
    let suffix = matches
        .get_one::<String>("suffix")
        .map(String::as_str)
        .unwrap_or("_ctf.txt");
    let output = path_arg(matches, "output");

    let mut files = list_files(&dir, "", suffix, false)?;
    if matches.get_flag("avrot") {
        let avrot_suffix = format!(
            "{}{AVROT_SUFFIX}",
            suffix.strip_suffix(".txt").unwrap_or(suffix)
        );
        files.extend(list_files(&dir, "", &avrot_suffix, false)?);
    }
    if files.is_empty() {
        return Err(format!("no files ending with {suffix} in {}", dir.display()).into());
    }
    let summary = CtffindSummary::from_files(&files)?;
    summary.write_csv(&output)?;
    log::info!(
        "Collected {} micrograph(s) from {} file(s) into {}",
        summary.record_count(),
        files.len(),
        output.display()
    );
    Ok(())
}

fn fsc(matches: &ArgMatches) -> CliResult {
    let pixel_size = matches.get_one::<f64>("pixel_size").copied().unwrap_or(1.0);
    let threshold = matches.get_one::<f64>("threshold").copied().unwrap_or(0.143);
    let tsv_dir = matches.get_one::<String>("tsv").map(PathBuf::from);
    let inputs: Vec<PathBuf> = matches
        .get_many::<String>("input")
        .map(|values| values.map(PathBuf::from).collect())
        .unwrap_or_default();

    for input in inputs.iter() {
        let curves = read_curves(input, pixel_size)?;
        for line in report(input, &curves, threshold).lines() {
            log::info!("{line}");
        }
        if let Some(dir) = &tsv_dir {
            for path in write_tsv(dir, &curves)? {
                log::info!("Wrote {}", path.display());
            }
        }
    }
    Ok(())
}

/// Start this program again without `--detach`, detached from the terminal
fn detach() -> CliResult {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--detach")
        .collect();
    let child = std::process::Command::new(exe)
        .args(&args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    log::info!(
        "Monitor continues in process {}, progress is logged to {LOG_FILE}.",
        child.id()
    );
    Ok(())
}

fn alarm(matches: &ArgMatches) -> CliResult {
    if matches.get_flag("detach") {
        return detach();
    }
    let config_path = path_arg(matches, "path");
    log::info!("Loading config from {}...", config_path.display());
    let config = AlarmConfig::read_config_file(&config_path)?;
    log::info!("Config successfully loaded.");
    log::info!("Watching: {}", config.path.display());
    log::info!("Label: {}", config.label);
    log::info!("Recipients: {}", config.recipients.join(", "));
    log::info!("Lifetime: {} day(s)", config.lifetime_days);

    let notifier = SmtpNotifier::new(&config)?;
    let probe = FolderProbe::new(&config.path, &config.label);
    let mut monitor = Monitor::new(config, notifier, SystemClock::new(), probe);
    match monitor.run()? {
        MonitorOutcome::Finished => Ok(()),
        MonitorOutcome::Stalled => Err("data collection stalled".into()),
    }
}

/// The error and its sources. Causes whose text is already part of the message are
/// not repeated.
fn error_chain(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn main() -> ExitCode {
    let matches = cli().get_matches();

    // Initialize feedback
    let pb_manager = match init_logging() {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Could not create logging/progress: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match matches.subcommand() {
        Some(("new", sub)) => make_template(sub),
        Some(("mult-coord", sub)) => mult_coord(sub),
        Some(("cbox-to-star", sub)) => cbox_to_star(sub),
        Some(("star-filter", sub)) => star_filter(sub),
        Some(("star-rand-col", sub)) => star_rand_col(sub),
        Some(("ctffind", sub)) => run_batch_tool::<CtffindConfig>(sub, &pb_manager),
        Some(("ctffind-results", sub)) => ctffind_results(sub),
        Some(("aretomo", sub)) => run_batch_tool::<AretomoConfig>(sub, &pb_manager),
        Some(("alignframes", sub)) => run_batch_tool::<AlignframesConfig>(sub, &pb_manager),
        Some(("motioncor", sub)) => run_batch_tool::<MotioncorConfig>(sub, &pb_manager),
        Some(("coarsen", sub)) => run_batch_tool::<CoarsenConfig>(sub, &pb_manager),
        Some(("fsc", sub)) => fsc(sub),
        Some(("alarm", sub)) => alarm(sub),
        _ => Err("unknown subcommand".into()),
    };

    match result {
        Ok(()) => {
            log::info!("Done.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", error_chain(e.as_ref()));
            ExitCode::FAILURE
        }
    }
}
