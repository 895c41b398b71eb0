//! # cryoem_tools
//!
//! cryoem_tools is a collection of small utilities for cryo-EM data processing, written
//! in Rust. It converts and filters particle coordinate files, drives the usual external
//! programs (CTFFIND, AreTomo, IMOD alignframes, MotionCor2, relion_image_handler) over
//! whole directories, summarises their results, estimates resolution from FSC curves and
//! watches a data collection folder, sending e-mails when it stops growing.
//!
//! ## Installation
//!
//! The only method of install is from source. If you have not used Rust before, you will
//! most likely need to install the Rust tool chain. See the
//! [Rust docs](https://www.rust-lang.org/tools/install) for installation instructions.
//!
//! To build and install the CLI use `cargo install --path ./cryoem_tools_cli` from the top
//! level of the repository. The binary `cryoem_tools` is installed to your cargo install
//! location (typically `~/.cargo/bin/`).
//!
//! The external programs are not part of this repository. They are looked up on `PATH`
//! unless the `software` field of a configuration gives a full path.
//!
//! ## Tools
//!
//! | Subcommand        | Does                                                              |
//! |-------------------|-------------------------------------------------------------------|
//! | `mult-coord`      | Scale the coordinates of `.star`, `.cbox` or `.box` files          |
//! | `cbox-to-star`    | Convert crYOLO `.cbox` files to RELION coordinate files            |
//! | `star-filter`     | Extract or exclude rows of a STAR file using reference files       |
//! | `star-rand-col`   | Fill a STAR column with uniform random values                      |
//! | `ctffind`         | Run CTFFIND over every micrograph without an output                |
//! | `ctffind-results` | Collect CTFFIND text outputs into one CSV table                    |
//! | `aretomo`         | Run AreTomo over every tilt series without a reconstruction        |
//! | `alignframes`     | Run IMOD alignframes for every SerialEM `.mdoc`                    |
//! | `motioncor`       | Run MotionCor2 over every movie without an aligned sum             |
//! | `coarsen`         | Bin micrographs with relion_image_handler                          |
//! | `fsc`             | Report the resolution of FSC curves                                |
//! | `alarm`           | Watch a data collection folder and send e-mails on stalls          |
//!
//! ## Configuration
//!
//! The tools that wrap an external program, and the alarm, are configured with a YAML
//! file. `cryoem_tools new <tool> -p <file>` writes a template with the default values,
//! for example for `coarsen`:
//!
//! ```yml
//! software: relion_image_handler
//! dir: ./
//! suffix_in: _noDW.mrc
//! factor: 8
//! pixel_size: 1.0
//! ```
//!
//! Every field may be left out, in which case the default is used. Batch tools only
//! process inputs `<stem><suffix_in>` for which no `<stem><suffix_out>` exists yet in the
//! output directory, so an interrupted run can simply be started again.
//!
//! ## Output
//!
//! Besides the files each tool writes, the CLI keeps a log file `cryoem_tools.log` in the
//! working directory. Wrapped programs have their output saved next to the file they
//! produce, with the extension `.log`. It is not advised to delete the log files.
pub mod alarm;
pub mod alignframes;
pub mod aretomo;
pub mod coarsen;
pub mod config;
pub mod ctffind;
pub mod ctffind_results;
pub mod error;
pub mod filter;
pub mod fsc;
pub mod mdoc;
pub mod motioncor;
pub mod process;
pub mod star;
pub mod targets;
pub mod tool;
pub mod transform;
pub mod worker_status;
