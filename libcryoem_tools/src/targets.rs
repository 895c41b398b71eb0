use fxhash::FxHashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::error::TargetError;

/// Where to find inputs and where their outputs go
#[derive(Debug, Clone)]
pub struct TargetSpec<'a> {
    pub dir_in: &'a Path,
    pub suffix_in: &'a str,
    pub dir_out: &'a Path,
    pub suffix_out: &'a str,
    /// Search the output directory recursively when deciding what is already done
    pub recursive_out: bool,
}

/// One unit of batch work: an input file and the output it will produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub stem: String,
    pub input: PathBuf,
    pub output: PathBuf,
}

/// Get all files in `dir` whose names start with `prefix` and end with `suffix`.
/// Returns the files sorted by path.
pub fn list_files(
    dir: &Path,
    prefix: &str,
    suffix: &str,
    recursive: bool,
) -> Result<Vec<PathBuf>, TargetError> {
    if !dir.is_dir() {
        return Err(TargetError::BadFilePath(dir.to_path_buf()));
    }
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut file_list: Vec<PathBuf> = Vec::new();
    // Symlinked directories are not descended into; symlinked files still count
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
    {
        let entry = entry.map_err(std::io::Error::from)?;
        let is_file = entry.file_type().is_file()
            || (entry.path_is_symlink() && entry.path().is_file());
        if !is_file {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.starts_with(prefix) && name.ends_with(suffix) {
            file_list.push(entry.into_path());
        }
    }
    file_list.sort();
    Ok(file_list)
}

/// File name of `path` with `suffix` removed, if the name ends with it
pub fn stem_of(path: &Path, suffix: &str) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(suffix))
        .map(String::from)
}

/// Find the inputs that do not yet have an output.
///
/// An input `<stem><suffix_in>` is done when a file `<stem><suffix_out>` exists in the
/// output directory (or below it, when `recursive_out` is set). The unfinished targets
/// are returned sorted by stem. Having no inputs at all is an error, having no work left
/// is not.
pub fn find_targets(spec: &TargetSpec) -> Result<Vec<Target>, TargetError> {
    let inputs = list_files(spec.dir_in, "", spec.suffix_in, false)?;
    if inputs.is_empty() {
        return Err(TargetError::NoInputFiles {
            dir: spec.dir_in.to_path_buf(),
            suffix: spec.suffix_in.to_string(),
        });
    }

    let done: FxHashSet<String> = if spec.dir_out.is_dir() {
        list_files(spec.dir_out, "", spec.suffix_out, spec.recursive_out)?
            .iter()
            .filter_map(|path| stem_of(path, spec.suffix_out))
            .collect()
    } else {
        FxHashSet::default()
    };

    let mut targets: Vec<Target> = inputs
        .into_iter()
        .filter_map(|input| {
            let stem = stem_of(&input, spec.suffix_in)?;
            if done.contains(&stem) {
                return None;
            }
            let output = spec.dir_out.join(format!("{stem}{}", spec.suffix_out));
            Some(Target {
                stem,
                input,
                output,
            })
        })
        .collect();
    targets.sort_by(|a, b| a.stem.cmp(&b.stem));
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn unfinished_inputs_only() {
        let dir = tempfile::tempdir().unwrap();
        let movies = dir.path().join("movies");
        let output = dir.path().join("ctf");
        for stem in ["b", "a", "c"] {
            touch(&movies.join(format!("{stem}_EER.eer")));
        }
        touch(&movies.join("notes.txt"));
        touch(&output.join("b_ctf.mrc"));

        let spec = TargetSpec {
            dir_in: &movies,
            suffix_in: "_EER.eer",
            dir_out: &output,
            suffix_out: "_ctf.mrc",
            recursive_out: false,
        };
        let targets = find_targets(&spec).unwrap();
        let stems: Vec<&str> = targets.iter().map(|t| t.stem.as_str()).collect();
        assert_eq!(stems, vec!["a", "c"]);
        assert_eq!(targets[0].output, output.join("a_ctf.mrc"));
    }

    #[test]
    fn recursive_output_search() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in");
        let output = dir.path().join("out");
        touch(&input.join("ts1.mrc"));
        touch(&input.join("ts2.mrc"));
        touch(&output.join("ts1").join("ts1_rec.mrc"));

        let mut spec = TargetSpec {
            dir_in: &input,
            suffix_in: ".mrc",
            dir_out: &output,
            suffix_out: "_rec.mrc",
            recursive_out: false,
        };
        assert_eq!(find_targets(&spec).unwrap().len(), 2);
        spec.recursive_out = true;
        let targets = find_targets(&spec).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].stem, "ts2");
    }

    #[test]
    fn no_inputs_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let spec = TargetSpec {
            dir_in: dir.path(),
            suffix_in: ".tiff",
            dir_out: dir.path(),
            suffix_out: ".mrc",
            recursive_out: false,
        };
        assert!(matches!(
            find_targets(&spec),
            Err(TargetError::NoInputFiles { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_not_followed() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.mrc"));
        touch(&dir.path().join("sub").join("b.mrc"));
        symlink(dir.path(), dir.path().join("sub").join("loop")).unwrap();
        symlink(dir.path().join("a.mrc"), dir.path().join("linked.mrc")).unwrap();

        let files = list_files(dir.path(), "", ".mrc", true).unwrap();
        assert_eq!(
            files,
            vec![
                dir.path().join("a.mrc"),
                dir.path().join("linked.mrc"),
                dir.path().join("sub").join("b.mrc"),
            ]
        );
        assert_eq!(list_files(dir.path(), "", ".mrc", false).unwrap().len(), 2);
    }
}
