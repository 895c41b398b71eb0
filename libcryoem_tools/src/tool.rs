use std::ffi::OsString;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::error::ToolError;

/// An executable resolved to a concrete path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTool {
    path: PathBuf,
}

impl ExternalTool {
    /// Resolve a program. Names containing a path separator are checked directly, bare
    /// names are searched for on `PATH`.
    pub fn locate(name: &str) -> Result<Self, ToolError> {
        let candidate = Path::new(name);
        if candidate.components().count() > 1 {
            return Self::from_path(candidate);
        }
        let search_path = std::env::var_os("PATH").unwrap_or_default();
        std::env::split_paths(&search_path)
            .map(|dir| dir.join(name))
            .find(|path| is_executable(path))
            .map(|path| Self { path })
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self, ToolError> {
        if !path.exists() {
            return Err(ToolError::NotFound(path.display().to_string()));
        }
        if !is_executable(path) {
            return Err(ToolError::NotExecutable(path.to_path_buf()));
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Captured result of a finished invocation
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// A program plus its argument vector. Nothing is passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    program: PathBuf,
    args: Vec<OsString>,
    stdin: Option<String>,
    current_dir: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            args: vec![],
            stdin: None,
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl fmt::Display) -> Self {
        self.args.push(arg.to_string().into());
        self
    }

    /// Push a path without going through its lossy display form
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_owned());
        self
    }

    /// Push `-name value`
    pub fn flag(self, name: &str, value: impl fmt::Display) -> Self {
        self.arg(name).arg(value)
    }

    /// Push `-name path`
    pub fn flag_path(self, name: &str, path: &Path) -> Self {
        self.arg(name).arg_path(path)
    }

    /// Push `-name v1 v2 ...` with every value as its own argument
    pub fn flag_values<T: fmt::Display>(mut self, name: &str, values: &[T]) -> Self {
        self.args.push(name.into());
        self.args
            .extend(values.iter().map(|value| OsString::from(value.to_string())));
        self
    }

    /// Push the flag only when a value is present
    pub fn flag_opt<T: fmt::Display>(self, name: &str, value: Option<T>) -> Self {
        match value {
            Some(value) => self.flag(name, value),
            None => self,
        }
    }

    pub fn flag_path_opt(self, name: &str, path: Option<&Path>) -> Self {
        match path {
            Some(path) => self.flag_path(name, path),
            None => self,
        }
    }

    pub fn stdin(mut self, input: String) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn stdin_text(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// Run to completion, capturing output. A non-zero exit status is an error.
    pub fn run(&self) -> Result<ToolOutput, ToolError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ToolError::SpawnFailed {
            program: self.program.clone(),
            source,
        })?;

        // Feed stdin from a separate thread so a chatty child cannot block on a full
        // stdout pipe while we are still writing.
        let feeder = match (child.stdin.take(), self.stdin.clone()) {
            (Some(mut pipe), Some(input)) => {
                Some(std::thread::spawn(move || pipe.write_all(input.as_bytes())))
            }
            _ => None,
        };

        let output = child.wait_with_output()?;
        if let Some(handle) = feeder {
            match handle.join() {
                Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    return Err(ToolError::IOError(e));
                }
                Err(_) => log::warn!("stdin feeder for {} panicked", self.program.display()),
                _ => (),
            }
        }

        let result = ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if output.status.success() {
            Ok(result)
        } else {
            Err(ToolError::Failed {
                program: self.program.clone(),
                code: result.code,
                stdout: result.stdout,
                stderr: result.stderr,
            })
        }
    }
}

/// Quote a word for display the way a POSIX shell would need it
fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program.to_string_lossy()))?;
        for arg in self.args.iter() {
            write!(f, " {}", shell_quote(&arg.to_string_lossy()))?;
        }
        Ok(())
    }
}
