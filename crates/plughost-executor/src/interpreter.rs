//! Entry-point interpreter selection.

use std::ffi::OsStr;
use std::path::Path;

use plughost_sandbox::CommandSpec;

/// Interpreters recognised from the entry point's file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    /// `.sh`, `.bash`
    Shell,
    /// `.py`
    Python,
    /// `.js`, `.mjs`
    JavaScript,
    /// `.ts`, `.mts`
    TypeScript,
}

impl Interpreter {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "sh" | "bash" => Some(Self::Shell),
            "py" => Some(Self::Python),
            "js" | "mjs" => Some(Self::JavaScript),
            "ts" | "mts" => Some(Self::TypeScript),
            _ => None,
        }
    }

    pub fn for_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(OsStr::to_str)
            .and_then(Self::from_extension)
    }

    pub fn program(&self) -> &'static str {
        match self {
            Self::Shell => "bash",
            Self::Python => "python3",
            Self::JavaScript => "node",
            Self::TypeScript => "deno",
        }
    }

    /// Arguments placed before the script path.
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &["-u"],
            Self::Shell | Self::JavaScript => &[],
            Self::TypeScript => &["run", "--allow-all"],
        }
    }
}

/// The command that launches `entry`.  Unknown extensions are executed
/// directly.
pub fn launch_command(entry: &Path) -> CommandSpec {
    match Interpreter::for_path(entry) {
        Some(interpreter) => CommandSpec::new(interpreter.program())
            .args(interpreter.args())
            .arg(entry),
        None => CommandSpec::new(entry),
    }
}
