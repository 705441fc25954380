use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Ordered build instructions plus the directory they are built in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dockerfile {
    name: String,
    context: PathBuf,
    instructions: Vec<String>,
}

impl Dockerfile {
    pub fn new(name: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            context: context.into(),
            instructions: Vec::new(),
        }
    }

    /// Reads a Dockerfile from disk, one instruction per logical line.
    /// Comments and blank lines are dropped, `\` continuations are kept joined.
    pub fn load<P: AsRef<Path>>(path: P, context: impl Into<PathBuf>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read Dockerfile {}", path.display()))?;

        let mut dockerfile = Self::new(path.display().to_string(), context);
        let mut pending = String::new();
        for line in contents.lines() {
            let trimmed = line.trim();
            if pending.is_empty() && (trimmed.is_empty() || trimmed.starts_with('#')) {
                continue;
            }
            match trimmed.strip_suffix('\\') {
                Some(continued) => {
                    pending.push_str(continued);
                    pending.push_str("\\\n");
                }
                None => {
                    pending.push_str(trimmed);
                    dockerfile.instructions.push(std::mem::take(&mut pending));
                }
            }
        }
        if !pending.is_empty() {
            dockerfile.instructions.push(pending);
        }

        Ok(dockerfile)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Path {
        &self.context
    }

    pub fn instructions(&self) -> &[String] {
        &self.instructions
    }

    pub fn instruction(mut self, keyword: &str, args: impl AsRef<str>) -> Self {
        self.instructions
            .push(format!("{} {}", keyword.to_uppercase(), args.as_ref()));
        self
    }

    pub fn from(self, image: impl AsRef<str>) -> Self {
        self.instruction("FROM", image)
    }

    pub fn workdir(self, dir: impl AsRef<str>) -> Self {
        self.instruction("WORKDIR", dir)
    }

    pub fn copy(self, source: &str, dest: &str) -> Self {
        self.instruction("COPY", format!("{} {}", source, dest))
    }

    pub fn run(self, command: impl AsRef<str>) -> Self {
        self.instruction("RUN", command)
    }

    pub fn env(self, key: &str, value: &str) -> Self {
        self.instruction("ENV", format!("{}={}", key, value))
    }

    pub fn cmd(self, command: impl AsRef<str>) -> Self {
        self.instruction("CMD", command)
    }
}

impl fmt::Display for Dockerfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instruction in &self.instructions {
            writeln!(f, "{}", instruction)?;
        }
        Ok(())
    }
}
