//! Project profiles: which gates apply to which kind of project.
//!
//! Built-in profiles cover python, typescript, go, and rust, with `general`
//! (no gates) as the fallback. A project can add or override profiles with
//! `.cadence/profiles/<name>.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::types::{Detect, Gate, GateCategory};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::clog_debug;

const DETECTION_ORDER: [&str; 4] = ["python", "typescript", "go", "rust"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub detect_files: Vec<String>,
    #[serde(default)]
    pub detect_extensions: Vec<String>,
    #[serde(default)]
    pub gates: Vec<Gate>,
}

impl Profile {
    pub fn builtin(name: &str) -> Option<Self> {
        let profile = match name {
            "python" => Self {
                name: name.to_string(),
                detect_files: strings(&["pyproject.toml", "setup.py", "requirements.txt"]),
                detect_extensions: strings(&["py"]),
                gates: vec![
                    Gate::new(GateCategory::Lint, "ruff check .").with_fix("ruff check --fix ."),
                    Gate::new(GateCategory::Type, "pyright")
                        .with_detect(Detect::Binary("pyright".to_string()))
                        .advisory(),
                    Gate::new(GateCategory::Test, "pytest"),
                ],
            },
            "typescript" => Self {
                name: name.to_string(),
                detect_files: strings(&["tsconfig.json", "package.json"]),
                detect_extensions: strings(&["ts", "tsx"]),
                gates: vec![
                    Gate::new(GateCategory::Lint, "npm run lint").with_fix("npm run lint -- --fix"),
                    Gate::new(GateCategory::Type, "npx tsc --noEmit")
                        .with_detect(Detect::FileExists(PathBuf::from("tsconfig.json"))),
                    Gate::new(GateCategory::Test, "npm test"),
                    Gate::new(GateCategory::Build, "npm run build"),
                ],
            },
            "go" => Self {
                name: name.to_string(),
                detect_files: strings(&["go.mod"]),
                detect_extensions: strings(&["go"]),
                gates: vec![
                    Gate::new(GateCategory::Lint, "golangci-lint run")
                        .with_fix("golangci-lint run --fix")
                        .with_detect(Detect::Binary("golangci-lint".to_string())),
                    Gate::new(GateCategory::Test, "go test ./..."),
                    Gate::new(GateCategory::Build, "go build ./..."),
                ],
            },
            "rust" => Self {
                name: name.to_string(),
                detect_files: strings(&["Cargo.toml"]),
                detect_extensions: strings(&["rs"]),
                gates: vec![
                    Gate::new(GateCategory::Lint, "cargo clippy -- -D warnings")
                        .with_fix("cargo clippy --fix --allow-dirty --allow-staged"),
                    Gate::new(GateCategory::Test, "cargo test"),
                    Gate::new(GateCategory::Build, "cargo build"),
                    Gate::new(GateCategory::Docs, "cargo doc --no-deps"),
                ],
            },
            "general" => Self {
                name: name.to_string(),
                detect_files: Vec::new(),
                detect_extensions: Vec::new(),
                gates: Vec::new(),
            },
            _ => return None,
        };
        Some(profile)
    }

    /// Whether a project root looks like this profile.
    pub fn matches(&self, root: &Path) -> bool {
        if self.detect_files.iter().any(|f| root.join(f).exists()) {
            return true;
        }
        if self.detect_extensions.is_empty() {
            return false;
        }
        fs::read_dir(root)
            .map(|entries| {
                entries.flatten().any(|entry| {
                    entry
                        .path()
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| self.detect_extensions.iter().any(|x| x == e))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    /// Pick the first built-in profile matching the project.
    pub fn detect(root: &Path) -> Self {
        for name in DETECTION_ORDER {
            if let Some(profile) = Self::builtin(name) {
                if profile.matches(root) {
                    clog_debug!("Detected profile {} for {}", name, root.display());
                    return profile;
                }
            }
        }
        Self::general()
    }

    pub fn general() -> Self {
        Self {
            name: "general".to_string(),
            detect_files: Vec::new(),
            detect_extensions: Vec::new(),
            gates: Vec::new(),
        }
    }

    /// Load a profile by name, preferring a project file over the built-in.
    pub fn load(root: &Path, name: &str) -> Result<Self> {
        let path = Self::project_path(root, name);
        if path.exists() {
            clog_debug!("Loading profile {} from {}", name, path.display());
            let mut profile: Profile = toml::from_str(&fs::read_to_string(&path)?)?;
            profile.name = name.to_string();
            return Ok(profile);
        }
        Self::builtin(name).ok_or_else(|| Error::ProfileNotFound(name.to_string()))
    }

    /// Resolve the configured profile, or detect one.
    pub fn resolve(root: &Path, configured: Option<&str>) -> Result<Self> {
        match configured {
            Some(name) => Self::load(root, name),
            None => Ok(Self::detect(root)),
        }
    }

    pub fn project_path(root: &Path, name: &str) -> PathBuf {
        Config::project_dir(root)
            .join("profiles")
            .join(format!("{}.toml", name))
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
