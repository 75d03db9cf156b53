//! Kernel specs: how to start a kernel, and the registry that resolves
//! launch-by-name requests.
//!
//! A spec is an argv template plus environment. The `{connection_file}`
//! placeholder is substituted at launch with the path of the generated
//! connection file.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How a kernel expects to be interrupted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    /// Send the platform interrupt signal to the process.
    #[default]
    Signal,
    /// Send an `interrupt_request` on the control channel.
    Message,
}

/// A launchable kernel description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Registry key, e.g. `python3`.
    pub name: String,
    /// Human-facing label, e.g. `Python 3 (ipykernel)`.
    pub display_name: String,
    /// Language the kernel executes.
    pub language: String,
    /// Command template; `{connection_file}` is substituted at launch.
    pub argv: Vec<String>,
    /// Extra environment for the spawned process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Interrupt delivery mechanism.
    #[serde(default)]
    pub interrupt_mode: InterruptMode,
}

impl KernelSpec {
    /// The argv with `{connection_file}` substituted.
    pub fn resolved_argv(&self, connection_file: &Path) -> Vec<String> {
        let path = connection_file.to_string_lossy();
        self.argv
            .iter()
            .map(|arg| arg.replace("{connection_file}", &path))
            .collect()
    }

    /// Load a single `kernel.json` file, filling `name` from the argument.
    pub fn from_file(name: &str, path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut spec: KernelSpec = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        spec.name = name.to_string();
        Ok(spec)
    }
}

/// Named kernel specs available for launch.
#[derive(Debug, Default)]
pub struct KernelSpecRegistry {
    specs: HashMap<String, KernelSpec>,
}

impl KernelSpecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec under its name, replacing any previous entry.
    pub fn register(&mut self, spec: KernelSpec) {
        debug!(name = %spec.name, "registering kernel spec");
        self.specs.insert(spec.name.clone(), spec);
    }

    /// Look up a spec by name.
    pub fn find(&self, name: &str) -> Option<&KernelSpec> {
        self.specs.get(name)
    }

    /// Registered spec names, unordered.
    pub fn names(&self) -> Vec<&str> {
        self.specs.keys().map(|s| s.as_str()).collect()
    }

    /// Scan a kernelspec directory layout (`<dir>/<name>/kernel.json`),
    /// registering every valid spec found. Returns how many were loaded;
    /// unreadable entries are logged and skipped.
    pub fn load_dir(&mut self, dir: &Path) -> std::io::Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let spec_path = entry.path().join("kernel.json");
            if !spec_path.exists() {
                continue;
            }
            match KernelSpec::from_file(&name, &spec_path) {
                Ok(spec) => {
                    self.register(spec);
                    loaded += 1;
                }
                Err(e) => warn!(name = %name, error = %e, "skipping unreadable kernel spec"),
            }
        }
        Ok(loaded)
    }
}

// ============================================================================
// Tests
// ============================================================================
