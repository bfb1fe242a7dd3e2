//! Post-generation build steps: locate a `package.json`, install
//! dependencies, build, and pick the preview entry point.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use walkdir::WalkDir;

use super::command::{CommandOutcome, CommandRunner, CommandSpec};
use super::workspace::{GENERATION_DIR, is_skipped};
use crate::errors::{FactoryError, FactoryResult};

pub const MANIFEST_FILE: &str = "package.json";

/// Maximum characters of stdout/stderr surfaced per log line.
pub const COMMAND_OUTPUT_LIMIT: usize = 4000;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(900);

/// Checked in order, relative to the package root.
pub const PREVIEW_CANDIDATES: &[&str] = &[
    "dist/index.html",
    "build/index.html",
    "out/index.html",
    "index.html",
];

const INSTALL_LABEL: &str = "Running pnpm install";
const BUILD_LABEL: &str = "Running pnpm run build";

/// The directory holding the selected manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageRoot {
    pub dir: PathBuf,
    /// `/`-joined path from the generation root; `None` for the root itself.
    pub relative: Option<String>,
}

/// What the manifest says about building.
#[derive(Debug, Clone, PartialEq)]
enum BuildPlan {
    Build,
    Skip(&'static str),
}

/// Find the `package.json` to build from.
///
/// A manifest at the root wins outright. Otherwise the shallowest match is
/// chosen, ties broken by lexicographic path.
pub fn find_package_root(generation_root: &Path) -> Option<PackageRoot> {
    if generation_root.join(MANIFEST_FILE).is_file() {
        return Some(PackageRoot {
            dir: generation_root.to_path_buf(),
            relative: None,
        });
    }

    let mut candidates: Vec<(usize, String, PathBuf)> = WalkDir::new(generation_root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && is_skipped(&e.file_name().to_string_lossy())))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == MANIFEST_FILE)
        .filter_map(|e| {
            let dir = e.path().parent()?.to_path_buf();
            let rel = dir.strip_prefix(generation_root).ok()?;
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            Some((parts.len(), parts.join("/"), dir))
        })
        .collect();

    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    candidates
        .into_iter()
        .next()
        .map(|(_, relative, dir)| PackageRoot {
            dir,
            relative: Some(relative),
        })
}

/// Trim and cap command output for event payloads.
pub fn format_command_output(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= COMMAND_OUTPUT_LIMIT {
        return trimmed.to_string();
    }
    let mut truncated: String = trimmed.chars().take(COMMAND_OUTPUT_LIMIT).collect();
    truncated.push_str("\n[output truncated]");
    truncated
}

/// Any `scripts.build` entry triggers a build; its value is pnpm's concern.
fn build_plan(manifest: &serde_json::Value) -> BuildPlan {
    let has_build = manifest
        .get("scripts")
        .and_then(|s| s.as_object())
        .is_some_and(|scripts| scripts.contains_key("build"));
    if has_build {
        BuildPlan::Build
    } else {
        BuildPlan::Skip("package.json is missing a build script")
    }
}

/// Runs install and build against a generated workspace.
pub struct PostGenerationPipeline {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl PostGenerationPipeline {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build the workspace if it contains a manifest.
    ///
    /// Returns the preview path relative to `generation_root` when a build
    /// artifact was found. No manifest and no artifact are both `Ok(None)`.
    /// Every step reports progress through `log`.
    pub async fn run<L>(&self, generation_root: &Path, log: &mut L) -> FactoryResult<Option<String>>
    where
        L: FnMut(String) + Send,
    {
        let root = generation_root.to_path_buf();
        let package_root = tokio::task::spawn_blocking(move || find_package_root(&root))
            .await
            .context("Package root search panicked")?;
        let Some(package_root) = package_root else {
            log(format!(
                "No {} found under {}; skipping dependency installation.",
                MANIFEST_FILE,
                GENERATION_DIR
            ));
            return Ok(None);
        };

        if let Some(rel) = &package_root.relative {
            log(format!(
                "Detected package.json in subdirectory '{}'. Using it as working directory.",
                rel
            ));
        }

        let manifest_path = package_root.dir.join(MANIFEST_FILE);
        let raw = tokio::fs::read_to_string(&manifest_path).await?;
        let plan = match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(manifest) => build_plan(&manifest),
            Err(e) => {
                log(format!(
                    "Warning: unable to parse package.json ({}); proceeding with pnpm install only.",
                    e
                ));
                BuildPlan::Skip("package.json could not be parsed")
            }
        };

        self.run_step(INSTALL_LABEL, &["install"], &package_root.dir, log)
            .await?;

        match plan {
            BuildPlan::Build => {
                self.run_step(BUILD_LABEL, &["run", "build"], &package_root.dir, log)
                    .await?;
            }
            BuildPlan::Skip(reason) => {
                log(format!("Skipping pnpm run build because {}.", reason));
            }
        }

        for candidate in PREVIEW_CANDIDATES {
            let is_file = tokio::fs::metadata(package_root.dir.join(candidate))
                .await
                .is_ok_and(|m| m.is_file());
            if is_file {
                let preview = match &package_root.relative {
                    Some(rel) => format!("{}/{}", rel, candidate),
                    None => candidate.to_string(),
                };
                log(format!(
                    "Detected build artifact at {}; using as preview entry point.",
                    preview
                ));
                return Ok(Some(preview));
            }
        }
        Ok(None)
    }

    async fn run_step<L>(&self, label: &str, args: &[&str], cwd: &Path, log: &mut L) -> FactoryResult<()>
    where
        L: FnMut(String) + Send,
    {
        log(format!("{}...", label));
        let spec = CommandSpec::new("pnpm", args, cwd, self.timeout);
        tracing::info!(command = %spec.display(), cwd = %cwd.display(), "running build step");

        let output = match self.runner.run(&spec).await? {
            CommandOutcome::Exited(output) => output,
            CommandOutcome::TimedOut => {
                let seconds = self.timeout.as_secs();
                log(format!("{} timed out after {} seconds.", label, seconds));
                return Err(FactoryError::PipelineTimeout {
                    label: label.to_string(),
                    seconds,
                });
            }
        };

        let stdout = format_command_output(&output.stdout);
        if !stdout.is_empty() {
            log(format!("{} stdout:\n{}", label, stdout));
        }
        let stderr = format_command_output(&output.stderr);
        if !stderr.is_empty() {
            log(format!("{} stderr:\n{}", label, stderr));
        }

        if !output.success() {
            return Err(FactoryError::PipelineCommandFailed {
                label: label.to_string(),
                exit_code: output.exit_code,
            });
        }
        log(format!("{} completed successfully.", label));
        Ok(())
    }
}
