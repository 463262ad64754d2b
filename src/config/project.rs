use std::path::{Path, PathBuf};

use crate::api::CompileOptions;
use crate::diagnostic::Diagnostic;
use crate::graph::StencilStrategy;

/// File name searched for by [`ProjectConfig::find`].
pub const CONFIG_FILE: &str = "ikra.toml";

/// Compiler settings from an ikra.toml.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectConfig {
    pub root_dir: PathBuf,
    pub block_size: Option<usize>,
    pub stencil_strategy: Option<StencilStrategy>,
    pub debug_comments: Option<bool>,
    /// Profile name (e.g. "debug"). Selects the defaults the other keys
    /// override.
    pub profile: Option<String>,
}

fn config_error(path: &Path, message: String) -> Diagnostic {
    Diagnostic::error(message, None).with_note(format!("in '{}'", path.display()))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

impl ProjectConfig {
    /// Load the `[compiler]` section of an ikra.toml file.
    pub fn load(toml_path: &Path) -> Result<ProjectConfig, Diagnostic> {
        let content = std::fs::read_to_string(toml_path).map_err(|e| {
            Diagnostic::error(format!("cannot read '{}': {}", toml_path.display(), e), None)
        })?;
        let root_dir = toml_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        Self::parse(&content, root_dir).map_err(|msg| config_error(toml_path, msg))
    }

    /// Section-aware minimal TOML reading; unknown sections are ignored.
    fn parse(content: &str, root_dir: PathBuf) -> Result<ProjectConfig, String> {
        let mut config = ProjectConfig {
            root_dir,
            block_size: None,
            stencil_strategy: None,
            debug_comments: None,
            profile: None,
        };
        let mut current_section = String::new();

        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                current_section = trimmed[1..trimmed.len() - 1].trim().to_string();
                continue;
            }
            if current_section != "compiler" {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(format!("line {}: expected 'key = value'", lineno + 1));
            };
            let key = key.trim().trim_matches('"');
            let value = value.trim();
            match key {
                "block_size" => {
                    let size = value
                        .parse::<usize>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| {
                            format!("block_size must be a positive integer, got {}", value)
                        })?;
                    config.block_size = Some(size);
                }
                "stencil_strategy" => {
                    let name = value.trim_matches('"');
                    let strategy = StencilStrategy::from_name(name)
                        .ok_or_else(|| format!("unknown stencil strategy '{}'", name))?;
                    config.stencil_strategy = Some(strategy);
                }
                "debug_comments" => {
                    let flag = parse_bool(value).ok_or_else(|| {
                        format!("debug_comments must be true or false, got {}", value)
                    })?;
                    config.debug_comments = Some(flag);
                }
                "profile" => config.profile = Some(value.trim_matches('"').to_string()),
                _ => return Err(format!("unknown key '{}' in [compiler]", key)),
            }
        }
        Ok(config)
    }

    /// Try to find an ikra.toml in the given directory or its ancestors.
    pub fn find(start_dir: &Path) -> Option<PathBuf> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.exists() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Profile defaults with every key this file sets applied on top.
    pub fn to_options(&self) -> CompileOptions {
        let mut options = match &self.profile {
            Some(profile) => CompileOptions::for_profile(profile),
            None => CompileOptions::default(),
        };
        if let Some(size) = self.block_size {
            options.block_size = size;
        }
        if let Some(strategy) = self.stencil_strategy {
            options.stencil_strategy = strategy;
        }
        if let Some(flag) = self.debug_comments {
            options.debug_comments = flag;
        }
        options
    }
}
