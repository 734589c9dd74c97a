//! Project file parser

use super::config::{CommandSpec, ProjectConfig};
use super::resolver::DependencyGraph;
use crate::error::{Result, WardenError};
use crate::storage::volume::validate_volume_name;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default project file names, in lookup order
pub const DEFAULT_PROJECT_FILES: &[&str] = &[
    "warden.yaml",
    "warden.yml",
    "compose.yaml",
    "compose.yml",
];

const INTERPOLATION_PATTERN: &str = r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}";

/// Project file parser
pub struct ProjectParser;

impl ProjectParser {
    /// Find a project file in directory
    pub fn find_project_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_PROJECT_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse project file from path
    pub fn parse_file(path: &Path) -> Result<ProjectConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            WardenError::ConfigParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str(&content)
    }

    /// Parse project file from string
    pub fn parse_str(content: &str) -> Result<ProjectConfig> {
        let mut config: ProjectConfig = serde_yaml::from_str(content)
            .map_err(|e| WardenError::ConfigParse(format!("Failed to parse YAML: {}", e)))?;
        config.assign_names();
        Ok(config)
    }

    /// Parse multiple project files; later files override earlier ones
    pub fn parse_files(paths: &[PathBuf]) -> Result<ProjectConfig> {
        let mut config = ProjectConfig::default();

        for path in paths {
            let file_config = Self::parse_file(path)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Merge two project configurations
    pub fn merge_configs(base: ProjectConfig, overlay: ProjectConfig) -> ProjectConfig {
        let mut result = base;

        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            match result.services.get_mut(&name) {
                Some(existing) => {
                    existing.start_command = service.start_command;
                    existing.depends_on.extend(service.depends_on);
                    if service.health_check.is_some() {
                        existing.health_check = service.health_check;
                    }
                    if service.restart_policy.is_some() {
                        existing.restart_policy = service.restart_policy;
                    }
                    if service.restart_backoff.is_some() {
                        existing.restart_backoff = service.restart_backoff;
                    }
                    for mount in service.volumes {
                        existing.volumes.retain(|m| m.mount_path != mount.mount_path);
                        existing.volumes.push(mount);
                    }
                    existing.environment.extend(service.environment);
                    if service.working_dir.is_some() {
                        existing.working_dir = service.working_dir;
                    }
                    if service.stop_grace_period.is_some() {
                        existing.stop_grace_period = service.stop_grace_period;
                    }
                }
                None => {
                    result.services.insert(name, service);
                }
            }
        }

        result
    }

    /// Validate a project configuration, including its dependency graph
    pub fn validate(config: &ProjectConfig) -> Result<Vec<String>> {
        let warnings = Self::validate_services(config)?;
        DependencyGraph::new(config.services.values())?;
        Ok(warnings)
    }

    /// Validate each service on its own, returning warnings
    pub fn validate_services(config: &ProjectConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if config.services.is_empty() {
            return Err(WardenError::Config("project defines no services".to_string()));
        }

        for (name, service) in &config.services {
            if service.start_command.is_empty() {
                return Err(WardenError::Config(format!(
                    "Service '{}' has an empty startCommand",
                    name
                )));
            }

            if let Some(check) = &service.health_check {
                if check.command.is_empty() && !check.disable {
                    return Err(WardenError::Config(format!(
                        "Service '{}' has an empty healthCheck.command",
                        name
                    )));
                }
                if check.interval == Some(std::time::Duration::ZERO) {
                    return Err(WardenError::Config(format!(
                        "Service '{}' has a zero healthCheck.interval",
                        name
                    )));
                }
                if check.retries == Some(0) {
                    warnings.push(format!(
                        "Service '{}' sets healthCheck.retries to 0, using 1",
                        name
                    ));
                }
            }

            if let Some(backoff) = &service.restart_backoff {
                if let Some(jitter) = backoff.jitter {
                    if !(0.0..=1.0).contains(&jitter) {
                        return Err(WardenError::Config(format!(
                            "Service '{}' has restartBackoff.jitter {} outside [0, 1]",
                            name, jitter
                        )));
                    }
                }
                if backoff.max_attempts == Some(0) {
                    return Err(WardenError::Config(format!(
                        "Service '{}' has restartBackoff.maxAttempts 0",
                        name
                    )));
                }
            }

            let mut mount_paths = std::collections::HashSet::new();
            for mount in &service.volumes {
                validate_volume_name(&mount.name)?;
                if !mount_paths.insert(&mount.mount_path) {
                    return Err(WardenError::Config(format!(
                        "Service '{}' mounts two volumes at {}",
                        name,
                        mount.mount_path.display()
                    )));
                }
            }
        }

        Ok(warnings)
    }

    /// Interpolate `${VAR}` and `${VAR:-default}` in commands and environment
    pub fn interpolate(config: &mut ProjectConfig, env: &HashMap<String, String>) -> Result<()> {
        let re = Regex::new(INTERPOLATION_PATTERN)
            .map_err(|e| WardenError::Internal(format!("invalid interpolation pattern: {}", e)))?;

        for service in config.services.values_mut() {
            interpolate_command(&mut service.start_command, &re, env);

            if let Some(check) = service.health_check.as_mut() {
                interpolate_command(&mut check.command, &re, env);
            }

            for value in service.environment.values_mut() {
                *value = interpolate_string(value, &re, env);
            }
        }

        Ok(())
    }
}

fn interpolate_command(cmd: &mut CommandSpec, re: &Regex, env: &HashMap<String, String>) {
    match cmd {
        CommandSpec::Shell(s) => *s = interpolate_string(s, re, env),
        CommandSpec::Exec(args) => {
            for arg in args.iter_mut() {
                *arg = interpolate_string(arg, re, env);
            }
        }
    }
}

/// Interpolate environment variables in a string
fn interpolate_string(s: &str, re: &Regex, env: &HashMap<String, String>) -> String {
    re.replace_all(s, |caps: &Captures| {
        let Some(var) = caps.get(1) else {
            return "$".to_string();
        };
        match (env.get(var.as_str()), caps.get(2)) {
            (Some(value), _) => value.clone(),
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                tracing::warn!("Variable {} is not set, substituting an empty string", var.as_str());
                String::new()
            }
        }
    })
    .into_owned()
}
