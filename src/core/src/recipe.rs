//! Build recipe: the declarative YAML description of one image build.
//!
//! The recipe names the image, its parent, the repositories and packages
//! that populate the rootfs, post-install commands, files to copy in, and
//! where to publish the result. A copy of the recipe is embedded into every
//! built image as the configuration layer, so the model both deserializes
//! the user's file and serializes itself back out.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, Result};

/// Literal parent value meaning "no parent image".
pub const SCRATCH: &str = "scratch";

/// A package repository to configure inside the rootfs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub gpg: String,
    #[serde(default)]
    pub proxy: String,
    #[serde(default)]
    pub priority: i64,
}

/// A file to copy from the host into the rootfs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyFile {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub opts: Vec<String>,
    #[serde(default)]
    pub mode: u32,
}

/// A post-install command to run inside the working container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandStep {
    #[serde(rename = "cmd", default)]
    pub command: String,
    #[serde(rename = "loglevel", default)]
    pub log_level: String,
}

impl CommandStep {
    /// The tracing level this command's announcement should be logged at.
    pub fn announce_level(&self) -> tracing::Level {
        match self.log_level.to_uppercase().as_str() {
            "DEBUG" => tracing::Level::DEBUG,
            "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// The `options` block of a recipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub layer_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pkg_manager: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub publish_tags: String,
    #[serde(default)]
    pub publish_registry: String,
    #[serde(default)]
    pub publish_local: bool,
    #[serde(default)]
    pub publish_s3: String,
    #[serde(default)]
    pub s3_prefix: String,
    #[serde(default)]
    pub s3_bucket: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub playbooks: Vec<String>,
    #[serde(default)]
    pub inventory: Vec<String>,
    #[serde(default)]
    pub vars: HashMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub ansible_verbosity: i64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub registry_opts_push: Vec<String>,
    #[serde(default)]
    pub registry_opts_pull: Vec<String>,
}

/// One image build, as described by the user's YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRecipe {
    #[serde(default)]
    pub options: Options,
    #[serde(rename = "repos", default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub package_groups: Vec<String>,
    #[serde(default)]
    pub remove_packages: Vec<String>,
    #[serde(default)]
    pub modules: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub cmds: Vec<CommandStep>,
    #[serde(rename = "copyfiles", default)]
    pub copy_files: Vec<CopyFile>,
}

const LOG_LEVELS: [&str; 4] = ["INFO", "DEBUG", "WARNING", "ERROR"];

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ForgeError {
    ForgeError::InvalidRecipe {
        field: field.into(),
        message: message.into(),
    }
}

impl BuildRecipe {
    /// Validate the recipe, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.options.layer_type.is_empty() {
            return Err(invalid("options.layer_type", "is required"));
        }
        if self.options.layer_type != "base" && self.options.layer_type != "ansible" {
            return Err(invalid("options.layer_type", "must be 'base' or 'ansible'"));
        }

        if self.options.name.is_empty() {
            return Err(invalid("options.name", "is required"));
        }

        if self.options.layer_type == "base" && self.options.pkg_manager.is_empty() {
            return Err(invalid("options.pkg_manager", "is required for base layer"));
        }

        for (i, repo) in self.repositories.iter().enumerate() {
            if repo.alias.is_empty() {
                return Err(invalid(format!("repositories[{i}].alias"), "is required"));
            }
            if repo.url.is_empty() {
                return Err(invalid(format!("repositories[{i}].url"), "is required"));
            }
        }

        for (i, cmd) in self.cmds.iter().enumerate() {
            if cmd.command.is_empty() {
                return Err(invalid(format!("cmds[{i}].cmd"), "is required"));
            }
            if !cmd.log_level.is_empty()
                && !LOG_LEVELS.contains(&cmd.log_level.to_uppercase().as_str())
            {
                return Err(invalid(
                    format!("cmds[{i}].loglevel"),
                    "must be one of: INFO, DEBUG, WARNING, ERROR",
                ));
            }
        }

        for (i, cf) in self.copy_files.iter().enumerate() {
            if cf.src.is_empty() {
                return Err(invalid(format!("copyfiles[{i}].src"), "is required"));
            }
            if cf.dest.is_empty() {
                return Err(invalid(format!("copyfiles[{i}].dest"), "is required"));
            }
        }

        Ok(())
    }

    /// Whether the recipe builds on a parent image rather than scratch.
    pub fn has_parent(&self) -> bool {
        !self.options.parent.is_empty() && self.options.parent != SCRATCH
    }
}

/// Load and validate a recipe file.
pub fn load_recipe(path: impl AsRef<Path>) -> Result<BuildRecipe> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|e| {
        ForgeError::Other(format!("failed to read recipe file {}: {}", path.display(), e))
    })?;
    let recipe: BuildRecipe = serde_yaml::from_str(&data)?;
    recipe.validate()?;
    Ok(recipe)
}

/// Serialize a recipe to a YAML file.
pub fn write_recipe(recipe: &BuildRecipe, path: impl AsRef<Path>) -> Result<()> {
    let data = serde_yaml::to_string(recipe)?;
    std::fs::write(path.as_ref(), data).map_err(ForgeError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_recipe() -> BuildRecipe {
        let mut recipe = BuildRecipe::default();
        recipe.options.layer_type = "base".to_string();
        recipe.options.name = "rocky".to_string();
        recipe.options.pkg_manager = "dnf".to_string();
        recipe
    }

    #[test]
    fn test_validate_minimal() {
        assert!(minimal_recipe().validate().is_ok());
    }

    #[test]
    fn test_validate_missing_layer_type() {
        let mut recipe = minimal_recipe();
        recipe.options.layer_type = String::new();
        let err = recipe.validate().unwrap_err();
        assert_eq!(err.to_string(), "options.layer_type: is required");
    }

    #[test]
    fn test_validate_bad_layer_type() {
        let mut recipe = minimal_recipe();
        recipe.options.layer_type = "golden".to_string();
        let err = recipe.validate().unwrap_err();
        assert_eq!(err.to_string(), "options.layer_type: must be 'base' or 'ansible'");
    }

    #[test]
    fn test_validate_base_requires_pkg_manager() {
        let mut recipe = minimal_recipe();
        recipe.options.pkg_manager = String::new();
        let err = recipe.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "options.pkg_manager: is required for base layer"
        );
    }

    #[test]
    fn test_validate_ansible_without_pkg_manager() {
        let mut recipe = minimal_recipe();
        recipe.options.layer_type = "ansible".to_string();
        recipe.options.pkg_manager = String::new();
        assert!(recipe.validate().is_ok());
    }

    #[test]
    fn test_validate_repo_fields() {
        let mut recipe = minimal_recipe();
        recipe.repositories.push(Repository {
            url: "https://mirror.example/BaseOS".to_string(),
            ..Default::default()
        });
        let err = recipe.validate().unwrap_err();
        assert_eq!(err.to_string(), "repositories[0].alias: is required");
    }

    #[test]
    fn test_validate_command_log_level() {
        let mut recipe = minimal_recipe();
        recipe.cmds.push(CommandStep {
            command: "dracut -f".to_string(),
            log_level: "chatty".to_string(),
        });
        let err = recipe.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "cmds[0].loglevel: must be one of: INFO, DEBUG, WARNING, ERROR"
        );
    }

    #[test]
    fn test_validate_command_log_level_case_insensitive() {
        let mut recipe = minimal_recipe();
        recipe.cmds.push(CommandStep {
            command: "echo done".to_string(),
            log_level: "debug".to_string(),
        });
        assert!(recipe.validate().is_ok());
    }

    #[test]
    fn test_validate_copyfile_fields() {
        let mut recipe = minimal_recipe();
        recipe.copy_files.push(CopyFile {
            src: "/etc/motd".to_string(),
            ..Default::default()
        });
        let err = recipe.validate().unwrap_err();
        assert_eq!(err.to_string(), "copyfiles[0].dest: is required");
    }

    #[test]
    fn test_has_parent() {
        let mut recipe = minimal_recipe();
        assert!(!recipe.has_parent());
        recipe.options.parent = SCRATCH.to_string();
        assert!(!recipe.has_parent());
        recipe.options.parent = "reg:5000/base/rocky:9".to_string();
        assert!(recipe.has_parent());
    }

    #[test]
    fn test_announce_level_mapping() {
        let step = |level: &str| CommandStep {
            command: "true".to_string(),
            log_level: level.to_string(),
        };
        assert_eq!(step("").announce_level(), tracing::Level::INFO);
        assert_eq!(step("DEBUG").announce_level(), tracing::Level::DEBUG);
        assert_eq!(step("warning").announce_level(), tracing::Level::WARN);
        assert_eq!(step("ERROR").announce_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_parse_recipe_yaml() {
        let yaml = r#"
options:
  layer_type: base
  name: rocky
  pkg_manager: dnf
  parent: scratch
  publish_tags: "9,latest"
  publish_registry: "reg:5000/base"
  registry_opts_push: ["--tls-verify=false"]
repos:
  - alias: Rocky_9_BaseOS
    url: https://mirror.example/rocky/9/BaseOS/x86_64/os/
    priority: 1
packages:
  - kernel
  - wget
  - dracut-live
package_groups:
  - "Minimal Install"
cmds:
  - cmd: "echo DRACUT LOG:; cat /tmp/dracut.log"
    loglevel: DEBUG
copyfiles:
  - src: /srv/overlay/sshd_config
    dest: /etc/ssh/sshd_config
    mode: 0o600
"#;
        let recipe: BuildRecipe = serde_yaml::from_str(yaml).unwrap();
        recipe.validate().unwrap();
        assert_eq!(recipe.options.name, "rocky");
        assert_eq!(recipe.options.publish_tags, "9,latest");
        assert_eq!(recipe.repositories.len(), 1);
        assert_eq!(recipe.repositories[0].priority, 1);
        assert_eq!(recipe.packages, vec!["kernel", "wget", "dracut-live"]);
        assert_eq!(recipe.package_groups, vec!["Minimal Install"]);
        assert_eq!(recipe.cmds[0].log_level, "DEBUG");
        assert_eq!(recipe.copy_files[0].dest, "/etc/ssh/sshd_config");
        assert!(!recipe.has_parent());
    }

    #[test]
    fn test_load_recipe_validates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("recipe.yaml");
        std::fs::write(&path, "options:\n  layer_type: base\n  name: rocky\n").unwrap();
        let err = load_recipe(&path).unwrap_err();
        assert_eq!(
            err.to_string(),
            "options.pkg_manager: is required for base layer"
        );
    }

    #[test]
    fn test_write_and_reload_recipe() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("image-config.yaml");
        let mut recipe = minimal_recipe();
        recipe.options.labels.insert(
            "com.example.cluster".to_string(),
            "alpha".to_string(),
        );
        write_recipe(&recipe, &path).unwrap();
        let reloaded = load_recipe(&path).unwrap();
        assert_eq!(reloaded.options.name, "rocky");
        assert_eq!(
            reloaded.options.labels.get("com.example.cluster"),
            Some(&"alpha".to_string())
        );
    }
}
