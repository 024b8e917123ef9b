use crate::casefs::is_single_component;
use crate::errors::{AppError, AppResult};
use crate::models::CaseType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    pub paths: PathSettings,
    pub layout: FolderLayout,
    pub templates: TemplateSettings,
    pub tools: BTreeMap<String, ToolConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PathSettings {
    pub cases_root: PathBuf,
    pub database: PathBuf,
    pub templates: PathBuf,
    pub logs: PathBuf,
    /// Scratch space where tools write before results are imported.
    pub staging: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FolderLayout {
    pub common: Vec<String>,
    pub by_case_type: BTreeMap<CaseType, Vec<String>>,
    pub nested: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TemplateSettings {
    /// Template file stem to case subfolder. Unmapped templates and an empty
    /// target land in the case root.
    pub targets: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ToolConfig {
    pub path: String,
    #[serde(default)]
    pub flag_args: Vec<String>,
    #[serde(default)]
    pub positional_args: Vec<String>,
    pub output_subfolder: String,
    #[serde(default)]
    pub output_extensions: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let mut tools = BTreeMap::new();
        tools.insert(
            "maigret".to_string(),
            ToolConfig {
                path: "maigret".to_string(),
                flag_args: vec!["--html".to_string(), "--folderoutput".to_string()],
                positional_args: vec!["username".to_string()],
                output_subfolder: "Social_Media".to_string(),
                output_extensions: vec!["html".to_string()],
            },
        );
        Self {
            paths: PathSettings::default(),
            layout: FolderLayout::default(),
            templates: TemplateSettings::default(),
            tools,
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        let base = default_base_dir();
        Self {
            cases_root: base.join("Cases"),
            database: base.join("casebook.db"),
            templates: PathBuf::from("templates"),
            logs: base.join("logs"),
            staging: std::env::temp_dir().join("casebook-staging"),
        }
    }
}

impl Default for FolderLayout {
    fn default() -> Self {
        let mut by_case_type = BTreeMap::new();
        by_case_type.insert(CaseType::Company, strings(&["Domains", "Executives", "Network"]));

        let mut nested = BTreeMap::new();
        nested.insert(
            "Social_Media".to_string(),
            strings(&[
                "Discord", "Facebook", "Instagram", "LinkedIn", "Reddit", "Signal", "Snapchat",
                "Telegram", "TikTok", "Twitter", "WhatsApp", "YouTube",
            ]),
        );

        Self {
            common: strings(&["Associates", "Audio", "Documents", "Other", "Social_Media"]),
            by_case_type,
            nested,
        }
    }
}

impl Default for TemplateSettings {
    fn default() -> Self {
        let mut targets = BTreeMap::new();
        targets.insert("Notes".to_string(), String::new());
        targets.insert("SOCMINT".to_string(), "Social_Media".to_string());
        targets.insert("Associates".to_string(), "Associates".to_string());
        Self { targets }
    }
}

impl Settings {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path).map_err(|error| {
            AppError::Config(format!("failed to read {}: {}", path.display(), error))
        })?;
        let settings: Settings = serde_yaml::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load_or_default(path: &Path) -> AppResult<Self> {
        if path.exists() {
            return Self::load(path);
        }
        tracing::info!(path = %path.display(), "no settings file found, using defaults");
        Ok(Self::default())
    }

    pub fn save(&self, path: &Path) -> AppResult<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_yaml::to_string(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn validate(&self) -> AppResult<()> {
        let required = [
            ("paths.cases_root", &self.paths.cases_root),
            ("paths.database", &self.paths.database),
            ("paths.staging", &self.paths.staging),
        ];
        for (key, value) in required {
            if value.as_os_str().is_empty() {
                return Err(AppError::Config(format!("{} must be set", key)));
            }
        }

        let folders = self
            .layout
            .common
            .iter()
            .chain(self.layout.by_case_type.values().flatten())
            .chain(self.layout.nested.keys())
            .chain(self.layout.nested.values().flatten());
        for folder in folders {
            if !is_single_component(folder) {
                return Err(AppError::Config(format!(
                    "folder name '{}' must be a single path component",
                    folder
                )));
            }
        }
        for target in self.templates.targets.values() {
            if !target.is_empty() && !is_single_component(target) {
                return Err(AppError::Config(format!(
                    "template target '{}' must be a single path component",
                    target
                )));
            }
        }

        for (name, tool) in &self.tools {
            if tool.path.trim().is_empty() {
                return Err(AppError::Config(format!("tools.{}.path must be set", name)));
            }
            if !is_single_component(&tool.output_subfolder) {
                return Err(AppError::Config(format!(
                    "tools.{}.output_subfolder must be a single path component",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn tool(&self, name: &str) -> Option<&ToolConfig> {
        let key = name.trim().to_ascii_lowercase();
        self.tools
            .iter()
            .find(|(candidate, _)| candidate.to_ascii_lowercase() == key)
            .map(|(_, tool)| tool)
    }

    /// Settings rooted under one directory, for tests and portable installs.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            paths: PathSettings {
                cases_root: base.join("Cases"),
                database: base.join("casebook.db"),
                templates: base.join("templates"),
                logs: base.join("logs"),
                staging: base.join("staging"),
            },
            ..Self::default()
        }
    }
}

fn default_base_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Casebook")
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}
