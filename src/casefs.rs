//! On-disk folder tree for each case.
//!
//! Every operation is confined to `<cases_root>/<case_id>`. Creation is
//! all-or-nothing: a tree that fails halfway is removed before the error is
//! returned.

use crate::config::{FolderLayout, Settings};
use crate::errors::{AppError, AppResult};
use crate::models::CaseType;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

const CASE_NUMBER_PLACEHOLDER: &str = "**Case Number:**";
const CASE_TYPE_PLACEHOLDER: &str = "**Case Type:**";
const DATE_PLACEHOLDER: &str = "**Date:**";

#[derive(Debug, Clone)]
pub struct CaseDirectories {
    cases_root: PathBuf,
    layout: FolderLayout,
    templates_dir: PathBuf,
    template_targets: BTreeMap<String, String>,
}

impl CaseDirectories {
    pub fn new(settings: &Settings) -> Self {
        Self {
            cases_root: settings.paths.cases_root.clone(),
            layout: settings.layout.clone(),
            templates_dir: settings.paths.templates.clone(),
            template_targets: settings.templates.targets.clone(),
        }
    }

    pub fn folder(&self, case_id: &str) -> AppResult<PathBuf> {
        ensure_component(case_id)?;
        Ok(self.cases_root.join(case_id))
    }

    pub fn exists(&self, case_id: &str) -> bool {
        self.folder(case_id).map(|path| path.is_dir()).unwrap_or(false)
    }

    /// Category folders for a case type: common plus type-specific, sorted.
    pub fn categories_for(&self, case_type: CaseType) -> Vec<String> {
        let mut folders: BTreeSet<String> = self.layout.common.iter().cloned().collect();
        if let Some(extra) = self.layout.by_case_type.get(&case_type) {
            folders.extend(extra.iter().cloned());
        }
        folders.into_iter().collect()
    }

    pub fn create(
        &self,
        case_id: &str,
        case_type: CaseType,
        created_at: DateTime<Utc>,
    ) -> AppResult<PathBuf> {
        let root = self.folder(case_id)?;
        fs::create_dir_all(&self.cases_root).map_err(|error| {
            AppError::Filesystem(format!("failed to create cases root: {}", error))
        })?;

        match fs::create_dir(&root) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                return Err(AppError::Conflict(format!(
                    "folder for case {} already exists at {}",
                    case_id,
                    root.display()
                )));
            }
            Err(error) => {
                return Err(AppError::Filesystem(format!(
                    "failed to create {}: {}",
                    root.display(),
                    error
                )));
            }
        }

        if let Err(error) = self.populate(&root, case_id, case_type, created_at) {
            if let Err(cleanup) = fs::remove_dir_all(&root) {
                tracing::error!(
                    case_id = %case_id,
                    error = %cleanup,
                    "failed to remove partially built case folder"
                );
                return Err(AppError::PartialFailure(format!(
                    "case folder {} is half built ({}) and could not be removed: {}",
                    root.display(),
                    error,
                    cleanup
                )));
            }
            tracing::warn!(case_id = %case_id, error = %error, "case folder creation rolled back");
            return Err(error);
        }

        tracing::debug!(case_id = %case_id, path = %root.display(), "case folder created");
        Ok(root)
    }

    pub fn rename(&self, old_case_id: &str, new_case_id: &str) -> AppResult<PathBuf> {
        let old_path = self.folder(old_case_id)?;
        let new_path = self.folder(new_case_id)?;
        if new_path.exists() {
            return Err(AppError::Conflict(format!(
                "folder for case {} already exists",
                new_case_id
            )));
        }
        if !old_path.is_dir() {
            return Err(AppError::NotFound(format!("folder for case {}", old_case_id)));
        }
        fs::rename(&old_path, &new_path).map_err(|error| {
            AppError::Filesystem(format!(
                "failed to rename {} to {}: {}",
                old_path.display(),
                new_path.display(),
                error
            ))
        })?;
        Ok(new_path)
    }

    /// Removes the case tree. Returns false if it was already gone.
    pub fn delete(&self, case_id: &str) -> AppResult<bool> {
        let root = self.folder(case_id)?;
        match fs::remove_dir_all(&root) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(AppError::Filesystem(format!(
                "failed to remove {}: {}",
                root.display(),
                error
            ))),
        }
    }

    fn populate(
        &self,
        root: &Path,
        case_id: &str,
        case_type: CaseType,
        created_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let categories = self.categories_for(case_type);
        for folder in &categories {
            fs::create_dir(root.join(folder))?;
        }
        for (parent, children) in &self.layout.nested {
            if !categories.contains(parent) {
                continue;
            }
            for child in children {
                fs::create_dir_all(root.join(parent).join(child))?;
            }
        }
        self.copy_templates(root, case_id, case_type, created_at)
    }

    fn copy_templates(
        &self,
        root: &Path,
        case_id: &str,
        case_type: CaseType,
        created_at: DateTime<Utc>,
    ) -> AppResult<()> {
        if !self.templates_dir.is_dir() {
            tracing::warn!(
                path = %self.templates_dir.display(),
                "templates directory missing, skipping note templates"
            );
            return Ok(());
        }

        let mut templates = Vec::new();
        for entry in fs::read_dir(&self.templates_dir)? {
            let path = entry?.path();
            let is_markdown = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("md"))
                .unwrap_or(false);
            if path.is_file() && is_markdown {
                templates.push(path);
            }
        }
        templates.sort();

        for template in templates {
            let (Some(stem), Some(file_name)) = (
                template.file_stem().and_then(|value| value.to_str()),
                template.file_name(),
            ) else {
                continue;
            };
            let target_dir = match self.template_targets.get(stem).map(String::as_str) {
                Some(target) if !target.is_empty() => root.join(target),
                _ => root.to_path_buf(),
            };
            fs::create_dir_all(&target_dir)?;

            let content = fs::read_to_string(&template).map_err(|error| {
                AppError::Filesystem(format!(
                    "failed to read template {}: {}",
                    template.display(),
                    error
                ))
            })?;
            let rendered = render_template(&content, case_id, case_type, created_at);
            fs::write(target_dir.join(file_name), rendered)?;
        }
        Ok(())
    }
}

pub fn render_template(
    content: &str,
    case_id: &str,
    case_type: CaseType,
    created_at: DateTime<Utc>,
) -> String {
    content
        .replace(CASE_NUMBER_PLACEHOLDER, &format!("{} {}", CASE_NUMBER_PLACEHOLDER, case_id))
        .replace(CASE_TYPE_PLACEHOLDER, &format!("{} {}", CASE_TYPE_PLACEHOLDER, case_type))
        .replace(
            DATE_PLACEHOLDER,
            &format!("{} {}", DATE_PLACEHOLDER, created_at.format("%Y-%m-%d")),
        )
}

/// True for a plain, non-hidden file or folder name with no separators.
pub fn is_single_component(value: &str) -> bool {
    if value.is_empty() || value.trim() != value || value.starts_with('.') {
        return false;
    }
    if value.contains(['/', '\\', ':', '\0']) {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn ensure_component(case_id: &str) -> AppResult<()> {
    if is_single_component(case_id) {
        Ok(())
    } else {
        Err(AppError::Invalid(format!(
            "case id '{}' cannot be used as a folder name",
            case_id
        )))
    }
}
