pub mod casefs;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod numbering;
pub mod registry;
pub mod store;
pub mod tools;

pub use crate::casefs::CaseDirectories;
pub use crate::config::{Settings, ToolConfig};
pub use crate::db::SqliteStore;
pub use crate::errors::{AppError, AppResult};
pub use crate::models::{
    Case, CaseSortKey, CaseType, Client, ClientPatch, NewClient, ToolParameters, ToolRunReport,
    ToolRunSnapshot, ToolRunStatus,
};
pub use crate::numbering::{CaseId, Period};
pub use crate::registry::CaseRegistry;
pub use crate::store::MetadataStore;
pub use crate::tools::{ToolRunHandle, ToolRunner};

use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Everything a front end needs: the case registry and the tool runner,
/// wired to one SQLite store and one cases root.
#[derive(Clone)]
pub struct CaseDesk {
    pub registry: Arc<CaseRegistry>,
    pub tools: ToolRunner,
    pub settings: Arc<Settings>,
}

impl CaseDesk {
    pub fn open(settings: Settings) -> AppResult<Self> {
        settings.validate()?;
        std::fs::create_dir_all(&settings.paths.cases_root)?;
        std::fs::create_dir_all(&settings.paths.staging)?;

        let store: Arc<dyn MetadataStore> = Arc::new(SqliteStore::new(&settings.paths.database)?);
        let registry = Arc::new(CaseRegistry::new(store, CaseDirectories::new(&settings)));
        let settings = Arc::new(settings);
        let tools = ToolRunner::new(registry.clone(), settings.clone());

        tracing::info!(
            cases_root = %settings.paths.cases_root.display(),
            database = %settings.paths.database.display(),
            "casebook opened"
        );
        Ok(Self {
            registry,
            tools,
            settings,
        })
    }
}

/// Installs the global JSON subscriber writing to `<log_dir>/casebook.log.<date>`.
/// Calling it again after a subscriber is installed is a no-op.
pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "casebook.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init();

    match installed {
        Ok(()) => {
            let _ = LOG_GUARD.set(guard);
            Ok(())
        }
        Err(error) => {
            tracing::debug!(error = %error, "tracing subscriber already installed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_roots_and_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::rooted_at(dir.path());
        let desk = CaseDesk::open(settings).expect("open");

        assert!(dir.path().join("Cases").is_dir());
        assert!(dir.path().join("staging").is_dir());
        assert!(dir.path().join("casebook.db").is_file());
        assert!(desk.registry.list_cases(None, false).expect("list").is_empty());
    }

    #[test]
    fn open_rejects_invalid_settings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = Settings::rooted_at(dir.path());
        settings.paths.database = std::path::PathBuf::new();
        let error = CaseDesk::open(settings).err().expect("invalid settings");
        assert_eq!(error.kind(), "CONFIG_INVALID");
    }

    #[test]
    fn init_tracing_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        init_tracing(dir.path()).expect("first init");
        init_tracing(dir.path()).expect("second init");
        assert!(dir.path().is_dir());
    }
}
