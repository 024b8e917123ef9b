use crate::casefs::CaseDirectories;
use crate::errors::{AppError, AppResult};
use crate::models::{Case, CaseSortKey, CaseType, CaseUpdate, Client, ClientPatch, NewClient};
use crate::numbering::{next_case_id, Period};
use crate::store::MetadataStore;
use chrono::Utc;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Case and client operations over the store and the case folders.
///
/// Every write runs under one mutex so numbering, folder creation and the
/// store commit cannot interleave between callers. Reads skip the mutex and
/// see the last completed write.
pub struct CaseRegistry {
    store: Arc<dyn MetadataStore>,
    dirs: CaseDirectories,
    write_lock: Mutex<()>,
}

impl CaseRegistry {
    pub fn new(store: Arc<dyn MetadataStore>, dirs: CaseDirectories) -> Self {
        Self {
            store,
            dirs,
            write_lock: Mutex::new(()),
        }
    }

    pub fn create_case(
        &self,
        case_type: CaseType,
        client_ref: Option<i64>,
        period: Option<Period>,
    ) -> AppResult<Case> {
        let _guard = self.lock()?;

        let client_name = match client_ref {
            Some(client_id) => Some(
                self.store
                    .get_client(client_id)?
                    .ok_or_else(|| AppError::NotFound(format!("client {}", client_id)))?
                    .name,
            ),
            None => None,
        };

        let period = period.unwrap_or_else(Period::current);
        let case_id = next_case_id(period, self.store.as_ref())?.to_string();
        let created_at = Utc::now();

        let folder = self.dirs.create(&case_id, case_type, created_at)?;

        let case = Case {
            case_id: case_id.clone(),
            case_type,
            client_ref,
            client_name,
            created_at,
        };
        if let Err(error) = self.store.insert_case(&case) {
            return Err(match self.dirs.delete(&case_id) {
                Ok(_) => {
                    tracing::warn!(
                        case_id = %case_id,
                        error = %error,
                        "store commit failed, case folder rolled back"
                    );
                    error
                }
                Err(cleanup) => {
                    tracing::error!(
                        case_id = %case_id,
                        error = %error,
                        cleanup_error = %cleanup,
                        "case folder left behind after failed commit"
                    );
                    AppError::PartialFailure(format!(
                        "case {} was not recorded ({}) and its folder {} could not be removed: {}",
                        case_id,
                        error,
                        folder.display(),
                        cleanup
                    ))
                }
            });
        }

        tracing::info!(case_id = %case_id, case_type = %case_type, "case created");
        Ok(case)
    }

    pub fn rename_case(&self, case_id: &str, new_case_id: &str) -> AppResult<Case> {
        let _guard = self.lock()?;
        self.dirs.folder(new_case_id)?;

        let existing = self
            .store
            .get_case(case_id)?
            .ok_or_else(|| AppError::NotFound(format!("case {}", case_id)))?;
        if case_id == new_case_id {
            return Ok(existing);
        }
        if self.store.get_case(new_case_id)?.is_some() {
            return Err(AppError::Conflict(format!("case {} already exists", new_case_id)));
        }
        if self.store.is_retired(new_case_id)? {
            return Err(AppError::Conflict(format!(
                "case id {} belonged to a deleted case",
                new_case_id
            )));
        }

        self.dirs.rename(case_id, new_case_id)?;

        let update = CaseUpdate {
            case_id: Some(new_case_id.to_string()),
            client_ref: None,
        };
        if let Err(error) = self.store.update_case(case_id, &update) {
            return Err(match self.dirs.rename(new_case_id, case_id) {
                Ok(_) => {
                    tracing::warn!(
                        case_id = %case_id,
                        error = %error,
                        "store rename failed, folder rename reverted"
                    );
                    error
                }
                Err(revert) => {
                    tracing::error!(
                        case_id = %case_id,
                        new_case_id = %new_case_id,
                        error = %error,
                        revert_error = %revert,
                        "case folder and record disagree after rename"
                    );
                    AppError::PartialFailure(format!(
                        "folder renamed to {} but record still says {} ({}); revert failed: {}",
                        new_case_id, case_id, error, revert
                    ))
                }
            });
        }

        tracing::info!(case_id = %case_id, new_case_id = %new_case_id, "case renamed");
        self.store
            .get_case(new_case_id)?
            .ok_or_else(|| {
                AppError::Internal(format!("case {} vanished after rename", new_case_id))
            })
    }

    /// Removes the folder first so an interruption leaves a record that still
    /// points at the case rather than an unreferenced folder.
    pub fn delete_case(&self, case_id: &str) -> AppResult<()> {
        let _guard = self.lock()?;
        if self.store.get_case(case_id)?.is_none() {
            return Err(AppError::NotFound(format!("case {}", case_id)));
        }

        let removed_folder = self.dirs.delete(case_id)?;
        if !removed_folder {
            tracing::warn!(case_id = %case_id, "case folder was already missing");
        }

        match self.store.delete_case(case_id) {
            Ok(_) => {
                tracing::info!(case_id = %case_id, "case deleted");
                Ok(())
            }
            Err(error) => {
                tracing::error!(
                    case_id = %case_id,
                    error = %error,
                    "case folder removed but record remains"
                );
                Err(AppError::PartialFailure(format!(
                    "folder of case {} was removed but its record could not be deleted: {}",
                    case_id, error
                )))
            }
        }
    }

    pub fn set_case_client(&self, case_id: &str, client_ref: Option<i64>) -> AppResult<Case> {
        let _guard = self.lock()?;
        let update = CaseUpdate {
            case_id: None,
            client_ref: Some(client_ref),
        };
        self.store.update_case(case_id, &update)?;
        self.store
            .get_case(case_id)?
            .ok_or_else(|| AppError::NotFound(format!("case {}", case_id)))
    }

    pub fn get_case(&self, case_id: &str) -> AppResult<Option<Case>> {
        self.store.get_case(case_id)
    }

    pub fn list_cases(
        &self,
        sort_key: Option<CaseSortKey>,
        sort_desc: bool,
    ) -> AppResult<Vec<Case>> {
        let mut cases = self.store.list_cases()?;
        let key = sort_key.unwrap_or_default();
        cases.sort_by(|a, b| {
            let ordering = compare_cases(a, b, key);
            if sort_desc {
                ordering.reverse()
            } else {
                ordering
            }
        });
        Ok(cases)
    }

    /// First case, in default listing order, whose id or client name contains
    /// the keyword (case-insensitive).
    pub fn search(&self, keyword: &str) -> AppResult<Option<Case>> {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(None);
        }
        let cases = self.list_cases(None, false)?;
        Ok(cases.into_iter().find(|case| {
            case.case_id.to_lowercase().contains(&needle)
                || case
                    .client_name
                    .as_deref()
                    .map(|name| name.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        }))
    }

    pub fn case_folder(&self, case_id: &str) -> AppResult<PathBuf> {
        self.dirs.folder(case_id)
    }

    /// Runs `f` against the folder of a case while holding the write lock,
    /// after checking the case is still recorded and its folder still exists.
    /// Nothing here recreates a deleted case.
    pub fn with_existing_case<T>(
        &self,
        case_id: &str,
        f: impl FnOnce(&Path) -> AppResult<T>,
    ) -> AppResult<T> {
        let _guard = self.lock()?;
        if self.store.get_case(case_id)?.is_none() {
            return Err(AppError::NotFound(format!("case {}", case_id)));
        }
        let folder = self.dirs.folder(case_id)?;
        if !folder.is_dir() {
            return Err(AppError::NotFound(format!("folder for case {}", case_id)));
        }
        f(&folder)
    }

    pub fn add_client(&self, client: NewClient) -> AppResult<Client> {
        let _guard = self.lock()?;
        let created = self.store.insert_client(&client)?;
        tracing::info!(client_id = created.id, "client added");
        Ok(created)
    }

    pub fn get_client(&self, client_id: i64) -> AppResult<Option<Client>> {
        self.store.get_client(client_id)
    }

    pub fn update_client(&self, client_id: i64, patch: ClientPatch) -> AppResult<Client> {
        let _guard = self.lock()?;
        self.store.update_client(client_id, &patch)
    }

    /// Deletes a client and clears the reference on every case that used it.
    /// Returns the affected case ids.
    pub fn delete_client(&self, client_id: i64) -> AppResult<Vec<String>> {
        let _guard = self.lock()?;
        let detached = self.store.delete_client(client_id)?;
        if detached.is_empty() {
            tracing::info!(client_id, "client deleted");
        } else {
            tracing::warn!(client_id, cases = ?detached, "client deleted, case references cleared");
        }
        Ok(detached)
    }

    pub fn list_clients(&self) -> AppResult<Vec<Client>> {
        self.store.list_clients()
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| AppError::Internal("registry mutex poisoned".to_string()))
    }
}

fn compare_cases(a: &Case, b: &Case, key: CaseSortKey) -> Ordering {
    let primary = match key {
        CaseSortKey::CaseId => a.case_id.cmp(&b.case_id),
        CaseSortKey::CaseType => a.case_type.as_str().cmp(b.case_type.as_str()),
        CaseSortKey::Client => {
            let left = a.client_name.as_deref().unwrap_or("").to_lowercase();
            let right = b.client_name.as_deref().unwrap_or("").to_lowercase();
            left.cmp(&right)
        }
        CaseSortKey::CreatedAt => a.created_at.cmp(&b.created_at),
    };
    primary.then_with(|| a.case_id.cmp(&b.case_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db::SqliteStore;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    /// Delegates to SQLite but can be told to fail individual writes.
    struct FlakyStore {
        inner: SqliteStore,
        fail_insert: AtomicBool,
        fail_update: AtomicBool,
        fail_delete: AtomicBool,
    }

    impl FlakyStore {
        fn new(path: &Path) -> Self {
            Self {
                inner: SqliteStore::new(path).expect("store"),
                fail_insert: AtomicBool::new(false),
                fail_update: AtomicBool::new(false),
                fail_delete: AtomicBool::new(false),
            }
        }

        fn check(flag: &AtomicBool) -> AppResult<()> {
            if flag.load(AtomicOrdering::SeqCst) {
                Err(AppError::Store("injected failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl MetadataStore for FlakyStore {
        fn get_max_sequence(&self, period: &str) -> AppResult<u32> {
            self.inner.get_max_sequence(period)
        }
        fn insert_case(&self, case: &Case) -> AppResult<()> {
            Self::check(&self.fail_insert)?;
            self.inner.insert_case(case)
        }
        fn update_case(&self, case_id: &str, update: &CaseUpdate) -> AppResult<()> {
            Self::check(&self.fail_update)?;
            self.inner.update_case(case_id, update)
        }
        fn delete_case(&self, case_id: &str) -> AppResult<bool> {
            Self::check(&self.fail_delete)?;
            self.inner.delete_case(case_id)
        }
        fn is_retired(&self, case_id: &str) -> AppResult<bool> {
            self.inner.is_retired(case_id)
        }
        fn get_case(&self, case_id: &str) -> AppResult<Option<Case>> {
            self.inner.get_case(case_id)
        }
        fn list_cases(&self) -> AppResult<Vec<Case>> {
            self.inner.list_cases()
        }
        fn insert_client(&self, client: &NewClient) -> AppResult<Client> {
            self.inner.insert_client(client)
        }
        fn get_client(&self, client_id: i64) -> AppResult<Option<Client>> {
            self.inner.get_client(client_id)
        }
        fn update_client(&self, client_id: i64, patch: &ClientPatch) -> AppResult<Client> {
            self.inner.update_client(client_id, patch)
        }
        fn delete_client(&self, client_id: i64) -> AppResult<Vec<String>> {
            self.inner.delete_client(client_id)
        }
        fn list_clients(&self) -> AppResult<Vec<Client>> {
            self.inner.list_clients()
        }
    }

    fn flaky_registry() -> (tempfile::TempDir, Arc<FlakyStore>, CaseRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::rooted_at(dir.path());
        let store = Arc::new(FlakyStore::new(&settings.paths.database));
        let registry = CaseRegistry::new(store.clone(), CaseDirectories::new(&settings));
        (dir, store, registry)
    }

    fn period() -> Option<Period> {
        Some("2401".parse().expect("period"))
    }

    fn case_dirs(root: &Path) -> Vec<String> {
        match fs::read_dir(root) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn failed_commit_leaves_no_folder_and_no_record() {
        let (dir, store, registry) = flaky_registry();
        store.fail_insert.store(true, AtomicOrdering::SeqCst);

        let error = registry
            .create_case(CaseType::Person, None, period())
            .expect_err("injected insert failure");
        assert_eq!(error.kind(), "STORE_FAILURE");
        assert!(case_dirs(&dir.path().join("Cases")).is_empty());
        assert!(registry.list_cases(None, false).expect("list").is_empty());

        store.fail_insert.store(false, AtomicOrdering::SeqCst);
        let case = registry.create_case(CaseType::Person, None, period()).expect("create");
        assert_eq!(case.case_id, "2401-01");
    }

    #[test]
    fn failed_store_rename_reverts_folder() {
        let (_dir, store, registry) = flaky_registry();
        registry.create_case(CaseType::Person, None, period()).expect("create");
        store.fail_update.store(true, AtomicOrdering::SeqCst);

        let error = registry.rename_case("2401-01", "acme").expect_err("injected");
        assert_eq!(error.kind(), "STORE_FAILURE");
        assert!(registry.case_folder("2401-01").expect("folder").is_dir());
        assert!(!registry.case_folder("acme").expect("folder").exists());
    }

    #[test]
    fn failed_record_delete_is_reported_as_partial() {
        let (_dir, store, registry) = flaky_registry();
        registry.create_case(CaseType::Person, None, period()).expect("create");
        store.fail_delete.store(true, AtomicOrdering::SeqCst);

        let error = registry.delete_case("2401-01").expect_err("injected");
        assert_eq!(error.kind(), "PARTIAL_FAILURE");
        assert!(registry.get_case("2401-01").expect("get").is_some());

        store.fail_delete.store(false, AtomicOrdering::SeqCst);
        registry.delete_case("2401-01").expect("retry delete");
        assert!(registry.get_case("2401-01").expect("get").is_none());
    }

    #[test]
    fn rename_checks_existence_and_collisions() {
        let (_dir, _store, registry) = flaky_registry();
        registry.create_case(CaseType::Person, None, period()).expect("create 01");
        registry.create_case(CaseType::Person, None, period()).expect("create 02");

        assert_eq!(registry.rename_case("2401-07", "x").expect_err("missing").kind(), "NOT_FOUND");
        let taken = registry.rename_case("2401-01", "2401-02").expect_err("taken");
        assert_eq!(taken.kind(), "CONFLICT");
        let unsafe_id = registry.rename_case("2401-01", "../x").expect_err("bad");
        assert_eq!(unsafe_id.kind(), "INVALID_INPUT");
    }

    #[test]
    fn renamed_sequence_numbers_are_not_reissued() {
        let (_dir, _store, registry) = flaky_registry();
        registry.create_case(CaseType::Person, None, period()).expect("create");
        registry.rename_case("2401-01", "2401-05").expect("rename");
        let next = registry.create_case(CaseType::Person, None, period()).expect("create");
        assert_eq!(next.case_id, "2401-06");
    }

    #[test]
    fn rename_onto_a_deleted_case_id_is_a_conflict() {
        let (_dir, _store, registry) = flaky_registry();
        registry.create_case(CaseType::Person, None, period()).expect("create 01");
        registry.create_case(CaseType::Person, None, period()).expect("create 02");
        registry.delete_case("2401-02").expect("delete 02");

        let error = registry.rename_case("2401-01", "2401-02").expect_err("retired id");
        assert_eq!(error.kind(), "CONFLICT");
        assert!(registry.case_folder("2401-01").expect("folder").is_dir());
        assert!(!registry.case_folder("2401-02").expect("folder").exists());

        registry.rename_case("2401-01", "acme").expect("rename");
        registry.create_case(CaseType::Person, None, period()).expect("create 03");
        registry.rename_case("2401-03", "beta").expect("rename 03");
        registry.delete_case("beta").expect("delete free-form");
        assert_eq!(registry.rename_case("acme", "beta").expect_err("retired").kind(), "CONFLICT");

        let back = registry
            .rename_case("acme", "2401-01")
            .expect("renamed-away id is still usable");
        assert_eq!(back.case_id, "2401-01");
    }

    #[test]
    fn unknown_client_ref_blocks_creation() {
        let (dir, _store, registry) = flaky_registry();
        let error = registry
            .create_case(CaseType::Company, Some(99), period())
            .expect_err("unknown client");
        assert_eq!(error.kind(), "NOT_FOUND");
        assert!(case_dirs(&dir.path().join("Cases")).is_empty());
    }

    #[test]
    fn listing_sorts_by_requested_key() {
        let (_dir, _store, registry) = flaky_registry();
        let zed = registry
            .add_client(NewClient {
                name: "Zed Corp".to_string(),
                ..NewClient::default()
            })
            .expect("client");
        let acme = registry
            .add_client(NewClient {
                name: "Acme".to_string(),
                ..NewClient::default()
            })
            .expect("client");
        registry.create_case(CaseType::Person, Some(zed.id), period()).expect("01");
        registry.create_case(CaseType::Company, Some(acme.id), period()).expect("02");

        let by_created = registry.list_cases(None, false).expect("list");
        assert_eq!(by_created[0].case_id, "2401-01");

        let by_client = registry.list_cases(Some(CaseSortKey::Client), false).expect("list");
        assert_eq!(by_client[0].client_name.as_deref(), Some("Acme"));

        let by_id_desc = registry.list_cases(Some(CaseSortKey::CaseId), true).expect("list");
        assert_eq!(by_id_desc[0].case_id, "2401-02");
    }

    #[test]
    fn search_matches_id_or_client_name() {
        let (_dir, _store, registry) = flaky_registry();
        let acme = registry
            .add_client(NewClient {
                name: "Acme Holdings".to_string(),
                ..NewClient::default()
            })
            .expect("client");
        registry.create_case(CaseType::Person, None, period()).expect("01");
        registry.create_case(CaseType::Company, Some(acme.id), period()).expect("02");

        let by_client = registry.search("holdings").expect("search").map(|c| c.case_id);
        assert_eq!(by_client, Some("2401-02".to_string()));
        let by_id = registry.search("2401").expect("search").map(|c| c.case_id);
        assert_eq!(by_id, Some("2401-01".to_string()));
        assert!(registry.search("nobody").expect("search").is_none());
        assert!(registry.search("   ").expect("search").is_none());
    }

    #[test]
    fn set_case_client_and_delete_client_null_out() {
        let (_dir, _store, registry) = flaky_registry();
        let acme = registry
            .add_client(NewClient {
                name: "Acme".to_string(),
                ..NewClient::default()
            })
            .expect("client");
        registry.create_case(CaseType::Person, None, period()).expect("create");

        let linked = registry.set_case_client("2401-01", Some(acme.id)).expect("link");
        assert_eq!(linked.client_name.as_deref(), Some("Acme"));

        let detached = registry.delete_client(acme.id).expect("delete client");
        assert_eq!(detached, vec!["2401-01".to_string()]);
        let case = registry.get_case("2401-01").expect("get").expect("exists");
        assert_eq!(case.client_ref, None);
        assert!(registry.list_clients().expect("clients").is_empty());
    }

    #[test]
    fn with_existing_case_refuses_deleted_cases() {
        let (_dir, _store, registry) = flaky_registry();
        registry.create_case(CaseType::Person, None, period()).expect("create");
        let folder = registry
            .with_existing_case("2401-01", |folder| Ok(folder.to_path_buf()))
            .expect("exists");
        assert!(folder.is_dir());

        registry.delete_case("2401-01").expect("delete");
        let error = registry
            .with_existing_case("2401-01", |_| Ok(()))
            .expect_err("deleted");
        assert_eq!(error.kind(), "NOT_FOUND");
        assert!(!folder.exists());
    }
}
