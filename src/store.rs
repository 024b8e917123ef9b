use crate::errors::AppResult;
use crate::models::{Case, CaseUpdate, Client, ClientPatch, NewClient};

/// The persistence operations the registry relies on. Each call is atomic on
/// its own; sequencing several calls is the registry's job.
pub trait MetadataStore: Send + Sync {
    /// Highest sequence ever issued for a `YYMM` period, deleted cases
    /// included. Zero when the period has never been used.
    fn get_max_sequence(&self, period: &str) -> AppResult<u32>;

    /// Inserts the case and records its identifier as issued. Fails with
    /// `Conflict` if the identifier is taken or retired.
    fn insert_case(&self, case: &Case) -> AppResult<()>;

    /// Fails with `NotFound` for an unknown case and `Conflict` when renaming
    /// onto an identifier in use or retired.
    fn update_case(&self, case_id: &str, update: &CaseUpdate) -> AppResult<()>;

    /// Returns whether a row was removed. A removed identifier is retired
    /// for good.
    fn delete_case(&self, case_id: &str) -> AppResult<bool>;

    /// True when the identifier belonged to a case that was deleted.
    fn is_retired(&self, case_id: &str) -> AppResult<bool>;

    fn get_case(&self, case_id: &str) -> AppResult<Option<Case>>;

    fn list_cases(&self) -> AppResult<Vec<Case>>;

    fn insert_client(&self, client: &NewClient) -> AppResult<Client>;

    fn get_client(&self, client_id: i64) -> AppResult<Option<Client>>;

    fn update_client(&self, client_id: i64, patch: &ClientPatch) -> AppResult<Client>;

    /// Removes the client after clearing every case reference to it. Returns
    /// the identifiers of the cases whose reference was cleared.
    fn delete_client(&self, client_id: i64) -> AppResult<Vec<String>>;

    fn list_clients(&self) -> AppResult<Vec<Client>>;
}
