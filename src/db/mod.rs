use crate::errors::{AppError, AppResult};
use crate::models::{Case, CaseType, CaseUpdate, Client, ClientPatch, NewClient};
use crate::numbering::CaseId;
use crate::store::MetadataStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const CASE_COLUMNS: &str = "c.case_number, c.case_type, c.client_id, cl.name, c.created_at
     FROM cases c LEFT JOIN clients cl ON cl.id = c.client_id";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Filesystem(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;
        tracing::debug!(path = %path.display(), "opened metadata store");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

impl MetadataStore for SqliteStore {
    fn get_max_sequence(&self, period: &str) -> AppResult<u32> {
        let conn = self.lock()?;
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM issued_case_numbers WHERE period = ?1",
            [period],
            |row| row.get(0),
        )?;
        u32::try_from(max).map_err(|_| AppError::Store(format!("sequence {} out of range", max)))
    }

    fn insert_case(&self, case: &Case) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if case_exists(&tx, &case.case_id)? {
            return Err(AppError::Conflict(format!("case {} already exists", case.case_id)));
        }
        if is_retired(&tx, &case.case_id)? {
            return Err(AppError::Conflict(format!(
                "case id {} belonged to a deleted case",
                case.case_id
            )));
        }
        if let Some(client_id) = case.client_ref {
            ensure_client_exists(&tx, client_id)?;
        }
        tx.execute(
            "INSERT INTO cases (case_number, case_type, client_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                case.case_id,
                case.case_type.as_str(),
                case.client_ref,
                case.created_at.to_rfc3339()
            ],
        )?;
        record_issued(&tx, &case.case_id)?;
        tx.commit()?;
        Ok(())
    }

    fn update_case(&self, case_id: &str, update: &CaseUpdate) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if !case_exists(&tx, case_id)? {
            return Err(AppError::NotFound(format!("case {}", case_id)));
        }

        let mut current_id = case_id.to_string();
        if let Some(new_id) = update.case_id.as_deref() {
            if new_id != case_id {
                if case_exists(&tx, new_id)? {
                    return Err(AppError::Conflict(format!("case {} already exists", new_id)));
                }
                if is_retired(&tx, new_id)? {
                    return Err(AppError::Conflict(format!(
                        "case id {} belonged to a deleted case",
                        new_id
                    )));
                }
                tx.execute(
                    "UPDATE cases SET case_number = ?1 WHERE case_number = ?2",
                    params![new_id, case_id],
                )?;
                record_issued(&tx, new_id)?;
                current_id = new_id.to_string();
            }
        }

        if let Some(client_ref) = update.client_ref {
            if let Some(client_id) = client_ref {
                ensure_client_exists(&tx, client_id)?;
            }
            tx.execute(
                "UPDATE cases SET client_id = ?1 WHERE case_number = ?2",
                params![client_ref, current_id],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn delete_case(&self, case_id: &str) -> AppResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM cases WHERE case_number = ?1", [case_id])?;
        if removed > 0 {
            tx.execute(
                "INSERT OR IGNORE INTO deleted_case_ids (case_number, deleted_at) VALUES (?1, ?2)",
                params![case_id, Utc::now().to_rfc3339()],
            )?;
        }
        tx.commit()?;
        Ok(removed > 0)
    }

    fn is_retired(&self, case_id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        is_retired(&conn, case_id)
    }

    fn get_case(&self, case_id: &str) -> AppResult<Option<Case>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} WHERE c.case_number = ?1", CASE_COLUMNS),
            [case_id],
            parse_case_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn list_cases(&self) -> AppResult<Vec<Case>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!("SELECT {} ORDER BY c.id ASC", CASE_COLUMNS))?;
        let rows = statement.query_map([], parse_case_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn insert_client(&self, client: &NewClient) -> AppResult<Client> {
        let name = client.name.trim();
        if name.is_empty() {
            return Err(AppError::Invalid("client name cannot be empty".to_string()));
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if client_name_taken(&tx, name, None)? {
            return Err(AppError::Conflict(format!("a client named '{}' already exists", name)));
        }
        tx.execute(
            "INSERT INTO clients (name, point_of_contact, phone_number, email)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, client.point_of_contact, client.phone_number, client.email],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(Client {
            id,
            name: name.to_string(),
            point_of_contact: client.point_of_contact.clone(),
            phone_number: client.phone_number.clone(),
            email: client.email.clone(),
        })
    }

    fn get_client(&self, client_id: i64) -> AppResult<Option<Client>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, point_of_contact, phone_number, email FROM clients WHERE id = ?1",
            [client_id],
            parse_client_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    fn update_client(&self, client_id: i64, patch: &ClientPatch) -> AppResult<Client> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        ensure_client_exists(&tx, client_id)?;

        let mut assignments: Vec<&str> = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(name) = patch.name.as_deref() {
            let name = name.trim();
            if name.is_empty() {
                return Err(AppError::Invalid("client name cannot be empty".to_string()));
            }
            if client_name_taken(&tx, name, Some(client_id))? {
                return Err(AppError::Conflict(format!("a client named '{}' already exists", name)));
            }
            assignments.push("name = ?");
            values.push(name.to_string());
        }
        if let Some(point_of_contact) = &patch.point_of_contact {
            assignments.push("point_of_contact = ?");
            values.push(point_of_contact.clone());
        }
        if let Some(phone_number) = &patch.phone_number {
            assignments.push("phone_number = ?");
            values.push(phone_number.clone());
        }
        if let Some(email) = &patch.email {
            assignments.push("email = ?");
            values.push(email.clone());
        }

        if !assignments.is_empty() {
            let sql = format!("UPDATE clients SET {} WHERE id = ?", assignments.join(", "));
            let mut dyn_params: Vec<&dyn rusqlite::ToSql> =
                values.iter().map(|value| value as &dyn rusqlite::ToSql).collect();
            dyn_params.push(&client_id);
            tx.execute(&sql, rusqlite::params_from_iter(dyn_params))?;
        }

        let updated = tx.query_row(
            "SELECT id, name, point_of_contact, phone_number, email FROM clients WHERE id = ?1",
            [client_id],
            parse_client_row,
        )?;
        tx.commit()?;
        Ok(updated)
    }

    fn delete_client(&self, client_id: i64) -> AppResult<Vec<String>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        ensure_client_exists(&tx, client_id)?;

        let detached = {
            let mut statement =
                tx.prepare("SELECT case_number FROM cases WHERE client_id = ?1 ORDER BY id ASC")?;
            let rows = statement.query_map([client_id], |row| row.get::<_, String>(0))?;
            let mut detached = Vec::new();
            for row in rows {
                detached.push(row?);
            }
            detached
        };

        tx.execute("UPDATE cases SET client_id = NULL WHERE client_id = ?1", [client_id])?;
        tx.execute("DELETE FROM clients WHERE id = ?1", [client_id])?;
        tx.commit()?;
        Ok(detached)
    }

    fn list_clients(&self) -> AppResult<Vec<Client>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT id, name, point_of_contact, phone_number, email
             FROM clients ORDER BY name COLLATE NOCASE ASC",
        )?;
        let rows = statement.query_map([], parse_client_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}

fn case_exists(conn: &Connection, case_id: &str) -> AppResult<bool> {
    let found = conn
        .query_row("SELECT 1 FROM cases WHERE case_number = ?1", [case_id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn ensure_client_exists(conn: &Connection, client_id: i64) -> AppResult<()> {
    let found = conn
        .query_row("SELECT 1 FROM clients WHERE id = ?1", [client_id], |_| Ok(()))
        .optional()?;
    match found {
        Some(()) => Ok(()),
        None => Err(AppError::NotFound(format!("client {}", client_id))),
    }
}

fn client_name_taken(conn: &Connection, name: &str, except: Option<i64>) -> AppResult<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM clients WHERE name = ?1 AND (?2 IS NULL OR id != ?2)",
            params![name, except],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Free-form identifiers (from renames) are not part of any sequence.
fn is_retired(conn: &Connection, case_id: &str) -> AppResult<bool> {
    let found = conn
        .query_row("SELECT 1 FROM deleted_case_ids WHERE case_number = ?1", [case_id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn record_issued(conn: &Connection, case_id: &str) -> AppResult<()> {
    let Ok(parsed) = CaseId::parse(case_id) else {
        return Ok(());
    };
    conn.execute(
        "INSERT OR IGNORE INTO issued_case_numbers (period, seq, case_number, issued_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            parsed.period().key(),
            parsed.sequence(),
            case_id,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

fn parse_case_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Case> {
    Ok(Case {
        case_id: row.get(0)?,
        case_type: parse_case_type(&row.get::<_, String>(1)?)?,
        client_ref: row.get(2)?,
        client_name: row.get(3)?,
        created_at: parse_time(&row.get::<_, String>(4)?)?,
    })
}

fn parse_client_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Client> {
    Ok(Client {
        id: row.get(0)?,
        name: row.get(1)?,
        point_of_contact: row.get(2)?,
        phone_number: row.get(3)?,
        email: row.get(4)?,
    })
}

fn parse_case_type(raw: &str) -> rusqlite::Result<CaseType> {
    raw.parse::<CaseType>().map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
        )
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
