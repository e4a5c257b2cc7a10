use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::credentials::{AuthType, BasicCredential, CredentialPatch, OAuth2Credential, ServerCredential};
use crate::error::AuthError;
use crate::provider::ProviderEndpoints;

/// Durable per-server credential storage.
pub trait CredentialStore: Send + Sync {
    fn get_credentials(&self, server_id: &str) -> Result<Option<ServerCredential>, AuthError>;

    /// Atomically writes the full record for the patch's variant. Fails with
    /// [`AuthError::AuthTypeMismatch`] if the stored record has the other variant.
    fn set_credentials(&self, server_id: &str, patch: &CredentialPatch) -> Result<(), AuthError>;

    /// Drops any existing credential and stores `credential`, whatever its type.
    fn replace_credentials(
        &self,
        server_id: &str,
        credential: &ServerCredential,
    ) -> Result<(), AuthError>;

    fn delete_credentials(&self, server_id: &str) -> Result<bool, AuthError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub server_id: String,
    pub base_url: String,
    pub created_at: DateTime<Utc>,
}

pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCredentialStore").finish_non_exhaustive()
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        base_url TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS credentials (
        server_id TEXT PRIMARY KEY REFERENCES servers(id) ON DELETE CASCADE,
        auth_type TEXT NOT NULL CHECK (auth_type IN ('basic', 'oauth2')),
        username TEXT,
        secret TEXT NOT NULL,
        refresh_token TEXT,
        token_expiry INTEGER,
        provider_host TEXT,
        realm TEXT,
        client_id TEXT,
        CHECK (auth_type = 'oauth2' OR (refresh_token IS NULL AND token_expiry IS NULL))
    );";

fn conversion_error(column: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, msg.into())
}

fn timestamp_to_datetime(column: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| conversion_error(column, format!("timestamp {secs} out of range")))
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<ServerCredential> {
    let auth_type: String = row.get(0)?;
    let username: Option<String> = row.get(1)?;
    let secret: String = row.get(2)?;

    match AuthType::parse(&auth_type) {
        Some(AuthType::Basic) => Ok(ServerCredential::Basic(BasicCredential {
            username: username.unwrap_or_default(),
            secret,
        })),
        Some(AuthType::OAuth2) => {
            let token_expiry = row
                .get::<_, Option<i64>>(4)?
                .map(|secs| timestamp_to_datetime(4, secs))
                .transpose()?;
            Ok(ServerCredential::OAuth2(OAuth2Credential {
                secret,
                refresh_token: row.get(3)?,
                token_expiry,
                endpoints: ProviderEndpoints {
                    provider_host: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    realm: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    client_id: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                },
            }))
        }
        None => Err(conversion_error(0, format!("unknown auth type '{auth_type}'"))),
    }
}

fn write_credential(
    conn: &Connection,
    server_id: &str,
    credential: &ServerCredential,
) -> rusqlite::Result<()> {
    let sql = "INSERT INTO credentials
            (server_id, auth_type, username, secret, refresh_token, token_expiry, provider_host, realm, client_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(server_id) DO UPDATE SET
            auth_type = excluded.auth_type,
            username = excluded.username,
            secret = excluded.secret,
            refresh_token = excluded.refresh_token,
            token_expiry = excluded.token_expiry,
            provider_host = excluded.provider_host,
            realm = excluded.realm,
            client_id = excluded.client_id";

    match credential {
        ServerCredential::Basic(b) => conn.execute(
            sql,
            params![
                server_id,
                AuthType::Basic.as_str(),
                b.username,
                b.secret,
                None::<String>,
                None::<i64>,
                None::<String>,
                None::<String>,
                None::<String>,
            ],
        ),
        ServerCredential::OAuth2(o) => conn.execute(
            sql,
            params![
                server_id,
                AuthType::OAuth2.as_str(),
                None::<String>,
                o.secret,
                o.refresh_token,
                o.token_expiry.map(|t| t.timestamp()),
                o.endpoints.provider_host,
                o.endpoints.realm,
                o.endpoints.client_id,
            ],
        ),
    }?;
    Ok(())
}

fn require_server(conn: &Connection, server_id: &str) -> Result<(), AuthError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM servers WHERE id = ?1",
            params![server_id],
            |_| Ok(()),
        )
        .optional()?;
    match exists {
        Some(()) => Ok(()),
        None => Err(AuthError::ServerNotFound(server_id.to_string())),
    }
}

impl SqliteCredentialStore {
    pub fn open(path: &Path) -> Result<Self, AuthError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AuthError::Validation(format!(
                        "cannot create credential directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AuthError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AuthError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a server, or updates its base URL if it already exists.
    pub fn register_server(&self, server_id: &str, base_url: &str) -> Result<(), AuthError> {
        if server_id.trim().is_empty() {
            return Err(AuthError::Validation("server id is required".to_string()));
        }
        self.lock().execute(
            "INSERT INTO servers (id, base_url, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET base_url = excluded.base_url",
            params![server_id, base_url, Utc::now().timestamp()],
        )?;
        tracing::debug!(server_id, "Registered server");
        Ok(())
    }

    /// Removes a server and, through the foreign key, its credential.
    pub fn remove_server(&self, server_id: &str) -> Result<bool, AuthError> {
        let removed = self
            .lock()
            .execute("DELETE FROM servers WHERE id = ?1", params![server_id])?;
        if removed > 0 {
            tracing::info!(server_id, "Removed server and its credentials");
        }
        Ok(removed > 0)
    }

    pub fn get_server(&self, server_id: &str) -> Result<Option<ServerRecord>, AuthError> {
        let conn = self.lock();
        let record = conn
            .query_row(
                "SELECT id, base_url, created_at FROM servers WHERE id = ?1",
                params![server_id],
                |row| {
                    Ok(ServerRecord {
                        server_id: row.get(0)?,
                        base_url: row.get(1)?,
                        created_at: timestamp_to_datetime(2, row.get(2)?)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_servers(&self) -> Result<Vec<(ServerRecord, Option<AuthType>)>, AuthError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT s.id, s.base_url, s.created_at, c.auth_type
             FROM servers s LEFT JOIN credentials c ON c.server_id = s.id
             ORDER BY s.id",
        )?;
        let rows = stmt.query_map([], |row| {
            let record = ServerRecord {
                server_id: row.get(0)?,
                base_url: row.get(1)?,
                created_at: timestamp_to_datetime(2, row.get(2)?)?,
            };
            let auth_type = row
                .get::<_, Option<String>>(3)?
                .and_then(|t| AuthType::parse(&t));
            Ok((record, auth_type))
        })?;
        let mut servers = Vec::new();
        for row in rows {
            servers.push(row?);
        }
        Ok(servers)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn get_credentials(&self, server_id: &str) -> Result<Option<ServerCredential>, AuthError> {
        let conn = self.lock();
        let credential = conn
            .query_row(
                "SELECT auth_type, username, secret, refresh_token, token_expiry, provider_host, realm, client_id
                 FROM credentials WHERE server_id = ?1",
                params![server_id],
                credential_from_row,
            )
            .optional()?;
        Ok(credential)
    }

    fn set_credentials(&self, server_id: &str, patch: &CredentialPatch) -> Result<(), AuthError> {
        patch.validate()?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        require_server(&tx, server_id)?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT auth_type FROM credentials WHERE server_id = ?1",
                params![server_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(stored) = stored {
            if stored != patch.auth_type().as_str() {
                return Err(AuthError::AuthTypeMismatch {
                    server_id: server_id.to_string(),
                    stored,
                    requested: patch.auth_type().to_string(),
                });
            }
        }

        write_credential(&tx, server_id, patch)?;
        tx.commit()?;
        tracing::debug!(server_id, auth_type = %patch.auth_type(), "Stored credentials");
        Ok(())
    }

    fn replace_credentials(
        &self,
        server_id: &str,
        credential: &ServerCredential,
    ) -> Result<(), AuthError> {
        credential.validate()?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        require_server(&tx, server_id)?;
        tx.execute(
            "DELETE FROM credentials WHERE server_id = ?1",
            params![server_id],
        )?;
        write_credential(&tx, server_id, credential)?;
        tx.commit()?;
        tracing::info!(server_id, auth_type = %credential.auth_type(), "Replaced credentials");
        Ok(())
    }

    fn delete_credentials(&self, server_id: &str) -> Result<bool, AuthError> {
        let removed = self.lock().execute(
            "DELETE FROM credentials WHERE server_id = ?1",
            params![server_id],
        )?;
        Ok(removed > 0)
    }
}
