//! Site registry backed by SQLite
//! Holds the hostname -> backend table and the admin access tokens

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Errors surfaced by registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The backing store could not answer the query
    #[error("registry unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    #[error("a site for domain '{0}' already exists")]
    Duplicate(String),

    #[error("invalid site: {0}")]
    Validation(String),

    #[error("failed to prepare registry location: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// One tenant's routing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    /// Label locating the site's certificate directory
    pub name: String,
    /// Routing key, matched exactly against Host / SNI
    pub domain: String,
    /// Absolute base URL of the origin
    pub backend_url: String,
    #[serde(default)]
    pub tls_enabled: bool,
}

impl Site {
    pub fn new(name: &str, domain: &str, backend_url: &str, tls_enabled: bool) -> Self {
        Self {
            name: name.to_string(),
            domain: domain.to_string(),
            backend_url: backend_url.to_string(),
            tls_enabled,
        }
    }

    /// Check the fields before the site is written
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.is_empty() {
            return Err(RegistryError::Validation("name must not be empty".into()));
        }
        // The name becomes a directory under the site root, so it must stay a single component
        let mut components = Path::new(&self.name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !self.name.contains(['/', '\\']) => {}
            _ => {
                return Err(RegistryError::Validation(format!(
                    "name '{}' must be a single path component",
                    self.name
                )))
            }
        }

        if self.domain.is_empty() || self.domain.chars().any(char::is_whitespace) {
            return Err(RegistryError::Validation(format!(
                "domain '{}' must be a non-empty hostname",
                self.domain
            )));
        }

        let url = Url::parse(&self.backend_url).map_err(|e| {
            RegistryError::Validation(format!("backend_url '{}': {}", self.backend_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(RegistryError::Validation(format!(
                "backend_url '{}' must be an absolute http(s) URL",
                self.backend_url
            )));
        }

        Ok(())
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            domain: row.get(1)?,
            backend_url: row.get(2)?,
            tls_enabled: row.get(3)?,
        })
    }
}

/// Thread-safe registry over a single SQLite connection
/// The lock is held for one statement at a time
pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    /// Open (or create) the registry database at `db_path`
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, RegistryError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;

        // Enable WAL mode so the admin API can write while the proxy reads
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        Self::with_connection(conn)
    }

    /// Registry that lives only as long as the process
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RegistryError> {
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.initialize()?;
        Ok(registry)
    }

    fn initialize(&self) -> Result<(), RegistryError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                domain TEXT NOT NULL,
                backend_url TEXT NOT NULL,
                tls_enabled INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sites_domain ON sites(domain);
            CREATE TABLE IF NOT EXISTS access_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT NOT NULL UNIQUE,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );",
        )?;

        Ok(())
    }

    /// Find the site whose domain equals `host` exactly
    pub fn lookup_by_host(&self, host: &str) -> Result<Option<Site>, RegistryError> {
        let conn = self.conn.lock();

        let site = conn
            .query_row(
                "SELECT name, domain, backend_url, tls_enabled FROM sites WHERE domain = ?1",
                params![host],
                Site::from_row,
            )
            .optional()?;

        Ok(site)
    }

    /// All sites that terminate TLS, in insertion order
    pub fn list_tls_enabled(&self) -> Result<Vec<Site>, RegistryError> {
        self.query_sites(
            "SELECT name, domain, backend_url, tls_enabled FROM sites
             WHERE tls_enabled = 1 ORDER BY id",
        )
    }

    pub fn list_sites(&self) -> Result<Vec<Site>, RegistryError> {
        self.query_sites("SELECT name, domain, backend_url, tls_enabled FROM sites ORDER BY id")
    }

    fn query_sites(&self, sql: &str) -> Result<Vec<Site>, RegistryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let sites = stmt
            .query_map([], Site::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    /// Validate and store a new site
    pub fn insert(&self, site: Site) -> Result<Site, RegistryError> {
        site.validate()?;

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO sites (name, domain, backend_url, tls_enabled) VALUES (?1, ?2, ?3, ?4)",
            params![site.name, site.domain, site.backend_url, site.tls_enabled],
        );

        match result {
            Ok(_) => Ok(site),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(RegistryError::Duplicate(site.domain))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `token` is a known access token. Read-only.
    pub fn verify_token(&self, token: &str) -> Result<bool, RegistryError> {
        if token.is_empty() {
            return Ok(false);
        }

        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM access_tokens WHERE token = ?1",
                params![token],
                |_| Ok(()),
            )
            .optional()?;

        Ok(found.is_some())
    }

    /// Store an access token, generating one when `token` is None
    pub fn add_token(&self, token: Option<&str>) -> Result<String, RegistryError> {
        let token = match token {
            Some(t) if t.trim().is_empty() => {
                return Err(RegistryError::Validation("token must not be empty".into()))
            }
            Some(t) => t.to_string(),
            None => Uuid::new_v4().simple().to_string(),
        };

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO access_tokens (token) VALUES (?1)",
            params![token],
        )?;

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn site(domain: &str) -> Site {
        Site::new("shop", domain, "http://127.0.0.1:9001", false)
    }

    #[test]
    fn test_open_creates_database_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("data").join("server.db");
        let _registry = Registry::open(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_insert_and_lookup() {
        let registry = Registry::open_in_memory().unwrap();
        registry.insert(site("a.test")).unwrap();

        let found = registry.lookup_by_host("a.test").unwrap().unwrap();
        assert_eq!(found.backend_url, "http://127.0.0.1:9001");
        assert_eq!(found.name, "shop");
        assert!(!found.tls_enabled);
    }

    #[test]
    fn test_lookup_is_exact_and_case_sensitive() {
        let registry = Registry::open_in_memory().unwrap();
        registry.insert(site("a.test")).unwrap();

        assert!(registry.lookup_by_host("A.test").unwrap().is_none());
        assert!(registry.lookup_by_host("www.a.test").unwrap().is_none());
        assert!(registry.lookup_by_host("a.test.").unwrap().is_none());
        assert!(registry.lookup_by_host("").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let registry = Registry::open_in_memory().unwrap();
        registry.insert(site("a.test")).unwrap();

        let err = registry.insert(site("a.test")).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(d) if d == "a.test"));
    }

    #[test]
    fn test_validation_errors() {
        let registry = Registry::open_in_memory().unwrap();

        let cases = [
            Site::new("", "a.test", "http://127.0.0.1:1", false),
            Site::new("../etc", "a.test", "http://127.0.0.1:1", false),
            Site::new("a/b", "a.test", "http://127.0.0.1:1", false),
            Site::new("shop", "", "http://127.0.0.1:1", false),
            Site::new("shop", "a test", "http://127.0.0.1:1", false),
            Site::new("shop", "a.test", "127.0.0.1:1", false),
            Site::new("shop", "a.test", "ftp://127.0.0.1", false),
        ];

        for case in cases {
            let err = registry.insert(case.clone()).unwrap_err();
            assert!(matches!(err, RegistryError::Validation(_)), "{:?}", case);
        }
        assert!(registry.list_sites().unwrap().is_empty());
    }

    #[test]
    fn test_list_tls_enabled() {
        let registry = Registry::open_in_memory().unwrap();
        registry.insert(Site::new("one", "one.test", "http://127.0.0.1:1", true)).unwrap();
        registry.insert(Site::new("two", "two.test", "http://127.0.0.1:2", false)).unwrap();
        registry.insert(Site::new("three", "three.test", "https://origin.example", true)).unwrap();

        let domains: Vec<_> = registry
            .list_tls_enabled()
            .unwrap()
            .into_iter()
            .map(|s| s.domain)
            .collect();
        assert_eq!(domains, vec!["one.test", "three.test"]);
        assert_eq!(registry.list_sites().unwrap().len(), 3);
    }

    #[test]
    fn test_tokens() {
        let registry = Registry::open_in_memory().unwrap();
        assert!(!registry.verify_token("secret").unwrap());

        registry.add_token(Some("secret")).unwrap();
        assert!(registry.verify_token("secret").unwrap());
        assert!(!registry.verify_token("Secret").unwrap());
        assert!(!registry.verify_token("").unwrap());

        let generated = registry.add_token(None).unwrap();
        assert_eq!(generated.len(), 32);
        assert!(registry.verify_token(&generated).unwrap());
    }

    #[test]
    fn test_reopen_keeps_sites() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("server.db");

        {
            let registry = Registry::open(&db_path).unwrap();
            registry.insert(site("a.test")).unwrap();
        }

        let registry = Registry::open(&db_path).unwrap();
        assert!(registry.lookup_by_host("a.test").unwrap().is_some());
    }
}
