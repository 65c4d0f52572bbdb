//! This module provides a local cache of the server address book
//!
//! The cache maps the identifiers clients use (email addresses, or just their local-part) to the
//! directory uids the server uses in its calendar URLs, and back.
//!
//! Every lookup goes through [`AddressBook::ensure_fresh`], that holds a single lock for the whole
//! cache while it decides whether to reload and while the refresh itself runs. As a consequence, at
//! most one directory download is in flight at any time, and concurrent callers wait for it then
//! all observe the same snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{GatewayConfiguration, GatewaySettings};
use crate::directory::{parse_directory, DirectoryEntry};
use crate::error::GatewayError;
use crate::traits::Upstream;

const CACHE_FILE_NAME: &str = "addressbook-cache.json";


/// An immutable view of the directory at a given time
#[derive(Debug)]
pub struct CacheSnapshot {
    generated_at: DateTime<Utc>,
    /// Every known address, in directory order
    emails: Vec<String>,
    /// Every (email, uid) pair of the directory, in order, shared addresses included
    rows: Vec<(String, String)>,
    email_to_uid: HashMap<String, String>,
    uid_to_email: HashMap<String, String>,
    uid_to_name: HashMap<String, String>,
    /// Filled lazily by local-part lookups. Only ever points to keys of `email_to_uid`
    local_part_to_email: Mutex<HashMap<String, String>>,
}

impl CacheSnapshot {
    pub fn from_entries(entries: &[DirectoryEntry], generated_at: DateTime<Utc>) -> Self {
        let mut emails = Vec::new();
        let mut rows = Vec::new();
        let mut email_to_uid = HashMap::new();
        let mut uid_to_email = HashMap::new();
        let mut uid_to_name = HashMap::new();

        for entry in entries {
            let uid = entry.uid.trim();
            if uid.is_empty() {
                continue;
            }
            if let Some(name) = &entry.display_name {
                uid_to_name.entry(uid.to_string()).or_insert_with(|| name.clone());
            }

            for email in &entry.emails {
                let email = email.trim().to_lowercase();
                if email.is_empty() {
                    continue;
                }
                rows.push((email.clone(), uid.to_string()));
                uid_to_email.entry(uid.to_string()).or_insert_with(|| email.clone());
                if email_to_uid.contains_key(&email) {
                    log::debug!("{} is used by several principals, keeping the first one", email);
                    continue;
                }
                email_to_uid.insert(email.clone(), uid.to_string());
                emails.push(email);
            }
        }

        Self {
            generated_at,
            emails,
            rows,
            email_to_uid,
            uid_to_email,
            uid_to_name,
            local_part_to_email: Mutex::new(HashMap::new()),
        }
    }

    pub fn generated_at(&self) -> DateTime<Utc> { self.generated_at }

    pub fn len(&self) -> usize { self.email_to_uid.len() }
    pub fn is_empty(&self) -> bool { self.email_to_uid.is_empty() }

    /// Whether this snapshot is still valid for `ttl` at `now`
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        is_fresh(self.generated_at, ttl, now)
    }

    pub fn uid(&self, email: &str) -> Option<&str> {
        self.email_to_uid.get(&email.trim().to_lowercase()).map(|uid| uid.as_str())
    }

    pub fn primary_email(&self, uid: &str) -> Option<&str> {
        self.uid_to_email.get(uid.trim()).map(|email| email.as_str())
    }

    pub fn display_name(&self, uid: &str) -> Option<&str> {
        self.uid_to_name.get(uid.trim()).map(|name| name.as_str())
    }

    /// The local-parts that have already been resolved
    pub fn memoized_local_part(&self, local_part: &str) -> Option<String> {
        self.local_part_to_email.lock().ok()?.get(local_part).cloned()
    }

    /// Find the first address whose local-part is `local_part`
    pub fn email_for_local_part(&self, local_part: &str) -> Option<String> {
        let local_part = local_part.trim().to_lowercase();
        if let Some(email) = self.memoized_local_part(&local_part) {
            return Some(email);
        }

        log::debug!("Scanning {} addresses for local-part {}", self.emails.len(), local_part);
        let found = self.emails.iter()
            .find(|email| email.split('@').next() == Some(local_part.as_str()))
            .cloned()?;

        if let Ok(mut memo) = self.local_part_to_email.lock() {
            memo.entry(local_part).or_insert_with(|| found.clone());
        }
        Some(found)
    }

    fn to_persisted(&self, account: &str) -> PersistedCache {
        let entries = self.rows.iter()
            .map(|(email, uid)| PersistedEntry {
                email: email.clone(),
                uid: uid.clone(),
                name: self.uid_to_name.get(uid).cloned(),
            })
            .collect();

        PersistedCache {
            generated_at: self.generated_at,
            account: account.to_string(),
            entries,
        }
    }
}

fn is_fresh(generated_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    generated_at + ttl > now
}


/// The on-disk format of a snapshot
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedCache {
    generated_at: DateTime<Utc>,
    #[serde(default)]
    account: String,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct PersistedEntry {
    email: String,
    uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl PersistedCache {
    fn into_snapshot(self) -> CacheSnapshot {
        // Rows are in directory order, shared addresses included, so the maps are rebuilt the same way
        let entries: Vec<DirectoryEntry> = self.entries.into_iter()
            .map(|entry| DirectoryEntry {
                uid: entry.uid,
                emails: vec![entry.email],
                display_name: entry.name,
            })
            .collect();
        CacheSnapshot::from_entries(&entries, self.generated_at)
    }
}


/// The address book of the server, cached in memory and in a local file
pub struct AddressBook {
    upstream: Arc<dyn Upstream>,
    account: String,
    username: String,
    backing_file: PathBuf,
    ttl: Duration,

    snapshot: tokio::sync::Mutex<Option<Arc<CacheSnapshot>>>,
}

impl AddressBook {
    pub fn new(upstream: Arc<dyn Upstream>, config: &GatewayConfiguration, settings: &GatewaySettings) -> Self {
        Self {
            upstream,
            account: config.account_key(),
            username: config.username().to_string(),
            backing_file: settings.data_dir.join(CACHE_FILE_NAME),
            ttl: Duration::hours(i64::from(settings.cache_hours)),
            snapshot: tokio::sync::Mutex::new(None),
        }
    }

    /// Get the path to the cache file
    pub fn cache_file(&self) -> &Path {
        &self.backing_file
    }

    /// Returns a snapshot that is not older than the cache TTL, loading or downloading one if needed.
    ///
    /// The cache-wide lock is held during the whole process, so that a single refresh can run at a time.
    pub async fn ensure_fresh(&self) -> Result<Arc<CacheSnapshot>, GatewayError> {
        let mut current = self.snapshot.lock().await;
        let now = Utc::now();

        if let Some(snapshot) = current.as_ref() {
            if snapshot.is_fresh(self.ttl, now) {
                return Ok(Arc::clone(snapshot));
            }
            log::info!("Address book snapshot from {} is stale", snapshot.generated_at());
        } else if let Some(snapshot) = self.load_from_file(now) {
            let snapshot = Arc::new(snapshot);
            *current = Some(Arc::clone(&snapshot));
            return Ok(snapshot);
        }

        let snapshot = Arc::new(self.refresh().await?);
        *current = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Downloads the directory from the server. Callers must hold the cache lock
    async fn refresh(&self) -> Result<CacheSnapshot, GatewayError> {
        log::info!("Refreshing the address book");
        let response = self.upstream.export_address_book().await
            .map_err(|err| GatewayError::AddressBook(err.to_string()))?;
        if response.is_success() == false {
            return Err(GatewayError::AddressBook(response.into_error().to_string()));
        }

        let entries = parse_directory(&response.body);
        let snapshot = CacheSnapshot::from_entries(&entries, Utc::now());
        log::info!("Address book refreshed: {} addresses for {} principals", snapshot.len(), entries.len());

        self.save_to_file(&snapshot);
        Ok(snapshot)
    }

    /// Loads the backing file, if it is valid, belongs to our account and is fresh enough
    fn load_from_file(&self, now: DateTime<Utc>) -> Option<CacheSnapshot> {
        let path = &self.backing_file;
        let file = match std::fs::File::open(path) {
            Err(err) => {
                log::debug!("No usable cache file {:?}: {}", path, err);
                return None;
            },
            Ok(f) => f,
        };

        let persisted: PersistedCache = match serde_json::from_reader(std::io::BufReader::new(file)) {
            Err(err) => {
                log::warn!("Invalid cache file {:?}: {}", path, err);
                return None;
            },
            Ok(data) => data,
        };

        if persisted.account != self.account {
            log::info!("Cache file {:?} belongs to another account, ignoring it", path);
            return None;
        }
        if is_fresh(persisted.generated_at, self.ttl, now) == false {
            log::info!("Cache file {:?} from {} is stale", path, persisted.generated_at);
            return None;
        }

        log::info!("Loaded the address book from {:?}", path);
        Some(persisted.into_snapshot())
    }

    /// Store a snapshot to the backing file. Failures are only logged
    fn save_to_file(&self, snapshot: &CacheSnapshot) {
        let path = &self.backing_file;
        if let Some(folder) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(folder) {
                log::warn!("Unable to create folder {:?}: {}", folder, err);
                return;
            }
        }

        let file = match std::fs::File::create(path) {
            Err(err) => {
                log::warn!("Unable to save file {:?}: {}", path, err);
                return;
            },
            Ok(f) => f,
        };

        if let Err(err) = serde_json::to_writer(file, &snapshot.to_persisted(&self.account)) {
            log::warn!("Unable to serialize: {}", err);
        };
    }

    /// Turns what a client asked for into an email address.
    ///
    /// Full addresses are returned as is (lower-cased), without checking they exist. Local-parts are looked up in the directory.
    pub async fn resolve_identifier(&self, raw: &str) -> Result<Option<String>, GatewayError> {
        let identifier = raw.trim().to_lowercase();
        if identifier.is_empty() {
            return Ok(None);
        }
        if identifier.contains('@') {
            return Ok(Some(identifier));
        }

        let snapshot = self.ensure_fresh().await?;
        Ok(snapshot.email_for_local_part(&identifier))
    }

    pub async fn uid_for_email(&self, email: &str) -> Result<Option<String>, GatewayError> {
        let snapshot = self.ensure_fresh().await?;
        Ok(snapshot.uid(email).map(|uid| uid.to_string()))
    }

    pub async fn primary_email_for_uid(&self, uid: &str) -> Result<Option<String>, GatewayError> {
        let snapshot = self.ensure_fresh().await?;
        Ok(snapshot.primary_email(uid).map(|email| email.to_string()))
    }

    pub async fn display_name_for_uid(&self, uid: &str) -> Result<Option<String>, GatewayError> {
        let snapshot = self.ensure_fresh().await?;
        Ok(snapshot.display_name(uid).map(|name| name.to_string()))
    }

    /// The canonical address of the account the gateway is configured with
    pub async fn own_email(&self) -> Result<Option<String>, GatewayError> {
        let snapshot = self.ensure_fresh().await?;
        if let Some(email) = snapshot.primary_email(&self.username) {
            return Ok(Some(email.to_string()));
        }

        let candidate = match self.resolve_identifier(&self.username).await? {
            None => return Ok(None),
            Some(email) => email,
        };
        match snapshot.uid(&candidate) {
            None => Ok(None),
            Some(uid) => Ok(snapshot.primary_email(uid).map(|email| email.to_string())),
        }
    }
}
