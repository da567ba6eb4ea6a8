/// Cookie jars: the persistence medium behind cookie token stores and PKCE state
use crate::error::{AuthError, Result};
use fs2::FileExt;
use keyring::Entry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Storage interface for cookies
///
/// A jar is "browser-like": it is shared by every tab (or process) of the
/// client, so a write made by one of them is visible to the others on their
/// next read.
pub trait CookieJar: Send + Sync {
    /// Get a cookie value, ignoring expired cookies
    fn get(&self, name: &str) -> Result<Option<String>>;

    /// Set a cookie, optionally expiring after `max_age`
    ///
    /// Jars that cannot write in the current context return
    /// [`AuthError::CookieWriteUnavailable`].
    fn set(&self, name: &str, value: &str, max_age: Option<Duration>) -> Result<()>;

    /// Delete a cookie
    fn delete(&self, name: &str) -> Result<()>;

    fn set_or_delete(&self, name: &str, value: Option<&str>, max_age: Option<Duration>) -> Result<()> {
        match value {
            Some(value) => self.set(name, value, max_age),
            None => self.delete(name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCookie {
    value: String,
    #[serde(default)]
    expires_at: Option<u64>,
}

impl StoredCookie {
    fn new(value: &str, max_age: Option<Duration>) -> Self {
        Self {
            value: value.to_string(),
            expires_at: max_age.map(|age| now_secs() + age.as_secs()),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| now_secs() >= at)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// In-memory cookie jar
///
/// Clones share the same cookies, which makes it suitable for simulating
/// several tabs of one browser in tests. Writes can be switched off to mimic
/// contexts where cookie writes silently fail (server rendering).
#[derive(Debug, Default, Clone)]
pub struct MemoryCookieJar {
    cookies: Arc<RwLock<HashMap<String, StoredCookie>>>,
    read_only: Arc<AtomicBool>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail with [`AuthError::CookieWriteUnavailable`]
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(AuthError::CookieWriteUnavailable);
        }
        Ok(())
    }
}

impl CookieJar for MemoryCookieJar {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let cookies = self.cookies.read();
        Ok(cookies
            .get(name)
            .filter(|cookie| !cookie.is_expired())
            .map(|cookie| cookie.value.clone()))
    }

    fn set(&self, name: &str, value: &str, max_age: Option<Duration>) -> Result<()> {
        self.ensure_writable()?;
        let mut cookies = self.cookies.write();
        cookies.insert(name.to_string(), StoredCookie::new(value, max_age));
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let mut cookies = self.cookies.write();
        cookies.remove(name);
        Ok(())
    }
}

/// File-backed cookie jar shared between processes
///
/// Cookies live in a single JSON file. Reads take a shared lock and writes an
/// exclusive lock on a sidecar lock file, so concurrent processes never see a
/// half-written jar.
#[derive(Debug, Clone)]
pub struct FileCookieJar {
    base_path: PathBuf,
}

impl FileCookieJar {
    /// Create a jar for an application
    ///
    /// Respects `$XDG_DATA_HOME`, falling back to the platform data directory.
    /// The jar is stored in `<data_dir>/<app_name>/cookies.json`.
    pub fn new(app_name: &str) -> Result<Self> {
        let base_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(xdg_data)
        } else {
            dirs::data_dir()
                .ok_or_else(|| AuthError::Storage("Could not determine data directory".into()))?
        };

        Self::with_path(base_dir.join(app_name))
    }

    /// Create a jar in a custom directory
    pub fn with_path(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path)?;
        Ok(Self { base_path: path })
    }

    fn jar_path(&self) -> PathBuf {
        self.base_path.join("cookies.json")
    }

    fn lock(&self, exclusive: bool) -> Result<JarLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.base_path.join("cookies.lock"))?;

        if exclusive {
            file.lock_exclusive()?;
        } else {
            file.lock_shared()?;
        }
        Ok(JarLock { file })
    }

    fn load(&self) -> Result<HashMap<String, StoredCookie>> {
        let path = self.jar_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let content = fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&content)
            .map_err(|e| AuthError::Storage(format!("Failed to parse cookie jar: {}", e)))
    }

    fn save(&self, cookies: &HashMap<String, StoredCookie>) -> Result<()> {
        let content = serde_json::to_string_pretty(cookies)?;
        let tmp = self.base_path.join("cookies.json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(tmp, self.jar_path())?;
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut HashMap<String, StoredCookie>)) -> Result<()> {
        let _lock = self.lock(true)?;
        let mut cookies = self.load()?;
        cookies.retain(|_, cookie| !cookie.is_expired());
        f(&mut cookies);
        self.save(&cookies)
    }
}

impl CookieJar for FileCookieJar {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let _lock = self.lock(false)?;
        let cookies = self.load()?;
        Ok(cookies
            .get(name)
            .filter(|cookie| !cookie.is_expired())
            .map(|cookie| cookie.value.clone()))
    }

    fn set(&self, name: &str, value: &str, max_age: Option<Duration>) -> Result<()> {
        self.modify(|cookies| {
            cookies.insert(name.to_string(), StoredCookie::new(value, max_age));
        })
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.modify(|cookies| {
            cookies.remove(name);
        })
    }
}

/// Advisory lock on the jar, released on drop
struct JarLock {
    file: File,
}

impl Drop for JarLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Cookie jar kept in the OS credential manager
///
/// - macOS: Keychain
/// - Windows: Credential Manager
/// - Linux: Secret Service API
///
/// The whole jar is stored as one JSON credential.
#[derive(Debug, Clone)]
pub struct KeyringCookieJar {
    app_name: String,
}

impl KeyringCookieJar {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry> {
        let service = format!("sitzung-{}", self.app_name);
        Entry::new(&service, "cookie-jar")
            .map_err(|e| AuthError::Storage(format!("Failed to create keyring entry: {}", e)))
    }

    fn load(&self) -> Result<HashMap<String, StoredCookie>> {
        match self.entry()?.get_password() {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| AuthError::Storage(format!("Failed to parse cookie jar: {}", e))),
            Err(keyring::Error::NoEntry) => Ok(HashMap::new()),
            Err(e) => Err(AuthError::Storage(format!(
                "Failed to read cookie jar from keyring: {}",
                e
            ))),
        }
    }

    fn save(&self, cookies: &HashMap<String, StoredCookie>) -> Result<()> {
        let json = serde_json::to_string(cookies)?;
        self.entry()?
            .set_password(&json)
            .map_err(|e| AuthError::Storage(format!("Failed to save cookie jar to keyring: {}", e)))
    }
}

impl CookieJar for KeyringCookieJar {
    fn get(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .load()?
            .get(name)
            .filter(|cookie| !cookie.is_expired())
            .map(|cookie| cookie.value.clone()))
    }

    fn set(&self, name: &str, value: &str, max_age: Option<Duration>) -> Result<()> {
        let mut cookies = self.load()?;
        cookies.insert(name.to_string(), StoredCookie::new(value, max_age));
        self.save(&cookies)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let mut cookies = self.load()?;
        if cookies.remove(name).is_some() {
            self.save(&cookies)?;
        }
        Ok(())
    }
}

/// Parse a `Cookie` request header into name/value pairs
///
/// The first occurrence of a name wins. Values are percent-decoded and
/// surrounding double quotes are removed.
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in header.split(';') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        let value = urlencoding::decode(value)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| value.to_string());

        cookies.entry(name.to_string()).or_insert(value);
    }
    cookies
}
