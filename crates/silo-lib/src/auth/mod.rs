//! Account credential storage and the vendor login call.
//!
//! Credentials unlock mod-portal and engine downloads. They are kept
//! in `credentials.json` under the config directory with restrictive
//! permissions; the capture flow itself lives in the CLI.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const LOGIN_URL: &str = "https://auth.factorio.com/api-login";

const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub factorio_username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub factorio_token: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.factorio_username.is_empty() && !self.factorio_token.is_empty()
    }
}

pub struct CredentialStore {
    config_dir: PathBuf,
}

impl CredentialStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// The default credentials file under the platform config dir.
    pub fn default_location() -> Result<PathBuf> {
        let config = dirs::config_dir().context("platform config directory unavailable")?;
        Ok(config.join("siloctl").join(CREDENTIALS_FILE))
    }

    fn path(&self) -> PathBuf {
        self.config_dir.join(CREDENTIALS_FILE)
    }

    pub fn load(&self) -> Result<Credentials> {
        let path = self.path();
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                bail!("no credentials found")
            }
            Err(err) => return Err(err).with_context(|| format!("reading credentials {:?}", path)),
        };
        serde_json::from_str(&data).with_context(|| format!("parsing credentials {:?}", path))
    }

    pub fn save(&self, creds: &Credentials) -> Result<()> {
        fs::create_dir_all(&self.config_dir)
            .with_context(|| format!("creating config directory {:?}", self.config_dir))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.config_dir, fs::Permissions::from_mode(0o700))
                .context("restricting config directory permissions")?;
        }

        let data = serde_json::to_string_pretty(creds).context("encoding credentials")?;
        let path = self.path();
        fs::write(&path, data).with_context(|| format!("writing credentials {:?}", path))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .context("restricting credentials file permissions")?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("removing credentials file"),
        }
    }
}

/// Load credentials from the base directory's config, falling back to
/// the default platform location. Returns `None` when neither holds a
/// complete credential pair.
pub fn load_with_fallback(base_dir: &Path) -> Option<Credentials> {
    let store = CredentialStore::new(base_dir.join("config"));
    if let Ok(creds) = store.load() {
        if creds.is_complete() {
            return Some(creds);
        }
    }

    let default_path = CredentialStore::default_location().ok()?;
    let store = CredentialStore::new(default_path.parent()?);
    store.load().ok().filter(Credentials::is_complete)
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Exchange account username and password for an API token.
pub async fn authenticate(username: &str, password: &str) -> Result<String> {
    let client = crate::sources::http_client(std::time::Duration::from_secs(30))?;
    let response = client
        .post(LOGIN_URL)
        .form(&[
            ("username", username),
            ("password", password),
            ("api_version", "6"),
        ])
        .send()
        .await
        .context("contacting login API")?;

    let login: LoginResponse = response.json().await.context("parsing login response")?;
    if !login.error.is_empty() {
        bail!("authentication failed: {} - {}", login.error, login.message);
    }
    if login.token.is_empty() {
        bail!("no token received from the login API");
    }
    Ok(login.token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_round_trips() {
        let tmp = tempdir().unwrap();
        let store = CredentialStore::new(tmp.path().join("config"));

        let creds = Credentials {
            factorio_username: "player".to_string(),
            factorio_token: "tok123".to_string(),
        };
        store.save(&creds).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.factorio_username, "player");
        assert_eq!(loaded.factorio_token, "tok123");
        assert!(loaded.is_complete());
    }

    #[test]
    fn missing_credentials_error() {
        let tmp = tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("no credentials found"));
    }

    #[test]
    fn clear_is_idempotent() {
        let tmp = tempdir().unwrap();
        let store = CredentialStore::new(tmp.path());
        store.clear().unwrap();
        store
            .save(&Credentials {
                factorio_username: "p".to_string(),
                factorio_token: "t".to_string(),
            })
            .unwrap();
        store.clear().unwrap();
        assert!(store.load().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn credentials_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempdir().unwrap();
        let config_dir = tmp.path().join("config");
        let store = CredentialStore::new(&config_dir);
        store
            .save(&Credentials {
                factorio_username: "p".to_string(),
                factorio_token: "t".to_string(),
            })
            .unwrap();

        let file_mode = std::fs::metadata(config_dir.join("credentials.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(&config_dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
