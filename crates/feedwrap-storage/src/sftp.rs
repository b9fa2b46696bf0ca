//! Blocking SFTP sessions over `ssh2`. Async callers run these on `spawn_blocking`.

use std::fs::File;
use std::io::{self, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ssh2::{ErrorCode, HashType, Session, Sftp};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// libssh2's `LIBSSH2_FX_NO_SUCH_FILE`.
const FX_NO_SUCH_FILE: i32 = 2;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to log in. Secrets are never stored here, only the names of
/// the environment variables that hold them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SftpEndpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub key_passphrase_env: Option<String>,
    /// Hex SHA-256 of the server host key. Unset accepts any key.
    #[serde(default)]
    pub host_key_sha256: Option<String>,
}

fn default_port() -> u16 {
    22
}

#[derive(Debug, Error)]
pub enum SftpError {
    #[error("connecting to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("credential variable {0} is not set")]
    MissingCredential(String),
    #[error("no password_env or key_path configured for {0}")]
    NoCredentials(String),
    #[error("host key of {host} is {actual}, expected {expected}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },
    #[error("ssh {operation} {}: {source}", .path.display())]
    Ssh {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: ssh2::Error,
    },
    #[error("copying {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn env_secret(var: &str) -> Result<String, SftpError> {
    std::env::var(var).map_err(|_| SftpError::MissingCredential(var.to_string()))
}

impl SftpEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks that the configured credential variables are present without connecting.
    pub fn check_credentials(&self) -> Result<(), SftpError> {
        match (&self.password_env, &self.key_path) {
            (None, None) => Err(SftpError::NoCredentials(self.address())),
            (Some(var), _) => env_secret(var).map(drop),
            (None, Some(_)) => match &self.key_passphrase_env {
                Some(var) => env_secret(var).map(drop),
                None => Ok(()),
            },
        }
    }

    pub fn connect(&self) -> Result<SftpSession, SftpError> {
        self.check_credentials()?;
        let address = self.address();
        let ssh_err = |operation, source| SftpError::Ssh {
            operation,
            path: PathBuf::from(&address),
            source,
        };

        let tcp = TcpStream::connect(&address).map_err(|source| SftpError::Connect {
            address: address.clone(),
            source,
        })?;
        let mut session = Session::new().map_err(|err| ssh_err("session", err))?;
        session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|err| ssh_err("handshake", err))?;
        self.verify_host_key(&session)?;

        if let Some(var) = &self.password_env {
            session
                .userauth_password(&self.user, &env_secret(var)?)
                .map_err(|err| ssh_err("password auth", err))?;
        } else if let Some(key) = &self.key_path {
            let passphrase = self
                .key_passphrase_env
                .as_deref()
                .map(env_secret)
                .transpose()?;
            session
                .userauth_pubkey_file(&self.user, None, key, passphrase.as_deref())
                .map_err(|err| ssh_err("key auth", err))?;
        }

        let sftp = session.sftp().map_err(|err| ssh_err("sftp subsystem", err))?;
        info!(%address, user = %self.user, "sftp session open");
        Ok(SftpSession {
            _session: session,
            sftp,
        })
    }

    fn verify_host_key(&self, session: &Session) -> Result<(), SftpError> {
        let actual = session
            .host_key_hash(HashType::Sha256)
            .map(hex::encode)
            .unwrap_or_default();
        match &self.host_key_sha256 {
            Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
                Err(SftpError::HostKeyMismatch {
                    host: self.address(),
                    expected: expected.clone(),
                    actual,
                })
            }
            Some(_) => Ok(()),
            None => {
                warn!(host = %self.address(), host_key = %actual, "host key not pinned; accepting");
                Ok(())
            }
        }
    }
}

/// Joins a remote directory and file name with `/`, whatever the local platform.
pub fn remote_join(dir: &str, name: &str) -> String {
    match dir.trim_end_matches('/') {
        "" => format!("/{name}"),
        trimmed => format!("{trimmed}/{name}"),
    }
}

pub struct SftpSession {
    // Keeps the ssh connection alive for as long as `sftp` is in use.
    _session: Session,
    sftp: Sftp,
}

impl SftpSession {
    /// Remote modification time, or `None` when the file does not exist.
    pub fn modified_at(&self, remote: &str) -> Result<Option<DateTime<Utc>>, SftpError> {
        match self.sftp.stat(Path::new(remote)) {
            Ok(stat) => Ok(stat
                .mtime
                .and_then(|secs| DateTime::from_timestamp(secs as i64, 0))),
            Err(err) if err.code() == ErrorCode::SFTP(FX_NO_SUCH_FILE) => Ok(None),
            Err(source) => Err(SftpError::Ssh {
                operation: "stat",
                path: PathBuf::from(remote),
                source,
            }),
        }
    }

    pub fn upload(&self, local: &Path, remote: &str) -> Result<u64, SftpError> {
        let mut src = File::open(local).map_err(|source| SftpError::Io {
            path: local.to_path_buf(),
            source,
        })?;
        let mut dst = self
            .sftp
            .create(Path::new(remote))
            .map_err(|source| SftpError::Ssh {
                operation: "create",
                path: PathBuf::from(remote),
                source,
            })?;
        let copied = io::copy(&mut src, &mut dst).and_then(|bytes| dst.flush().map(|()| bytes));
        copied.map_err(|source| SftpError::Io {
            path: PathBuf::from(remote),
            source,
        })
    }

    /// Copies `remote` to `dest` through a temp file beside it.
    pub fn download(&self, remote: &str, dest: &Path) -> Result<u64, SftpError> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let local_err = |path: &Path, source| SftpError::Io {
            path: path.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(parent).map_err(|source| local_err(parent, source))?;

        let mut src = self
            .sftp
            .open(Path::new(remote))
            .map_err(|source| SftpError::Ssh {
                operation: "open",
                path: PathBuf::from(remote),
                source,
            })?;
        let temp_path = parent.join(format!(".{}.download", Uuid::new_v4()));
        let copied = File::create(&temp_path).and_then(|mut file| {
            let bytes = io::copy(&mut src, &mut file)?;
            file.sync_all()?;
            Ok(bytes)
        });
        let bytes = match copied {
            Ok(bytes) => bytes,
            Err(source) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(local_err(&temp_path, source));
            }
        };
        if let Err(source) = std::fs::rename(&temp_path, dest) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(local_err(dest, source));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SftpEndpoint {
        serde_yaml::from_str("host: sftp.example.net\nuser: l_vendor\n").expect("yaml")
    }

    #[test]
    fn endpoint_defaults_to_port_22() {
        let endpoint = endpoint();
        assert_eq!(endpoint.port, 22);
        assert_eq!(endpoint.address(), "sftp.example.net:22");
    }

    #[test]
    fn credentials_must_be_configured_and_present() {
        let bare = endpoint();
        assert!(matches!(
            bare.check_credentials(),
            Err(SftpError::NoCredentials(_))
        ));

        let unset = SftpEndpoint {
            password_env: Some("FEEDWRAP_TEST_SFTP_PASSWORD_NOT_SET".to_string()),
            ..endpoint()
        };
        assert!(matches!(
            unset.connect(),
            Err(SftpError::MissingCredential(var)) if var == "FEEDWRAP_TEST_SFTP_PASSWORD_NOT_SET"
        ));

        let keyed = SftpEndpoint {
            key_path: Some(PathBuf::from("/home/feeds/.ssh/id_ed25519")),
            ..endpoint()
        };
        assert!(keyed.check_credentials().is_ok());
    }

    #[test]
    fn remote_paths_use_forward_slashes() {
        assert_eq!(remote_join("/files/", "amp.tsv.gz"), "/files/amp.tsv.gz");
        assert_eq!(remote_join("/files", "amp.tsv.gz"), "/files/amp.tsv.gz");
        assert_eq!(remote_join("/", "amp.tsv.gz"), "/amp.tsv.gz");
        assert_eq!(remote_join("", "amp.tsv.gz"), "/amp.tsv.gz");
    }
}
