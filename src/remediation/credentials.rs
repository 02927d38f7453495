use crate::error::CredentialError;
use std::path::{Path, PathBuf};

/// Remote-access credential resolved for one remediation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub reference: String,
    /// Private key handed to the remote execution channel
    pub identity_file: PathBuf,
}

/// Supplies remote-access credentials by reference
#[cfg_attr(test, mockall::automock)]
pub trait CredentialProvider: Send + Sync {
    fn get(&self, reference: &str) -> Result<Credential, CredentialError>;
}

/// Resolves a reference to a key file inside one directory
#[derive(Debug, Clone)]
pub struct KeyDirectoryProvider {
    key_dir: PathBuf,
}

impl KeyDirectoryProvider {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
        }
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }
}

impl CredentialProvider for KeyDirectoryProvider {
    fn get(&self, reference: &str) -> Result<Credential, CredentialError> {
        // References name a file directly inside the key directory
        let is_plain_name = !reference.is_empty()
            && reference != "."
            && reference != ".."
            && !reference.contains(['/', '\\']);
        if !is_plain_name {
            return Err(CredentialError::Unusable {
                reference: reference.to_string(),
                message: "reference must be a plain file name".to_string(),
            });
        }

        let path = self.key_dir.join(reference);
        match std::fs::metadata(&path) {
            Ok(metadata) if metadata.is_file() => Ok(Credential {
                reference: reference.to_string(),
                identity_file: path,
            }),
            Ok(_) => Err(CredentialError::Unusable {
                reference: reference.to_string(),
                message: format!("{} is not a file", path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CredentialError::NotFound(reference.to_string()))
            }
            Err(e) => Err(CredentialError::Unusable {
                reference: reference.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
