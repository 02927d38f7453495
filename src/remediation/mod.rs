/// Credential provider seam and key-directory provider
pub mod credentials;

/// Remote execution seam and ssh executor
pub mod executor;

/// Per-target remediation with an in-flight lock
pub mod dispatcher;

pub use credentials::{Credential, CredentialProvider, KeyDirectoryProvider};
pub use dispatcher::{RemediationDispatcher, RemediationRecord};
pub use executor::{ExecOutput, RemoteExecutor, SshExecutor};
