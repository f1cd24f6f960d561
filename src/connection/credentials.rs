//! Identity-file based credential resolution.

use camino::Utf8PathBuf;

use super::types::{ConnectionError, CredentialResolver, Credentials, HostSpec};

/// Resolves credentials from the host's configured identity file.
///
/// Hosts without an identity file resolve to empty credentials so the SSH
/// client falls back to its agent and default key locations.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityFileResolver;

impl CredentialResolver for IdentityFileResolver {
    fn resolve(&self, host: &HostSpec) -> Result<Credentials, ConnectionError> {
        let Some(raw) = host.identity_file.as_deref() else {
            return Ok(Credentials::default());
        };

        if raw.trim().is_empty() {
            return Err(ConnectionError::Auth {
                host: host.to_string(),
                message: String::from("identity file path is empty"),
            });
        }

        let expanded = Utf8PathBuf::from(expand_tilde(raw));
        if !expanded.is_file() {
            return Err(ConnectionError::Auth {
                host: host.to_string(),
                message: format!("identity file {expanded} not found"),
            });
        }

        Ok(Credentials {
            identity_file: Some(expanded),
        })
    }
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is unset the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use playrun::connection::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/id_ed25519"), format!("{home}/.ssh/id_ed25519"));
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}
