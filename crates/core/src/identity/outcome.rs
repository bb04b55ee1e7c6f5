//! How the host authenticator established who is logging in.

use serde::Serialize;

/// Result of the host's authentication step, reduced to what attribute
/// mapping needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthOutcome {
    /// The federation front end asserted a remote user for this request.
    RemoteUser { name: String },
    /// The principal was already logged in; nothing is re-evaluated.
    ExistingSession { name: String },
    /// Password login handled entirely by the host.
    LocalLogin { name: String },
    /// No principal could be established.
    Anonymous,
}

impl AuthOutcome {
    /// Build the outcome for a request carrying an optional remote user.
    /// Blank names count as absent.
    pub fn from_remote_user(remote_user: Option<&str>) -> Self {
        match remote_user.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => Self::RemoteUser {
                name: name.to_string(),
            },
            None => Self::Anonymous,
        }
    }

    pub fn principal_name(&self) -> Option<&str> {
        match self {
            Self::RemoteUser { name }
            | Self::ExistingSession { name }
            | Self::LocalLogin { name } => Some(name),
            Self::Anonymous => None,
        }
    }

    /// Whether attribute mapping and reconciliation apply to this login.
    pub fn is_federated(&self) -> bool {
        matches!(self, Self::RemoteUser { .. })
    }
}
