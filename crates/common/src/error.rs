//! Error types for Mud.band

use thiserror::Error;

/// Result type alias using Mud.band Error
pub type Result<T> = std::result::Result<T, Error>;

/// Mud.band error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport failure or timeout talking to the control plane.
    #[error("Network error: {0}")]
    Network(String),

    /// The control plane answered with a non-success status.
    #[error("Control plane returned status {status}: {message}")]
    Protocol { status: i64, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    /// Credential could not be saved or read back.
    #[error("Credential error: {0}")]
    Auth(String),

    /// Operation attempted on an unenrolled or inactive band.
    #[error("Invalid state: {0}")]
    State(String),

    #[error("VPN permission denied")]
    PermissionDenied,

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Secondary authentication must be completed at `url` first.
    #[error("MFA authentication required: {url}")]
    MfaRequired { url: String },

    #[error("Enrollment failed during {phase}: {source}")]
    Enrollment {
        phase: EnrollmentPhase,
        #[source]
        source: Box<Error>,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Tag an error with the enrollment phase it came from.
    pub fn in_phase(self, phase: EnrollmentPhase) -> Self {
        match self {
            // Keep the innermost phase if a nested flow already tagged it.
            Error::Enrollment { .. } => self,
            other => Error::Enrollment {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The failing enrollment phase, if any.
    pub fn phase(&self) -> Option<EnrollmentPhase> {
        match self {
            Error::Enrollment { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Whether the error is worth showing with a retry affordance.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Enrollment { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

/// Step of the anonymous band create-and-enroll flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentPhase {
    CreateBand,
    SaveAdmin,
    IssueToken,
    Join,
}

impl std::fmt::Display for EnrollmentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnrollmentPhase::CreateBand => write!(f, "create_band"),
            EnrollmentPhase::SaveAdmin => write!(f, "save_admin"),
            EnrollmentPhase::IssueToken => write!(f, "issue_token"),
            EnrollmentPhase::Join => write!(f, "join"),
        }
    }
}
