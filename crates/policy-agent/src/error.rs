use std::fmt;

#[derive(Debug)]
pub enum AgentError {
    ArtifactMissing(String),
    BadArtifact(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArtifactMissing(path) => write!(f, "policy artifact missing: {}", path),
            Self::BadArtifact(message) => write!(f, "bad policy artifact: {}", message),
        }
    }
}

impl std::error::Error for AgentError {}
