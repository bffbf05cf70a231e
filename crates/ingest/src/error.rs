use std::fmt;

#[derive(Debug)]
pub enum ParseError {
    Truncated { framing: &'static str, need: usize, got: usize },
    BadJson(serde_json::Error),
    MissingField(&'static str),
    BadAddress(String),
    BadTimeRange { start: i64, end: i64 },
    UnsupportedVersion(u16),
}

impl ParseError {
    /// Stable reason tag used for drop counters.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::BadJson(_) => "bad_json",
            Self::MissingField(_) => "missing_field",
            Self::BadAddress(_) => "bad_address",
            Self::BadTimeRange { .. } => "bad_time_range",
            Self::UnsupportedVersion(_) => "unsupported_version",
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { framing, need, got } => {
                write!(f, "{} frame truncated: need {} bytes, got {}", framing, need, got)
            }
            Self::BadJson(err) => write!(f, "malformed json: {}", err),
            Self::MissingField(field) => write!(f, "missing field: {}", field),
            Self::BadAddress(raw) => write!(f, "bad address: {}", raw),
            Self::BadTimeRange { start, end } => {
                write!(f, "bad time range: start {} end {}", start, end)
            }
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported framing version: {}", version)
            }
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BadJson(err) => Some(err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(value: serde_json::Error) -> Self {
        Self::BadJson(value)
    }
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;
