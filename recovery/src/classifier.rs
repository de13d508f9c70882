//! Error classification for retry decisions
//!
//! Errors from the backend client arrive without a shared type hierarchy, so
//! every error is first projected into an [`ErrorDescriptor`] through the
//! [`ErrorShape`] trait. A recognized error code (SQLSTATE, PostgREST, errno)
//! decides the class outright; otherwise the ordered keyword table is matched
//! together with the HTTP status.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Taxonomy tag assigned once per failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Database,
    Validation,
    Unknown,
}

/// Match order for the keyword rules. First match wins.
const RULE_ORDER: [ErrorClassification; 6] = [
    ErrorClassification::Network,
    ErrorClassification::Timeout,
    ErrorClassification::Authentication,
    ErrorClassification::Authorization,
    ErrorClassification::Database,
    ErrorClassification::Validation,
];

impl ErrorClassification {
    /// Returns every classification, `Unknown` last.
    pub fn all() -> &'static [ErrorClassification] {
        &[
            ErrorClassification::Network,
            ErrorClassification::Timeout,
            ErrorClassification::Authentication,
            ErrorClassification::Authorization,
            ErrorClassification::Database,
            ErrorClassification::Validation,
            ErrorClassification::Unknown,
        ]
    }

    /// Returns the lowercase tag used in logs and configuration.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClassification::Network => "network",
            ErrorClassification::Timeout => "timeout",
            ErrorClassification::Authentication => "authentication",
            ErrorClassification::Authorization => "authorization",
            ErrorClassification::Database => "database",
            ErrorClassification::Validation => "validation",
            ErrorClassification::Unknown => "unknown",
        }
    }

    /// Whether the default retry policy retries this class.
    ///
    /// Permission and input errors cannot succeed without an external change,
    /// and unknown errors are not worth guessing about.
    pub fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            ErrorClassification::Network
                | ErrorClassification::Timeout
                | ErrorClassification::Database
                | ErrorClassification::Authentication
        )
    }

    /// Short message suitable for showing to the person using the UI.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorClassification::Network => {
                "Unable to connect. Please check your internet connection."
            }
            ErrorClassification::Timeout => "The request took too long. Please try again.",
            ErrorClassification::Authentication => {
                "Your session has expired. Please sign in again."
            }
            ErrorClassification::Authorization => {
                "You do not have permission to perform this action."
            }
            ErrorClassification::Database => {
                "A server error occurred while saving or loading data. Please try again shortly."
            }
            ErrorClassification::Validation => "Some of the information provided is invalid.",
            ErrorClassification::Unknown => "An unexpected error occurred.",
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClassification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ErrorClassification::all()
            .iter()
            .copied()
            .find(|class| class.as_str() == needle)
            .ok_or_else(|| format!("unknown error classification '{s}'"))
    }
}

/// Normalized projection of an arbitrary error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorDescriptor {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Projects an error into the shape the classifier understands.
pub trait ErrorShape {
    fn descriptor(&self) -> ErrorDescriptor;

    /// Cause chain or backtrace, if the error type has one.
    fn stack_trace(&self) -> Option<String> {
        None
    }
}

/// Concrete error for backend calls that only have a message, code, and status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct OperationError {
    pub message: String,
    pub code: Option<String>,
    pub status: Option<u16>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl ErrorShape for OperationError {
    fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            message: self.message.clone(),
            code: self.code.clone(),
            status: self.status,
        }
    }
}

impl ErrorShape for std::io::Error {
    fn descriptor(&self) -> ErrorDescriptor {
        use std::io::ErrorKind;

        let code = match self.kind() {
            ErrorKind::TimedOut => Some("ETIMEDOUT"),
            ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
            ErrorKind::ConnectionReset => Some("ECONNRESET"),
            ErrorKind::ConnectionAborted => Some("ECONNABORTED"),
            ErrorKind::NotConnected => Some("ENOTCONN"),
            ErrorKind::PermissionDenied => Some("EACCES"),
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Some("EINVAL"),
            _ => None,
        };
        ErrorDescriptor {
            message: self.to_string(),
            code: code.map(String::from),
            status: None,
        }
    }

    fn stack_trace(&self) -> Option<String> {
        cause_chain(self)
    }
}

impl ErrorShape for reqwest::Error {
    fn descriptor(&self) -> ErrorDescriptor {
        let code = if self.is_timeout() {
            Some("ETIMEDOUT")
        } else if self.is_connect() {
            Some("ECONNECT")
        } else if self.is_decode() || self.is_body() {
            Some("EINVAL")
        } else {
            None
        };
        ErrorDescriptor {
            message: self.to_string(),
            code: code.map(String::from),
            status: self.status().map(|s| s.as_u16()),
        }
    }

    fn stack_trace(&self) -> Option<String> {
        cause_chain(self)
    }
}

impl ErrorShape for anyhow::Error {
    fn descriptor(&self) -> ErrorDescriptor {
        let mut descriptor = if let Some(op) = self.downcast_ref::<OperationError>() {
            op.descriptor()
        } else if let Some(http) = self.downcast_ref::<reqwest::Error>() {
            http.descriptor()
        } else if let Some(io) = self.downcast_ref::<std::io::Error>() {
            io.descriptor()
        } else {
            ErrorDescriptor::default()
        };
        // Keep context layers in the message so keywords added via
        // `.context(...)` still count.
        descriptor.message = format!("{self:#}");
        descriptor
    }

    fn stack_trace(&self) -> Option<String> {
        let chain: Vec<String> = self.chain().skip(1).map(ToString::to_string).collect();
        if chain.is_empty() {
            None
        } else {
            Some(chain.join("\n  caused by: "))
        }
    }
}

fn cause_chain(err: &dyn std::error::Error) -> Option<String> {
    let mut lines = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(cause.to_string());
        source = cause.source();
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n  caused by: "))
    }
}

/// Ordered keyword rules, one list per classification.
///
/// Keywords are stored lowercase and matched as substrings of the lowercased
/// error message. `Unknown` never has keywords.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordTable {
    rules: BTreeMap<ErrorClassification, Vec<String>>,
}

impl Default for KeywordTable {
    fn default() -> Self {
        Self::empty()
            .with_keywords(
                ErrorClassification::Network,
                [
                    "network",
                    "failed to fetch",
                    "fetch failed",
                    "connection",
                    "econnrefused",
                    "econnreset",
                    "enotfound",
                    "offline",
                    "unreachable",
                    "socket hang up",
                ],
            )
            .with_keywords(
                ErrorClassification::Timeout,
                ["timeout", "timed out", "etimedout", "deadline exceeded"],
            )
            .with_keywords(
                ErrorClassification::Authentication,
                [
                    "jwt",
                    "token",
                    "unauthorized",
                    "unauthenticated",
                    "not authenticated",
                    "session",
                    "invalid login",
                    "invalid credentials",
                    "expired",
                ],
            )
            .with_keywords(
                ErrorClassification::Authorization,
                [
                    "permission",
                    "forbidden",
                    "not authorized",
                    "access denied",
                    "insufficient privilege",
                    "row-level security",
                    "not allowed",
                ],
            )
            .with_keywords(
                ErrorClassification::Database,
                [
                    "database",
                    "sql",
                    "query",
                    "relation",
                    "column",
                    "postgres",
                    "pgrst",
                    "deadlock",
                    "duplicate key",
                    "constraint",
                ],
            )
            .with_keywords(
                ErrorClassification::Validation,
                [
                    "invalid",
                    "validation",
                    "required",
                    "malformed",
                    "must be",
                    "bad request",
                    "missing",
                ],
            )
    }
}

impl KeywordTable {
    /// Table with no keywords; only structured codes will classify.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Replaces the keyword list for `class`.
    pub fn with_keywords<I, S>(mut self, class: ErrorClassification, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_keywords(class, keywords);
        self
    }

    pub fn set_keywords<I, S>(&mut self, class: ErrorClassification, keywords: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if class == ErrorClassification::Unknown {
            return;
        }
        let normalized = keywords
            .into_iter()
            .map(|k| k.into().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        self.rules.insert(class, normalized);
    }

    pub fn keywords(&self, class: ErrorClassification) -> &[String] {
        self.rules.get(&class).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the first keyword of `class` found in an already-lowercased message.
    fn matching_keyword(&self, class: ErrorClassification, message: &str) -> Option<&str> {
        self.keywords(class)
            .iter()
            .find(|k| message.contains(k.as_str()))
            .map(String::as_str)
    }
}

/// Maps errors to an [`ErrorClassification`]. Pure and deterministic.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    keywords: KeywordTable,
}

impl ErrorClassifier {
    pub fn new(keywords: KeywordTable) -> Self {
        Self { keywords }
    }

    pub fn keywords(&self) -> &KeywordTable {
        &self.keywords
    }

    pub fn classify<E: ErrorShape + ?Sized>(&self, error: &E) -> ErrorClassification {
        self.classify_descriptor(&error.descriptor())
    }

    pub fn classify_descriptor(&self, descriptor: &ErrorDescriptor) -> ErrorClassification {
        // A recognized error code names the failure exactly; message text
        // such as "violates unique constraint" must not override it.
        if let Some(class) = descriptor.code.as_deref().and_then(classify_code) {
            return class;
        }

        let message = descriptor.message.to_lowercase();
        let by_status = descriptor.status.and_then(classify_status);

        for class in RULE_ORDER {
            if by_status == Some(class) {
                return class;
            }
            if let Some(keyword) = self.keywords.matching_keyword(class, &message) {
                tracing::trace!(%class, keyword, "classified by keyword");
                return class;
            }
        }
        ErrorClassification::Unknown
    }
}

fn classify_code(code: &str) -> Option<ErrorClassification> {
    use ErrorClassification::*;

    let code = code.trim().to_ascii_uppercase();
    if code.is_empty() {
        return None;
    }

    // PostgREST: PGRST30x are JWT problems, the rest are query/schema errors.
    if let Some(rest) = code.strip_prefix("PGRST") {
        return Some(if rest.starts_with("30") {
            Authentication
        } else {
            Database
        });
    }

    const NETWORK_CODES: [&str; 6] = [
        "ECONN",
        "ENOTCONN",
        "ENOTFOUND",
        "EAI_AGAIN",
        "ENETUNREACH",
        "EHOSTUNREACH",
    ];
    if NETWORK_CODES.iter().any(|prefix| code.starts_with(prefix)) {
        return Some(Network);
    }
    match code.as_str() {
        "ETIMEDOUT" | "ESOCKETTIMEDOUT" => return Some(Timeout),
        "EACCES" | "EPERM" => return Some(Authorization),
        "EINVAL" => return Some(Validation),
        _ => {}
    }

    // Postgres SQLSTATE
    if code.len() == 5 && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Some(match code.as_str() {
            "42501" => Authorization,
            "57014" => Timeout,
            c if c.starts_with("08") => Network,
            c if c.starts_with("28") => Authentication,
            c if c.starts_with("22") || c.starts_with("23") => Validation,
            _ => Database,
        });
    }

    None
}

fn classify_status(status: u16) -> Option<ErrorClassification> {
    use ErrorClassification::*;

    match status {
        401 => Some(Authentication),
        403 => Some(Authorization),
        408 | 504 => Some(Timeout),
        400 | 422 => Some(Validation),
        502 | 503 => Some(Network),
        500..=599 => Some(Database),
        _ => None,
    }
}
