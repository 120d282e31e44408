//! Reply classification.

use std::fmt;

/// Status of a reply, carried in the message's `type` property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    /// `"200"`: the body holds the requested data
    Ok,
    /// `"404"`: the entity does not exist
    NotFound,
    /// Anything else, including a missing status
    Other(Option<String>),
}

impl ReplyStatus {
    /// Classify the raw `type` property of a reply.
    #[must_use]
    pub fn parse(kind: Option<&str>) -> Self {
        match kind {
            Some("200") => Self::Ok,
            Some("404") => Self::NotFound,
            other => Self::Other(other.map(str::to_string)),
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("200"),
            Self::NotFound => f.write_str("404"),
            Self::Other(Some(status)) => f.write_str(status),
            Self::Other(None) => f.write_str("<missing>"),
        }
    }
}

/// The single result delivered to a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The decoded reply body
    Success(String),
    /// The remote side has no such entity
    NotFound,
    /// The remote side failed, or its reply was undecodable
    Failure(String),
}

impl ResponseOutcome {
    /// Failure for a reply carrying an unrecognised status.
    #[must_use]
    pub fn unexpected_status(status: &ReplyStatus) -> Self {
        Self::Failure(format!("unexpected status {status}"))
    }

    /// Label used for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::NotFound => "not_found",
            Self::Failure(_) => "failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_statuses() {
        assert_eq!(ReplyStatus::parse(Some("200")), ReplyStatus::Ok);
        assert_eq!(ReplyStatus::parse(Some("404")), ReplyStatus::NotFound);
        assert_eq!(
            ReplyStatus::parse(Some("500")),
            ReplyStatus::Other(Some("500".to_string()))
        );
        assert_eq!(ReplyStatus::parse(None), ReplyStatus::Other(None));
    }

    #[test]
    fn unexpected_status_keeps_raw_value() {
        let outcome = ResponseOutcome::unexpected_status(&ReplyStatus::parse(Some("503")));
        assert_eq!(outcome, ResponseOutcome::Failure("unexpected status 503".to_string()));
    }
}
