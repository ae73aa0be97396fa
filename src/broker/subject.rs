//! Subject grammar and pattern matching.
//!
//! Subjects are dot-separated tokens. Patterns additionally allow `*`
//! (exactly one token) and `>` (the remaining tail, last token only).
//! The channel broker matches on the subscriber side with these rules;
//! the registry uses them to validate listener patterns at registration.

use thiserror::Error;

/// Errors raised for malformed subjects or patterns.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubjectError {
    #[error("subject is empty")]
    Empty,

    #[error("subject '{0}' contains an empty token")]
    EmptyToken(String),

    #[error("subject '{0}' contains whitespace")]
    Whitespace(String),

    #[error("wildcard '{1}' not allowed in concrete subject '{0}'")]
    WildcardInSubject(String, char),

    #[error("'>' must be the last token in pattern '{0}'")]
    TailNotLast(String),
}

/// Validate a concrete (publishable) subject: no wildcards allowed.
pub fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    validate_tokens(subject)?;
    for token in subject.split('.') {
        if token == "*" {
            return Err(SubjectError::WildcardInSubject(subject.to_string(), '*'));
        }
        if token == ">" {
            return Err(SubjectError::WildcardInSubject(subject.to_string(), '>'));
        }
    }
    Ok(())
}

/// Validate a subscription pattern: `*` anywhere, `>` only as last token.
pub fn validate_pattern(pattern: &str) -> Result<(), SubjectError> {
    validate_tokens(pattern)?;
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if *token == ">" && i != tokens.len() - 1 {
            return Err(SubjectError::TailNotLast(pattern.to_string()));
        }
    }
    Ok(())
}

fn validate_tokens(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() {
        return Err(SubjectError::Empty);
    }
    if subject.chars().any(char::is_whitespace) {
        return Err(SubjectError::Whitespace(subject.to_string()));
    }
    if subject.split('.').any(str::is_empty) {
        return Err(SubjectError::EmptyToken(subject.to_string()));
    }
    Ok(())
}

/// Check whether a concrete subject matches a subscription pattern.
///
/// `*` matches exactly one token; `>` matches one or more trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (Some(_), Some(_)) => return false,
            (None, None) => return true,
            // '>' requires at least one remaining token
            (Some(_), None) | (None, Some(_)) => return false,
        }
    }
}
