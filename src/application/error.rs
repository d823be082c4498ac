use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    application::pagination::PaginationError, cache::ResolveError, config::LoadError,
    infra::error::InfraError,
};

/// Top-level failure reported by the binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Pagination(#[from] PaginationError),
    #[error("cache probe failed: {0}")]
    Probe(String),
}

impl AppError {
    pub fn probe(message: impl Into<String>) -> Self {
        Self::Probe(message.into())
    }

    /// The error and each of its sources, outermost first.
    pub fn messages(&self) -> Vec<String> {
        let mut messages = vec![self.to_string()];
        let mut current = self.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_walk_the_source_chain() {
        let err = AppError::from(InfraError::from(std::io::Error::other("stdout closed")));
        let messages = err.messages();
        assert_eq!(messages[0], "io error: stdout closed");
        assert!(messages.iter().any(|m| m == "stdout closed"));
    }
}
