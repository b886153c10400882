// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Validated job identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

const MAX_JOB_ID_LEN: usize = 64;

/// Validated job identifier.
/// Must be non-empty, alphanumeric with hyphens/underscores/dots, max 64 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Create a new JobId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidJobId {
                id,
                reason: "Job ID cannot be empty".to_string(),
            });
        }

        if id.len() > MAX_JOB_ID_LEN {
            let reason = format!("Job ID too long: {} chars (max {})", id.len(), MAX_JOB_ID_LEN);
            return Err(HardValidationError::InvalidJobId { id, reason });
        }

        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(HardValidationError::InvalidJobId {
                id,
                reason: "Job ID must contain only alphanumeric characters, hyphens, underscores and dots".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for JobId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}
