//! Article drafts and the rules a draft must satisfy before it reaches the store.

use serde::{Deserialize, Serialize};

use super::error::DomainError;

const TITLE_MAX_CHARS: usize = 200;
const SUMMARY_MAX_CHARS: usize = 500;
const CATEGORY_MAX_CHARS: usize = 64;

/// Editable fields of an article as submitted by the admin UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleDraft {
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub category: Option<String>,
}

impl ArticleDraft {
    /// Trim the draft and enforce the field constraints.
    ///
    /// Violations are permanent failures: retrying the same draft can never succeed.
    pub fn normalize(self) -> Result<Self, DomainError> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(DomainError::validation("title", "is required"));
        }
        if title.chars().count() > TITLE_MAX_CHARS {
            return Err(DomainError::validation(
                "title",
                format!("must be at most {TITLE_MAX_CHARS} characters"),
            ));
        }

        let summary = self.summary.trim().to_string();
        if summary.chars().count() > SUMMARY_MAX_CHARS {
            return Err(DomainError::validation(
                "summary",
                format!("must be at most {SUMMARY_MAX_CHARS} characters"),
            ));
        }

        let category = self
            .category
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(category) = category.as_ref()
            && category.chars().count() > CATEGORY_MAX_CHARS
        {
            return Err(DomainError::validation(
                "category",
                format!("must be at most {CATEGORY_MAX_CHARS} characters"),
            ));
        }

        Ok(Self {
            title,
            summary,
            body: self.body,
            category,
        })
    }
}
