//! ImageReference entity - resolved URL of a symbolic image key

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::value_objects::ImageKey;

/// An empty URL is the permanent-failure sentinel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub key: ImageKey,
    pub url: String,
    pub updated_at: DateTime<Utc>,
}

impl ImageReference {
    /// Record a generated image. Blank or malformed URLs degrade to the failure sentinel.
    pub fn resolved(key: ImageKey, url: &str) -> Self {
        let url = url.trim();
        let url = if Self::is_well_formed(url) { url } else { "" };
        Self {
            key,
            url: url.to_string(),
            updated_at: Utc::now(),
        }
    }

    pub fn failed(key: ImageKey) -> Self {
        Self {
            key,
            url: String::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.url.is_empty()
    }

    fn is_well_formed(url: &str) -> bool {
        (url.starts_with("https://") || url.starts_with("http://"))
            && !url.starts_with("https://https:/")
            && !url.starts_with("http://http:/")
    }
}
