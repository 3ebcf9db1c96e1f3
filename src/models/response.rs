//! Success envelope of the HTTP API.

use super::page::PageMetadata;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub message: String,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PageMetadata>,
}

impl<T> ApiResponse<T> {
    pub fn new(message: impl Into<String>, data: T) -> Self {
        Self {
            message: message.into(),
            data,
            pagination: None,
        }
    }

    pub fn paged(message: impl Into<String>, data: T, pagination: PageMetadata) -> Self {
        Self {
            pagination: Some(pagination),
            ..Self::new(message, data)
        }
    }
}
