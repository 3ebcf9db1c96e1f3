//! Request and response shapes of the image endpoints.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An already-uploaded object to attach to a product.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageDescriptor {
    /// Object key inside the product bucket.
    pub file_name: Option<String>,
    pub position: Option<i64>,
}

impl ImageDescriptor {
    /// The usable object key, if any.
    pub fn object_key(&self) -> Option<&str> {
        self.file_name
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

/// Body of `POST /api/products/{id}/images`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttachImagesRequest {
    #[serde(default)]
    pub images: Vec<ImageDescriptor>,
}

/// A file part received by the multipart upload endpoint.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub file_name: String,
    pub body: Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresignedImage {
    pub image_id: Uuid,
    pub url: String,
    pub expires_in: u64,
}
