//! src/services/image_service.rs
//!
//! ImageService: Attaches uploaded objects to products and serves them back.
//! Image rows never touch the search index.

use super::{
    context::OpContext,
    object_store::{ByteStream, ObjectReader, ObjectStorage, ObjectStorageError},
    record_store::RecordStore,
};
use crate::{
    errors::{CatalogError, CatalogResult},
    models::{
        image::{ImageDescriptor, PresignedImage, UploadedImage},
        product::ProductImage,
    },
};
use chrono::Utc;
use futures::stream;
use std::{io, sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ImageService {
    records: RecordStore,
    objects: Arc<dyn ObjectStorage>,
    /// Bucket holding every product image.
    bucket: String,
    presign_ttl: Duration,
}

impl ImageService {
    pub fn new(
        records: RecordStore,
        objects: Arc<dyn ObjectStorage>,
        bucket: impl Into<String>,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            records,
            objects,
            bucket: bucket.into(),
            presign_ttl,
        }
    }

    /// Create one image row per usable descriptor, all in one transaction.
    ///
    /// Descriptors without an object key are skipped. Any failed insert rolls
    /// back the whole batch.
    #[instrument(skip(self, ctx, descriptors), fields(count = descriptors.len()))]
    pub async fn attach_images(
        &self,
        ctx: &OpContext,
        product_id: Uuid,
        descriptors: &[ImageDescriptor],
    ) -> CatalogResult<Vec<ProductImage>> {
        let (tx, created) = ctx
            .guard(async {
                let mut tx = self.records.begin_write().await?;
                self.records.find_by_id(&mut tx, product_id).await?;

                let mut created = Vec::new();
                for descriptor in descriptors {
                    let Some(key) = descriptor.object_key() else {
                        debug!("skipping image descriptor without an object key");
                        continue;
                    };
                    let now = Utc::now();
                    let image = ProductImage {
                        id: Uuid::new_v4(),
                        product_id,
                        image_object: key.to_string(),
                        position: descriptor.position.unwrap_or(0),
                        created_at: now,
                        updated_at: now,
                    };
                    self.records.create_image(&mut tx, &image).await?;
                    created.push(image);
                }
                Ok((tx, created))
            })
            .await?;
        self.records.commit(tx).await?;
        info!(%product_id, attached = created.len(), "images attached");
        Ok(created)
    }

    /// Store each uploaded file in the product bucket, then attach them in
    /// upload order. Stored objects are removed again if attaching fails.
    #[instrument(skip(self, ctx, uploads), fields(count = uploads.len()))]
    pub async fn upload_images(
        &self,
        ctx: &OpContext,
        product_id: Uuid,
        uploads: Vec<UploadedImage>,
    ) -> CatalogResult<Vec<ProductImage>> {
        ctx.guard(async {
            let mut tx = self.records.begin().await?;
            self.records.find_by_id(&mut tx, product_id).await?;
            Ok(())
        })
        .await?;

        let mut stored_keys = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let key = object_key_for(product_id, &upload.file_name);
            let body: ByteStream = Box::pin(stream::iter([Ok::<_, io::Error>(upload.body)]));
            let stored = ctx
                .guard(async {
                    self.objects
                        .put_stream(&self.bucket, &key, body)
                        .await
                        .map_err(CatalogError::object("storing uploaded image"))
                })
                .await;
            if let Err(err) = stored {
                self.discard_objects(&stored_keys).await;
                return Err(err);
            }
            stored_keys.push(key);
        }

        let descriptors: Vec<ImageDescriptor> = stored_keys
            .iter()
            .enumerate()
            .map(|(position, key)| ImageDescriptor {
                file_name: Some(key.clone()),
                position: Some(position as i64),
            })
            .collect();

        match self.attach_images(ctx, product_id, &descriptors).await {
            Ok(images) => Ok(images),
            Err(err) => {
                self.discard_objects(&stored_keys).await;
                Err(err)
            }
        }
    }

    #[instrument(skip(self, ctx))]
    pub async fn get_image(&self, ctx: &OpContext, id: Uuid) -> CatalogResult<ProductImage> {
        ctx.guard(async {
            let mut tx = self.records.begin().await?;
            self.records.find_image(&mut tx, id).await
        })
        .await
    }

    #[instrument(skip(self, ctx))]
    pub async fn presigned_url(&self, ctx: &OpContext, id: Uuid) -> CatalogResult<PresignedImage> {
        let image = self.get_image(ctx, id).await?;
        let url = self
            .objects
            .presign(&self.bucket, &image.image_object, self.presign_ttl)
            .map_err(CatalogError::object("presigning image url"))?;
        Ok(PresignedImage {
            image_id: image.id,
            url,
            expires_in: self.presign_ttl.as_secs(),
        })
    }

    /// Open the stored bytes of an image for streaming.
    #[instrument(skip(self, ctx))]
    pub async fn open_image(
        &self,
        ctx: &OpContext,
        id: Uuid,
    ) -> CatalogResult<(ProductImage, ObjectReader)> {
        let image = self.get_image(ctx, id).await?;
        let reader = ctx
            .guard(async {
                self.objects
                    .open(&self.bucket, &image.image_object)
                    .await
                    .map_err(CatalogError::object("opening image"))
            })
            .await?;
        Ok((image, reader))
    }

    /// Delete the image row, then its object, then commit. A failed object
    /// delete rolls the row back; an already-missing object does not.
    #[instrument(skip(self, ctx))]
    pub async fn delete_image(&self, ctx: &OpContext, id: Uuid) -> CatalogResult<ProductImage> {
        let (tx, image) = ctx
            .guard(async {
                let mut tx = self.records.begin_write().await?;
                let image = self.records.find_image(&mut tx, id).await?;
                self.records.delete_image(&mut tx, &image).await?;
                match self.objects.delete(&self.bucket, &image.image_object).await {
                    Ok(()) => {}
                    Err(ObjectStorageError::NotFound { key, .. }) => {
                        debug!(%key, "image object already absent");
                    }
                    Err(err) => return Err(CatalogError::object("deleting image object")(err)),
                }
                Ok((tx, image))
            })
            .await?;
        self.records.commit(tx).await?;
        info!(image_id = %image.id, product_id = %image.product_id, "image deleted");
        Ok(image)
    }

    async fn discard_objects(&self, keys: &[String]) {
        for key in keys {
            if let Err(err) = self.objects.delete(&self.bucket, key).await {
                warn!(%key, error = %err, "failed to remove uploaded image after error");
            }
        }
    }
}

/// `{product_id}/{uuid}.{ext}`, keeping the lowercased extension of the upload.
fn object_key_for(product_id: Uuid, file_name: &str) -> String {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match extension {
        Some(ext) => format!("{}/{}.{}", product_id, Uuid::new_v4(), ext),
        None => format!("{}/{}", product_id, Uuid::new_v4()),
    }
}
