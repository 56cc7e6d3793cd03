use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tuner_core::dataset_key::ImageKey;
use tuner_core::types::{Dataset, DatasetId, DatasetImage, OwnerId};
use tuner_store::MetadataStore;

/// Single-use object key plus the presigned URL that accepts a PUT to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDestination {
    pub key: String,
    pub url: String,
}

/// Everything the upload path needs from the hosted side, already bound to the caller.
#[async_trait]
pub trait UploadBackend: Send + Sync + 'static {
    async fn create_dataset(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> anyhow::Result<Dataset>;

    async fn dataset(&self, id: &DatasetId) -> anyhow::Result<Dataset>;

    async fn generate_upload_destination(
        &self,
        dataset: &DatasetId,
    ) -> anyhow::Result<UploadDestination>;

    /// Records a transferred object. The dataset is derived from `key`.
    async fn acknowledge_upload(
        &self,
        key: &str,
        bytes: u64,
        content_type: &str,
    ) -> anyhow::Result<DatasetImage>;
}

#[async_trait]
pub trait Presigner: Send + Sync + 'static {
    fn bucket(&self) -> &str;

    async fn presign_put(&self, key: &str) -> anyhow::Result<String>;
}

/// [`UploadBackend`] over a [`MetadataStore`] and a [`Presigner`], acting as `owner`.
pub struct StoreBackend {
    store: Arc<dyn MetadataStore>,
    presigner: Arc<dyn Presigner>,
    owner: OwnerId,
}

impl StoreBackend {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        presigner: Arc<dyn Presigner>,
        owner: OwnerId,
    ) -> Self {
        Self {
            store,
            presigner,
            owner,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }
}

#[async_trait]
impl UploadBackend for StoreBackend {
    async fn create_dataset(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> anyhow::Result<Dataset> {
        Ok(self
            .store
            .create_dataset(&self.owner, name, description)
            .await?)
    }

    async fn dataset(&self, id: &DatasetId) -> anyhow::Result<Dataset> {
        Ok(self.store.get_dataset(&self.owner, id).await?)
    }

    async fn generate_upload_destination(
        &self,
        dataset: &DatasetId,
    ) -> anyhow::Result<UploadDestination> {
        // Ownership check before handing out a writable URL.
        self.store.get_dataset(&self.owner, dataset).await?;
        let key = ImageKey::generate(dataset).to_string();
        let url = self.presigner.presign_put(&key).await?;
        debug!(dataset_id = %dataset, key = %key, "issued upload destination");
        Ok(UploadDestination { key, url })
    }

    async fn acknowledge_upload(
        &self,
        key: &str,
        bytes: u64,
        content_type: &str,
    ) -> anyhow::Result<DatasetImage> {
        Ok(self
            .store
            .record_image(
                &self.owner,
                self.presigner.bucket(),
                key,
                bytes,
                content_type,
            )
            .await?)
    }
}
