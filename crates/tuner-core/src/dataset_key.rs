use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::types::DatasetId;

const ROOT: &str = "datasets";
const IMAGES: &str = "images";
const DATA: &str = "data";

/// Object key of an uploaded dataset image: `datasets/<dataset_id>/images/<object_id>`.
///
/// The owning dataset is encoded in the key so an upload acknowledgement can be
/// attributed (and ownership re-checked) from the key alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageKey {
    pub dataset_id: DatasetId,
    pub object_id: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageKeyParseError {
    #[error("key does not start with '{ROOT}/'")]
    ForeignPrefix,
    #[error("key is missing the dataset id segment")]
    MissingDataset,
    #[error("key is missing the object id segment")]
    MissingObject,
    #[error("key segment must be '{IMAGES}', got {0:?}")]
    UnexpectedSegment(String),
}

impl ImageKey {
    /// A fresh single-use key for `dataset_id`.
    pub fn generate(dataset_id: &DatasetId) -> Self {
        Self {
            dataset_id: dataset_id.clone(),
            object_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn parse(key: &str) -> Result<Self, ImageKeyParseError> {
        let mut parts = key.trim().splitn(4, '/');
        if parts.next() != Some(ROOT) {
            return Err(ImageKeyParseError::ForeignPrefix);
        }
        let dataset = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(ImageKeyParseError::MissingDataset)?;
        match parts.next() {
            Some(IMAGES) => {}
            Some(other) => return Err(ImageKeyParseError::UnexpectedSegment(other.to_string())),
            None => return Err(ImageKeyParseError::MissingObject),
        }
        let object = parts
            .next()
            .filter(|s| !s.is_empty() && !s.contains('/'))
            .ok_or(ImageKeyParseError::MissingObject)?;

        Ok(Self {
            dataset_id: DatasetId(dataset.to_string()),
            object_id: object.to_string(),
        })
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ROOT}/{}/{IMAGES}/{}", self.dataset_id, self.object_id)
    }
}

/// Prefix every uploaded object of a dataset lives under.
pub fn images_prefix(dataset_id: &DatasetId) -> String {
    format!("{ROOT}/{dataset_id}/{IMAGES}")
}

/// Dataset-level key prefix recorded on the dataset row.
pub fn data_prefix(dataset_id: &DatasetId) -> String {
    format!("{ROOT}/{dataset_id}/{DATA}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_round_trips_to_dataset() {
        let id = DatasetId("ds_42".to_string());
        let key = ImageKey::generate(&id);
        let rendered = key.to_string();
        assert!(rendered.starts_with("datasets/ds_42/images/"));
        assert_eq!(ImageKey::parse(&rendered).unwrap().dataset_id, id);
    }

    #[test]
    fn generated_keys_are_unique() {
        let id = DatasetId("ds".to_string());
        assert_ne!(ImageKey::generate(&id), ImageKey::generate(&id));
    }

    #[test]
    fn parse_rejects_foreign_prefix() {
        assert_eq!(
            ImageKey::parse("uploads/ds/images/x"),
            Err(ImageKeyParseError::ForeignPrefix)
        );
    }

    #[test]
    fn parse_rejects_truncated_keys() {
        assert_eq!(
            ImageKey::parse("datasets/"),
            Err(ImageKeyParseError::MissingDataset)
        );
        assert_eq!(
            ImageKey::parse("datasets/ds"),
            Err(ImageKeyParseError::MissingObject)
        );
        assert_eq!(
            ImageKey::parse("datasets/ds/images/"),
            Err(ImageKeyParseError::MissingObject)
        );
    }

    #[test]
    fn parse_rejects_data_prefix_keys() {
        assert_eq!(
            ImageKey::parse("datasets/ds/data/a.png"),
            Err(ImageKeyParseError::UnexpectedSegment("data".to_string()))
        );
    }

    #[test]
    fn generated_keys_live_under_images_prefix() {
        let id = DatasetId("abc".to_string());
        assert_eq!(images_prefix(&id), "datasets/abc/images");
        let key = ImageKey::generate(&id).to_string();
        assert!(key.starts_with(&format!("{}/", images_prefix(&id))));
    }

    #[test]
    fn data_prefix_layout() {
        assert_eq!(
            data_prefix(&DatasetId("abc".to_string())),
            "datasets/abc/data"
        );
    }
}
