use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::IdGen;

/// An uploaded source image, stored as base64 payload plus mime type.
///
/// Image bytes are owned here; request items hold only the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedImage {
    pub id: u64,
    pub name: String,
    pub mime_type: String,
    pub data: String,
}

/// Registry of uploaded images for the current session.
///
/// The scheduler fetches image data by id at dispatch time and must tolerate
/// the image having been removed in the meantime.
#[derive(Debug, Default)]
pub struct ImageLibrary {
    ids: IdGen,
    images: RwLock<Vec<UploadedImage>>,
}

impl ImageLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an image and returns its assigned id.
    pub fn add(
        &self,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<String>,
    ) -> u64 {
        let id = self.ids.next_id();
        self.images.write().push(UploadedImage {
            id,
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        });
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut images = self.images.write();
        let before = images.len();
        images.retain(|image| image.id != id);
        images.len() != before
    }

    pub fn clear(&self) {
        self.images.write().clear();
    }

    pub fn get(&self, id: u64) -> Option<UploadedImage> {
        self.images
            .read()
            .iter()
            .find(|image| image.id == id)
            .cloned()
    }

    /// Image ids in upload order.
    pub fn ids(&self) -> Vec<u64> {
        self.images.read().iter().map(|image| image.id).collect()
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }
}
