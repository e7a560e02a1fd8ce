//! Optional in-memory media backend
//!
//! The dispatcher answers `NOT_SUPPORTED` when no backend is configured;
//! this one holds encrypted blobs (ciphertext + wrapped key, both opaque)
//! under `media_<uuid>` ids until their TTL lapses. A production deployment
//! substitutes an object store behind the same surface.

use std::collections::HashMap;

use parking_lot::Mutex;
use pm_proto::api::{MediaDownloadResponsePayload, MediaUploadPayload};

pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;
pub const MEDIA_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct StoredMedia {
    pub media_id: String,
    pub recipient_key: String,
    pub encrypted_data: String,
    pub encrypted_key: String,
    pub mime_type: String,
    pub file_size: u64,
    pub expires_at: i64,
}

#[derive(Default)]
pub struct MediaStore {
    entries: Mutex<HashMap<String, StoredMedia>>,
}

impl MediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one upload; returns (media_id, expires_at).
    pub fn store(&self, recipient_key: &str, upload: &MediaUploadPayload) -> (String, i64) {
        self.store_at(
            recipient_key,
            upload,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    pub(crate) fn store_at(
        &self,
        recipient_key: &str,
        upload: &MediaUploadPayload,
        now: i64,
    ) -> (String, i64) {
        let media_id = format!("media_{}", uuid::Uuid::new_v4());
        let expires_at = now + MEDIA_TTL_MS;
        self.entries.lock().insert(
            media_id.clone(),
            StoredMedia {
                media_id: media_id.clone(),
                recipient_key: recipient_key.to_string(),
                encrypted_data: upload.encrypted_data.clone(),
                encrypted_key: upload.encrypted_key.clone(),
                mime_type: upload
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".into()),
                file_size: upload.file_size,
                expires_at,
            },
        );
        (media_id, expires_at)
    }

    /// Fetch for download. Expired entries behave as absent.
    pub fn fetch(&self, media_id: &str) -> Option<StoredMedia> {
        self.fetch_at(media_id, chrono::Utc::now().timestamp_millis())
    }

    pub(crate) fn fetch_at(&self, media_id: &str, now: i64) -> Option<StoredMedia> {
        self.entries
            .lock()
            .get(media_id)
            .filter(|m| m.expires_at > now)
            .cloned()
    }

    pub fn prune_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, m| m.expires_at > now);
        before - entries.len()
    }
}

impl StoredMedia {
    pub fn to_download_response(&self) -> MediaDownloadResponsePayload {
        MediaDownloadResponsePayload {
            media_id: self.media_id.clone(),
            encrypted_data: self.encrypted_data.clone(),
            encrypted_key: self.encrypted_key.clone(),
            mime_type: self.mime_type.clone(),
            file_size: self.file_size,
        }
    }
}
