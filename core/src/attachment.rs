/// Attachment encoding: turns a picked file into something a message can reference
///
/// Images are inlined as `data:` URLs and are safe to persist in the message
/// record. Every other file gets a `blob:` URL that only this encoder can
/// resolve, so it does not survive a restart.
use crate::error::{ChatError, Result};
use crate::messenger_types::{Attachment, AttachmentKind};
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

const OBJECT_URL_SCHEME: &str = "blob:chatsync";

#[derive(Clone)]
pub struct AttachmentEncoder {
    session_id: String,
    max_inline_bytes: usize,
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl AttachmentEncoder {
    pub fn new(max_inline_bytes: usize) -> Self {
        Self {
            session_id: Uuid::new_v4().simple().to_string(),
            max_inline_bytes,
            objects: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Read a file from disk and encode it
    pub async fn encode_path(&self, path: &Path) -> Result<Attachment> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ChatError::AttachmentRead(format!("invalid file name: {}", path.display()))
            })?
            .to_string();

        let data = tokio::fs::read(path).await.map_err(|e| {
            warn!("Failed to read attachment {}: {}", path.display(), e);
            ChatError::AttachmentRead(format!("{}: {}", path.display(), e))
        })?;

        let media_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string());

        self.encode_bytes(&name, media_type.as_deref(), Bytes::from(data))
            .await
    }

    /// Encode in-memory file content
    pub async fn encode_bytes(
        &self,
        name: &str,
        media_type: Option<&str>,
        data: Bytes,
    ) -> Result<Attachment> {
        let media_type = media_type.unwrap_or("application/octet-stream");

        if media_type.starts_with("image/") {
            if data.len() > self.max_inline_bytes {
                return Err(ChatError::AttachmentTooLarge {
                    name: name.to_string(),
                    size: data.len(),
                    limit: self.max_inline_bytes,
                });
            }
            let url = format!(
                "data:{};base64,{}",
                media_type,
                general_purpose::STANDARD.encode(&data)
            );
            debug!("Inlined image {} ({} bytes)", name, data.len());
            return Ok(Attachment {
                kind: AttachmentKind::Image,
                url,
                name: name.to_string(),
            });
        }

        let url = format!(
            "{}/{}/{}",
            OBJECT_URL_SCHEME,
            self.session_id,
            Uuid::new_v4().simple()
        );
        debug!("Registered {} as {} ({} bytes)", name, url, data.len());
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.clone(), data);

        Ok(Attachment {
            kind: AttachmentKind::File,
            url,
            name: name.to_string(),
        })
    }

    /// Content behind an object URL made by this encoder
    pub fn resolve(&self, url: &str) -> Option<Bytes> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    /// Forget an object URL. Returns whether it was known.
    pub fn revoke(&self, url: &str) -> bool {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url)
            .is_some();
        if removed {
            debug!("Revoked {}", url);
        }
        removed
    }

    /// Number of live object URLs
    pub fn object_count(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether `url` was issued by this encoder instance
    pub fn owns(&self, url: &str) -> bool {
        url.starts_with(&format!("{}/{}/", OBJECT_URL_SCHEME, self.session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_image_is_inlined() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("dot.png");
        std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

        let encoder = AttachmentEncoder::new(1024);
        let att = encoder.encode_path(&path).await.unwrap();
        assert_eq!(att.kind, AttachmentKind::Image);
        assert_eq!(att.name, "dot.png");
        assert_eq!(att.url, "data:image/png;base64,iVBORw==");
    }

    #[tokio::test]
    async fn test_other_files_get_session_object_url() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("report.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();

        let encoder = AttachmentEncoder::new(1024);
        let att = encoder.encode_path(&path).await.unwrap();
        assert_eq!(att.kind, AttachmentKind::File);
        assert!(encoder.owns(&att.url));
        assert_eq!(encoder.resolve(&att.url).unwrap(), Bytes::from_static(b"%PDF-1.4"));

        // Another session cannot resolve it
        let other = AttachmentEncoder::new(1024);
        assert!(!other.owns(&att.url));
        assert!(other.resolve(&att.url).is_none());

        assert!(encoder.revoke(&att.url));
        assert!(encoder.resolve(&att.url).is_none());
        assert!(!encoder.revoke(&att.url));
        assert_eq!(encoder.object_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_read_error() {
        let encoder = AttachmentEncoder::new(1024);
        let err = encoder
            .encode_path(Path::new("/definitely/not/here.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::AttachmentRead(_)));
    }

    #[tokio::test]
    async fn test_oversized_image_rejected() {
        let encoder = AttachmentEncoder::new(4);
        let err = encoder
            .encode_bytes("big.jpg", Some("image/jpeg"), Bytes::from(vec![0u8; 5]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::AttachmentTooLarge { size: 5, limit: 4, .. }));
    }
}
