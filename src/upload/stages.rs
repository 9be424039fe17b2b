//! The validation stages run before an upload is committed.
//!
//! None of them write anything; each either lets the upload through or
//! returns the rejection for its check.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::image;
use super::outcome::UploadOutcome;
use super::{TransportStatus, UploadRequest};
use crate::scanner::{ScanVerdict, Scanner};
use crate::store::{validate_segment, LinkManager};

/// One step of the upload pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, upload: &UploadRequest<'_>) -> Result<(), UploadOutcome>;
}

/// Rejects descriptors the transport could not fill in properly.
pub struct TransportSanity {
    pub max_file_size: u64,
}

#[async_trait]
impl Stage for TransportSanity {
    fn name(&self) -> &'static str {
        "transport"
    }

    async fn check(&self, upload: &UploadRequest<'_>) -> Result<(), UploadOutcome> {
        let (Some(declared_size), Some(status)) = (upload.declared_size, upload.declared_status)
        else {
            return Err(UploadOutcome::InvalidInput(
                "upload is missing its size or status".to_string(),
            ));
        };

        match status {
            TransportStatus::Ok => {}
            TransportStatus::NoFile => {
                return Err(UploadOutcome::InvalidInput("no file sent".to_string()))
            }
            TransportStatus::SizeLimitExceeded => {
                return Err(UploadOutcome::TooLarge {
                    size: declared_size.max(upload.payload.len() as u64),
                    max: self.max_file_size,
                })
            }
            TransportStatus::Partial => {
                return Err(UploadOutcome::InvalidInput(
                    "file was only partially received".to_string(),
                ))
            }
            TransportStatus::Other(code) => {
                return Err(UploadOutcome::InvalidInput(format!(
                    "transport reported error code {code}"
                )))
            }
        }

        if declared_size != upload.payload.len() as u64 {
            return Err(UploadOutcome::InvalidInput(format!(
                "declared size {declared_size} does not match received {} bytes",
                upload.payload.len()
            )));
        }

        validate_segment("namespace", upload.namespace)
            .and_then(|_| validate_segment("name", upload.name))
            .map_err(UploadOutcome::from)
    }
}

/// Only extensions from the allow-set may be uploaded.
pub struct ExtensionCheck {
    pub allowed: BTreeSet<String>,
}

#[async_trait]
impl Stage for ExtensionCheck {
    fn name(&self) -> &'static str {
        "extension"
    }

    async fn check(&self, upload: &UploadRequest<'_>) -> Result<(), UploadOutcome> {
        let extension = extension_of(upload.name);
        if self.allowed.contains(&extension) {
            Ok(())
        } else {
            Err(UploadOutcome::UnsupportedType(extension))
        }
    }
}

/// Lower-cased text after the last `.`, or empty if there is none.
fn extension_of(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

/// The payload must carry a readable image header.
pub struct ImageCheck;

#[async_trait]
impl Stage for ImageCheck {
    fn name(&self) -> &'static str {
        "image"
    }

    async fn check(&self, upload: &UploadRequest<'_>) -> Result<(), UploadOutcome> {
        match image::probe(upload.payload) {
            Some(_) => Ok(()),
            None => Err(UploadOutcome::NotAnImage),
        }
    }
}

/// Early check for an existing link. The commit repeats it under the name lock.
pub struct NameCollisionCheck {
    pub links: Arc<LinkManager>,
}

#[async_trait]
impl Stage for NameCollisionCheck {
    fn name(&self) -> &'static str {
        "name"
    }

    async fn check(&self, upload: &UploadRequest<'_>) -> Result<(), UploadOutcome> {
        if self.links.exists(upload.namespace, upload.name).await? {
            return Err(UploadOutcome::NameCollision(format!(
                "{}/{}",
                upload.namespace, upload.name
            )));
        }
        Ok(())
    }
}

pub struct SizeCheck {
    pub max_file_size: u64,
}

#[async_trait]
impl Stage for SizeCheck {
    fn name(&self) -> &'static str {
        "size"
    }

    async fn check(&self, upload: &UploadRequest<'_>) -> Result<(), UploadOutcome> {
        let size = upload.payload.len() as u64;
        if size > self.max_file_size {
            return Err(UploadOutcome::TooLarge {
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }
}

/// Fails closed: with no scanner configured every upload is rejected.
pub struct VirusScan {
    pub scanner: Option<Arc<dyn Scanner>>,
}

#[async_trait]
impl Stage for VirusScan {
    fn name(&self) -> &'static str {
        "scan"
    }

    async fn check(&self, upload: &UploadRequest<'_>) -> Result<(), UploadOutcome> {
        let Some(scanner) = &self.scanner else {
            return Err(UploadOutcome::ScannerUnavailable);
        };
        match scanner.scan(upload.payload).await {
            ScanVerdict::Clean => Ok(()),
            ScanVerdict::Infected(reason) => Err(UploadOutcome::Infected(reason)),
            ScanVerdict::Unavailable => Err(UploadOutcome::ScannerUnavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::StubScanner;

    fn request<'a>(name: &'a str, payload: &'a [u8]) -> UploadRequest<'a> {
        UploadRequest {
            namespace: "docs",
            name,
            payload,
            declared_size: Some(payload.len() as u64),
            declared_status: Some(TransportStatus::Ok),
        }
    }

    #[tokio::test]
    async fn test_transport_requires_size_and_status() {
        let stage = TransportSanity { max_file_size: 100 };
        assert!(stage.check(&request("a.txt", b"hi")).await.is_ok());

        let mut missing_size = request("a.txt", b"hi");
        missing_size.declared_size = None;
        assert!(matches!(
            stage.check(&missing_size).await,
            Err(UploadOutcome::InvalidInput(_))
        ));

        let mut missing_status = request("a.txt", b"hi");
        missing_status.declared_status = None;
        assert!(matches!(
            stage.check(&missing_status).await,
            Err(UploadOutcome::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_status_codes() {
        let stage = TransportSanity { max_file_size: 100 };

        let mut too_big = request("a.txt", b"");
        too_big.declared_size = Some(0);
        too_big.declared_status = Some(TransportStatus::SizeLimitExceeded);
        assert!(matches!(
            stage.check(&too_big).await,
            Err(UploadOutcome::TooLarge { max: 100, .. })
        ));

        for status in [
            TransportStatus::NoFile,
            TransportStatus::Partial,
            TransportStatus::Other(7),
        ] {
            let mut upload = request("a.txt", b"hi");
            upload.declared_status = Some(status);
            assert!(matches!(
                stage.check(&upload).await,
                Err(UploadOutcome::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_transport_rejects_size_mismatch_and_bad_names() {
        let stage = TransportSanity { max_file_size: 100 };

        let mut mismatch = request("a.txt", b"hi");
        mismatch.declared_size = Some(3);
        assert!(matches!(
            stage.check(&mismatch).await,
            Err(UploadOutcome::InvalidInput(_))
        ));

        for name in ["", ".htaccess", "../etc/passwd", "a/b.txt"] {
            assert!(
                matches!(
                    stage.check(&request(name, b"hi")).await,
                    Err(UploadOutcome::InvalidInput(_))
                ),
                "{name:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_extension_check() {
        let stage = ExtensionCheck {
            allowed: ["jpg".to_string(), "png".to_string()].into_iter().collect(),
        };
        assert!(stage.check(&request("photo.JPG", b"x")).await.is_ok());
        assert!(stage.check(&request("archive.tar.png", b"x")).await.is_ok());
        assert!(matches!(
            stage.check(&request("setup.exe", b"x")).await,
            Err(UploadOutcome::UnsupportedType(ext)) if ext == "exe"
        ));
        assert!(matches!(
            stage.check(&request("README", b"x")).await,
            Err(UploadOutcome::UnsupportedType(ext)) if ext.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_image_check() {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&[1, 0, 1, 0]);
        assert!(ImageCheck.check(&request("a.gif", &gif)).await.is_ok());
        assert!(matches!(
            ImageCheck.check(&request("a.gif", b"not an image")).await,
            Err(UploadOutcome::NotAnImage)
        ));
    }

    #[tokio::test]
    async fn test_size_check_is_inclusive() {
        let stage = SizeCheck { max_file_size: 3 };
        assert!(stage.check(&request("a.txt", b"abc")).await.is_ok());
        assert!(matches!(
            stage.check(&request("a.txt", b"abcd")).await,
            Err(UploadOutcome::TooLarge { size: 4, max: 3 })
        ));
    }

    #[tokio::test]
    async fn test_scan_fails_closed() {
        let upload = request("a.txt", b"payload");

        let clean = VirusScan {
            scanner: Some(Arc::new(StubScanner::new(ScanVerdict::Clean))),
        };
        assert!(clean.check(&upload).await.is_ok());

        let infected = VirusScan {
            scanner: Some(Arc::new(StubScanner::new(ScanVerdict::Infected(
                "EICAR-Test".to_string(),
            )))),
        };
        assert!(matches!(
            infected.check(&upload).await,
            Err(UploadOutcome::Infected(reason)) if reason == "EICAR-Test"
        ));

        let unavailable = VirusScan {
            scanner: Some(Arc::new(StubScanner::new(ScanVerdict::Unavailable))),
        };
        assert!(matches!(
            unavailable.check(&upload).await,
            Err(UploadOutcome::ScannerUnavailable)
        ));

        let missing = VirusScan { scanner: None };
        assert!(matches!(
            missing.check(&upload).await,
            Err(UploadOutcome::ScannerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_name_collision_check() {
        let dir = tempfile::tempdir().unwrap();
        let (store, links) = crate::testutil::test_stores(&dir);

        let stage = NameCollisionCheck {
            links: Arc::clone(&links),
        };
        assert!(stage.check(&request("a.txt", b"x")).await.is_ok());

        let hash = store.put(b"x").await.unwrap();
        links.link("docs", "a.txt", &hash).await.unwrap();
        assert!(matches!(
            stage.check(&request("a.txt", b"x")).await,
            Err(UploadOutcome::NameCollision(_))
        ));
        assert!(stage.check(&request("b.txt", b"x")).await.is_ok());
    }
}
