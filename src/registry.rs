//! HTTP client for the remote plugin registry.
//!
//! The registry is a plain HTTP archive store: JSON metadata under
//! `/api/plugins`, zip archives under `/api/plugins/{name}/download`, and a
//! multipart upload endpoint. Downloads are checksum-verified when the
//! metadata carries one and extracted with path-traversal rejection.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use url::Url;

use crate::error::{HostError, HostResult};
use crate::events::{EventBus, EventKind, PluginEvent};
use crate::manifest::{PluginManifest, MANIFEST_FILE};

/// Metadata record served by the registry: the manifest plus store fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryPluginRecord {
    #[serde(flatten)]
    pub manifest: PluginManifest,
    pub uploaded_at: DateTime<Utc>,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Result of an update check for one installed plugin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    pub plugin: String,
    pub installed_version: String,
    pub registry_version: String,
    /// Version strings differ (the host's update-detection rule).
    pub update_available: bool,
    /// SemVer says the registry version is strictly newer; `None` when
    /// either version fails to parse.
    pub newer: Option<bool>,
}

/// Client over the registry wire protocol.
pub struct RegistryClient {
    base: Url,
    http: reqwest::Client,
    bus: Arc<EventBus>,
}

impl RegistryClient {
    pub fn new(base_url: &str, timeout: Duration, bus: Arc<EventBus>) -> HostResult<Self> {
        let base = Url::parse(base_url).map_err(|e| HostError::RegistryUnavailable {
            reason: format!("invalid registry url '{base_url}': {e}"),
        })?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("hostkit/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { base, http, bus })
    }

    fn endpoint(&self, path: &str) -> HostResult<Url> {
        self.base
            .join(path)
            .map_err(|e| HostError::RegistryUnavailable {
                reason: format!("bad endpoint '{path}': {e}"),
            })
    }

    /// `GET /api/plugins`
    pub async fn list(&self) -> HostResult<Vec<RegistryPluginRecord>> {
        let url = self.endpoint("/api/plugins")?;
        let response = self.http.get(url).send().await.map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(HostError::RegistryUnavailable {
                reason: format!("registry returned {}", response.status()),
            });
        }
        Ok(response.json().await.map_err(unavailable)?)
    }

    /// `GET /api/plugins/{name}`
    pub async fn get(&self, name: &str) -> HostResult<RegistryPluginRecord> {
        let url = self.endpoint(&format!("/api/plugins/{name}"))?;
        let response = self.http.get(url).send().await.map_err(unavailable)?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(HostError::RegistryNotFound {
                plugin: name.to_string(),
            }),
            status if status.is_success() => Ok(response.json().await.map_err(unavailable)?),
            status => Err(HostError::RegistryUnavailable {
                reason: format!("registry returned {status}"),
            }),
        }
    }

    /// `GET /api/plugins/{name}/download`: fetch, verify, extract into
    /// `plugins_dir/<name>`. Returns the installed directory.
    pub async fn download(&self, name: &str, plugins_dir: &Path) -> HostResult<PathBuf> {
        let record = self.get(name).await?;
        self.bus.publish(
            PluginEvent::new(EventKind::RegistryDownloadStarted, name, "registry-client")
                .with_payload(json!({ "version": record.manifest.version })),
        );

        let url = self.endpoint(&format!("/api/plugins/{name}/download"))?;
        let response = self.http.get(url).send().await.map_err(unavailable)?;
        match response.status() {
            reqwest::StatusCode::NOT_FOUND => {
                return Err(HostError::RegistryNotFound {
                    plugin: name.to_string(),
                })
            }
            status if !status.is_success() => {
                return Err(HostError::RegistryUnavailable {
                    reason: format!("download returned {status}"),
                })
            }
            _ => {}
        }
        let bytes = response.bytes().await.map_err(unavailable)?.to_vec();

        if let Some(expected) = &record.checksum {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(HostError::RegistryInvalidPackage {
                    reason: format!("checksum mismatch: expected {expected}, got {actual}"),
                });
            }
        }

        let target = plugins_dir.join(name);
        extract_archive(&bytes, &target)?;

        self.bus.publish(
            PluginEvent::new(EventKind::RegistryDownloadCompleted, name, "registry-client")
                .with_payload(json!({
                    "version": record.manifest.version,
                    "bytes": bytes.len(),
                })),
        );
        info!(plugin = name, dir = %target.display(), "plugin downloaded");
        Ok(target)
    }

    /// `POST /api/plugins` with a multipart `plugin` field.
    pub async fn upload(&self, name: &str, archive: Vec<u8>) -> HostResult<RegistryPluginRecord> {
        let url = self.endpoint("/api/plugins")?;
        let part = reqwest::multipart::Part::bytes(archive)
            .file_name(format!("{name}.zip"))
            .mime_str("application/zip")
            .map_err(unavailable)?;
        let form = reqwest::multipart::Form::new().part("plugin", part);

        let response = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(unavailable)?;
        match response.status() {
            reqwest::StatusCode::CONFLICT => Err(HostError::RegistryVersionConflict {
                plugin: name.to_string(),
                version: "declared".to_string(),
            }),
            reqwest::StatusCode::BAD_REQUEST => {
                let body = response.text().await.unwrap_or_default();
                Err(HostError::RegistryInvalidPackage { reason: body })
            }
            status if status.is_success() => {
                let record: RegistryPluginRecord = response.json().await.map_err(unavailable)?;
                self.bus.publish(
                    PluginEvent::new(EventKind::RegistryUploadCompleted, name, "registry-client")
                        .with_payload(json!({ "version": record.manifest.version })),
                );
                Ok(record)
            }
            status => Err(HostError::RegistryUnavailable {
                reason: format!("upload returned {status}"),
            }),
        }
    }

    /// `GET /api/health`
    pub async fn health(&self) -> bool {
        match self.endpoint("/api/health") {
            Ok(url) => matches!(
                self.http.get(url).send().await,
                Ok(response) if response.status().is_success()
            ),
            Err(_) => false,
        }
    }

    /// Compare installed versions against the registry.
    pub async fn check_updates(
        &self,
        installed: &HashMap<String, String>,
    ) -> HostResult<Vec<UpdateInfo>> {
        let records = self.list().await?;
        let mut updates = Vec::new();
        for record in records {
            let Some(installed_version) = installed.get(&record.manifest.name) else {
                continue;
            };
            let info = update_info(
                &record.manifest.name,
                installed_version,
                &record.manifest.version,
            );
            if info.update_available {
                self.bus.publish(
                    PluginEvent::new(
                        EventKind::RegistryUpdateAvailable,
                        &info.plugin,
                        "registry-client",
                    )
                    .with_payload(json!({
                        "installed": info.installed_version,
                        "available": info.registry_version,
                    })),
                );
            }
            updates.push(info);
        }
        Ok(updates)
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("base", &self.base.as_str())
            .finish()
    }
}

fn unavailable(e: reqwest::Error) -> HostError {
    HostError::RegistryUnavailable {
        reason: e.to_string(),
    }
}

fn update_info(plugin: &str, installed: &str, available: &str) -> UpdateInfo {
    let newer = match (
        semver::Version::parse(available),
        semver::Version::parse(installed),
    ) {
        (Ok(available), Ok(installed)) => Some(available > installed),
        _ => None,
    };
    UpdateInfo {
        plugin: plugin.to_string(),
        installed_version: installed.to_string(),
        registry_version: available.to_string(),
        update_available: installed != available,
        newer,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Extract a plugin archive. The archive must contain at least the manifest
/// and an `index.js`; entries escaping the target directory are rejected.
fn extract_archive(bytes: &[u8], target: &Path) -> HostResult<()> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive =
        zip::ZipArchive::new(cursor).map_err(|e| HostError::RegistryInvalidPackage {
            reason: format!("not a zip archive: {e}"),
        })?;

    let mut has_manifest = false;
    let mut has_module = false;
    for i in 0..archive.len() {
        let file = archive
            .by_index(i)
            .map_err(|e| HostError::RegistryInvalidPackage {
                reason: e.to_string(),
            })?;
        let Some(path) = file.enclosed_name() else {
            return Err(HostError::RegistryInvalidPackage {
                reason: format!("archive entry '{}' escapes the target", file.name()),
            });
        };
        if path.file_name().map(|f| f == MANIFEST_FILE).unwrap_or(false) {
            has_manifest = true;
        }
        if path.file_name().map(|f| f == "index.js").unwrap_or(false) {
            has_module = true;
        }
    }
    if !has_manifest || !has_module {
        return Err(HostError::RegistryInvalidPackage {
            reason: "archive must contain plugin.manifest.json and index.js".to_string(),
        });
    }

    std::fs::create_dir_all(target)?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| HostError::RegistryInvalidPackage {
                reason: e.to_string(),
            })?;
        let Some(relative) = file.enclosed_name() else {
            continue;
        };
        let out_path = target.join(relative);
        if file.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        std::fs::write(&out_path, contents)?;
        debug!(file = %out_path.display(), "extracted");
    }
    Ok(())
}

/// Pack a plugin directory into an uploadable archive.
pub fn pack_directory(dir: &Path) -> HostResult<Vec<u8>> {
    use zip::write::SimpleFileOptions;

    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buffer);
        let options = SimpleFileOptions::default();
        pack_into(&mut writer, dir, Path::new(""), options)?;
        writer
            .finish()
            .map_err(|e| HostError::RegistryInvalidPackage {
                reason: e.to_string(),
            })?;
    }
    Ok(buffer.into_inner())
}

fn pack_into<W: std::io::Write + std::io::Seek>(
    writer: &mut zip::ZipWriter<W>,
    dir: &Path,
    prefix: &Path,
    options: zip::write::SimpleFileOptions,
) -> HostResult<()> {
    use std::io::Write;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        if path.is_dir() {
            pack_into(writer, &path, &name, options)?;
        } else {
            writer
                .start_file(name.to_string_lossy().replace('\\', "/"), options)
                .map_err(|e| HostError::RegistryInvalidPackage {
                    reason: e.to_string(),
                })?;
            writer.write_all(&std::fs::read(&path)?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_archive(entries: &[(&str, &str)]) -> Vec<u8> {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            for (name, content) in entries {
                writer
                    .start_file(*name, SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[test]
    fn update_detection_is_string_inequality_with_semver_hint() {
        let info = update_info("auth", "1.0.0", "1.1.0");
        assert!(info.update_available);
        assert_eq!(info.newer, Some(true));

        let same = update_info("auth", "1.0.0", "1.0.0");
        assert!(!same.update_available);

        // a registry rollback still counts as "an update exists"
        let rollback = update_info("auth", "2.0.0", "1.9.0");
        assert!(rollback.update_available);
        assert_eq!(rollback.newer, Some(false));

        let weird = update_info("auth", "not-semver", "1.0.0");
        assert!(weird.update_available);
        assert_eq!(weird.newer, None);
    }

    #[test]
    fn extracts_valid_archive() {
        let tmp = TempDir::new().unwrap();
        let bytes = make_archive(&[
            ("plugin.manifest.json", r#"{"name": "x"}"#),
            ("dist/index.js", "module.exports = {}"),
        ]);
        let target = tmp.path().join("x");
        extract_archive(&bytes, &target).unwrap();
        assert!(target.join("plugin.manifest.json").exists());
        assert!(target.join("dist").join("index.js").exists());
    }

    #[test]
    fn rejects_archive_without_manifest() {
        let tmp = TempDir::new().unwrap();
        let bytes = make_archive(&[("dist/index.js", "code")]);
        let err = extract_archive(&bytes, &tmp.path().join("x")).unwrap_err();
        assert!(matches!(err, HostError::RegistryInvalidPackage { .. }));
    }

    #[test]
    fn rejects_non_zip_bytes() {
        let tmp = TempDir::new().unwrap();
        let err = extract_archive(b"not a zip", &tmp.path().join("x")).unwrap_err();
        assert!(matches!(err, HostError::RegistryInvalidPackage { .. }));
    }

    #[test]
    fn pack_then_extract_round_trips() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("src-plugin");
        std::fs::create_dir_all(source.join("dist")).unwrap();
        std::fs::write(source.join("plugin.manifest.json"), "{}").unwrap();
        std::fs::write(source.join("dist").join("index.js"), "x").unwrap();

        let bytes = pack_directory(&source).unwrap();
        let target = tmp.path().join("out");
        extract_archive(&bytes, &target).unwrap();
        assert!(target.join("dist").join("index.js").exists());
    }

    #[test]
    fn checksum_helper_is_stable() {
        assert_eq!(sha256_hex(b""), sha256_hex(b""));
        assert_ne!(sha256_hex(b"a"), sha256_hex(b"b"));
        assert_eq!(sha256_hex(b"abc").len(), 64);
    }
}
