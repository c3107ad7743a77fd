use std::{
    collections::BTreeMap,
    io::{Read, Write},
};

use chrono::NaiveDateTime;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::{Archive, Builder, Header};

use super::{BackupError, BackupResult, BackupType};

pub const FORMAT_VERSION: u32 = 1;
pub const METADATA_ENTRY: &str = "metadata.json";
pub const DATABASE_ENTRY: &str = "database.json";
pub const STORAGE_PREFIX: &str = "storage/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObject {
    pub key: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageMetadata {
    pub format_version: u32,
    pub created_at: NaiveDateTime,
    pub backup_type: BackupType,
    pub app_version: String,
    pub table_counts: BTreeMap<String, usize>,
    pub database_sha256: String,
    pub storage_objects: Vec<StorageObject>,
}

#[derive(Debug, Clone)]
pub struct Package {
    pub metadata: PackageMetadata,
    pub database: Vec<u8>,
    pub storage: Vec<(String, Vec<u8>)>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl Package {
    /// Assembles a package, deriving the checksums and the storage listing.
    pub fn new(
        backup_type: BackupType,
        created_at: NaiveDateTime,
        table_counts: BTreeMap<String, usize>,
        database: Vec<u8>,
        storage: Vec<(String, Vec<u8>)>,
    ) -> Self {
        let storage_objects = storage
            .iter()
            .map(|(key, bytes)| StorageObject {
                key: key.clone(),
                size: bytes.len() as u64,
                sha256: sha256_hex(bytes),
            })
            .collect();

        Self {
            metadata: PackageMetadata {
                format_version: FORMAT_VERSION,
                created_at,
                backup_type,
                app_version: env!("CARGO_PKG_VERSION").to_string(),
                table_counts,
                database_sha256: sha256_hex(&database),
                storage_objects,
            },
            database,
            storage,
        }
    }

    /// Checks format version, the database checksum and every listed storage object.
    pub fn validate(&self) -> BackupResult<()> {
        let metadata = &self.metadata;
        if metadata.format_version != FORMAT_VERSION {
            return Err(BackupError::InvalidPackage(format!(
                "unsupported package format version {}",
                metadata.format_version
            )));
        }

        let actual = sha256_hex(&self.database);
        if actual != metadata.database_sha256 {
            return Err(BackupError::ChecksumMismatch {
                entry: DATABASE_ENTRY.to_string(),
                expected: metadata.database_sha256.clone(),
                actual,
            });
        }

        let stored: BTreeMap<&str, &[u8]> = self
            .storage
            .iter()
            .map(|(key, bytes)| (key.as_str(), bytes.as_slice()))
            .collect();
        for object in &metadata.storage_objects {
            let bytes = stored.get(object.key.as_str()).ok_or_else(|| {
                BackupError::InvalidPackage(format!("storage object '{}' missing", object.key))
            })?;
            let actual = sha256_hex(bytes);
            if actual != object.sha256 {
                return Err(BackupError::ChecksumMismatch {
                    entry: format!("{STORAGE_PREFIX}{}", object.key),
                    expected: object.sha256.clone(),
                    actual,
                });
            }
        }
        if stored.len() != metadata.storage_objects.len() {
            return Err(BackupError::InvalidPackage(
                "package holds storage objects not listed in metadata".into(),
            ));
        }

        Ok(())
    }
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> BackupResult<()> {
    let mut header = Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, name, bytes)?;
    Ok(())
}

/// Writes `package` as a gzip-compressed tar stream and returns the inner writer.
pub fn write_package<W: Write>(writer: W, package: &Package) -> BackupResult<W> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = Builder::new(encoder);

    let metadata = serde_json::to_vec_pretty(&package.metadata)?;
    append_entry(&mut builder, METADATA_ENTRY, &metadata)?;
    append_entry(&mut builder, DATABASE_ENTRY, &package.database)?;
    for (key, bytes) in &package.storage {
        append_entry(&mut builder, &format!("{STORAGE_PREFIX}{key}"), bytes)?;
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    Ok(writer)
}

pub fn encode(package: &Package) -> BackupResult<Vec<u8>> {
    write_package(Vec::new(), package)
}

pub fn read_package<R: Read>(reader: R) -> BackupResult<Package> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut metadata: Option<Vec<u8>> = None;
    let mut database: Option<Vec<u8>> = None;
    let mut storage = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().to_string();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;

        match path.as_str() {
            METADATA_ENTRY => metadata = Some(bytes),
            DATABASE_ENTRY => database = Some(bytes),
            other => match other.strip_prefix(STORAGE_PREFIX) {
                Some(key) if !key.is_empty() => storage.push((key.to_string(), bytes)),
                _ => {
                    return Err(BackupError::InvalidPackage(format!(
                        "unexpected entry '{other}'"
                    )))
                }
            },
        }
    }

    let metadata = metadata
        .ok_or_else(|| BackupError::InvalidPackage(format!("{METADATA_ENTRY} missing")))?;
    let database = database
        .ok_or_else(|| BackupError::InvalidPackage(format!("{DATABASE_ENTRY} missing")))?;
    let metadata: PackageMetadata = serde_json::from_slice(&metadata)
        .map_err(|err| BackupError::InvalidPackage(format!("invalid {METADATA_ENTRY}: {err}")))?;

    Ok(Package {
        metadata,
        database,
        storage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn created_at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 5, 1)
            .unwrap()
            .and_hms_opt(2, 0, 0)
            .unwrap()
    }

    fn sample() -> Package {
        let counts = BTreeMap::from([("documents".to_string(), 2), ("users".to_string(), 3)]);
        Package::new(
            BackupType::Full,
            created_at(),
            counts,
            br#"{"documents":[]}"#.to_vec(),
            vec![("documents/a/abc".to_string(), b"pdf bytes".to_vec())],
        )
    }

    #[test]
    fn package_survives_archive_and_validates() {
        let bytes = encode(&sample()).unwrap();
        let package = read_package(bytes.as_slice()).unwrap();

        package.validate().unwrap();
        assert_eq!(package.metadata.backup_type, BackupType::Full);
        assert_eq!(package.metadata.table_counts["users"], 3);
        assert_eq!(package.storage, vec![("documents/a/abc".to_string(), b"pdf bytes".to_vec())]);
    }

    #[test]
    fn tampered_database_fails_validation() {
        let mut package = sample();
        package.database = br#"{"documents":[1]}"#.to_vec();
        assert!(matches!(
            package.validate(),
            Err(BackupError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn missing_storage_object_fails_validation() {
        let mut package = sample();
        package.storage.clear();
        assert!(matches!(package.validate(), Err(BackupError::InvalidPackage(_))));
    }

    #[test]
    fn rejects_archives_without_metadata() {
        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        append_entry(&mut builder, DATABASE_ENTRY, b"{}").unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        assert!(matches!(
            read_package(bytes.as_slice()),
            Err(BackupError::InvalidPackage(_))
        ));
    }

    #[test]
    fn rejects_unknown_format_version() {
        let mut package = sample();
        package.metadata.format_version = 99;
        assert!(matches!(package.validate(), Err(BackupError::InvalidPackage(_))));
    }
}
