//! Firmware package reader.
//!
//! A DFU package is a ZIP archive with a `manifest.json` naming two
//! members: the init packet and the firmware image.

use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use super::error::{DfuError, DfuResult};

/// Contents of a DFU package, fully read into memory.
#[derive(Debug)]
pub struct DfuPackage {
    /// Init packet bytes.
    pub init_data: Vec<u8>,
    /// Firmware image bytes.
    pub firmware_data: Vec<u8>,
}

/// Raw manifest.json structure for deserialization.
#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest: ManifestInner,
}

#[derive(Debug, Deserialize)]
struct ManifestInner {
    application: Option<ApplicationEntry>,
}

#[derive(Debug, Deserialize)]
struct ApplicationEntry {
    dat_file: String,
    bin_file: String,
}

impl DfuPackage {
    /// Open and validate a package file.
    pub fn open<P: AsRef<Path>>(path: P) -> DfuResult<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let mut archive = zip::ZipArchive::new(file)?;

        let application = read_manifest(&mut archive)?;
        let init_data = read_member(&mut archive, &application.dat_file)?;
        let firmware_data = read_member(&mut archive, &application.bin_file)?;

        Ok(Self {
            init_data,
            firmware_data,
        })
    }
}

fn read_manifest(archive: &mut zip::ZipArchive<std::fs::File>) -> DfuResult<ApplicationEntry> {
    let mut manifest_file =
        archive
            .by_name("manifest.json")
            .map_err(|_| DfuError::MissingFile {
                filename: "manifest.json".to_string(),
            })?;

    let mut contents = String::new();
    manifest_file.read_to_string(&mut contents)?;

    let raw: RawManifest = serde_json::from_str(&contents)?;
    raw.manifest
        .application
        .ok_or_else(|| DfuError::InvalidManifest {
            reason: "no application image in package".to_string(),
        })
}

fn read_member(
    archive: &mut zip::ZipArchive<std::fs::File>,
    name: &str,
) -> DfuResult<Vec<u8>> {
    let mut member = archive.by_name(name).map_err(|_| DfuError::MissingFile {
        filename: name.to_string(),
    })?;

    let mut data = Vec::with_capacity(member.size() as usize);
    member.read_to_end(&mut data)?;

    if data.is_empty() {
        return Err(DfuError::EmptyMember {
            filename: name.to_string(),
        });
    }
    Ok(data)
}
