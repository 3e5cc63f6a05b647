//! Firmware file selection and validation
//!
//! Checks a selected firmware file against the extension and size policy
//! before anything is sent to the device. The device validates the image
//! itself; this is only the gate that keeps obviously wrong files local.

use crate::{errors::ValidationError, services::format::format_size};
use anyhow::{Context, Result, ensure};
use log::debug;
use std::path::{Path, PathBuf};

pub const DEFAULT_FIRMWARE_EXTENSION: &str = ".bin";
pub const DEFAULT_MAX_FIRMWARE_BYTES: u64 = 5 * 1024 * 1024;

/// A firmware file picked by the user
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareFile {
    pub name: String,
    pub size_bytes: u64,
    pub path: PathBuf,
}

impl FirmwareFile {
    pub fn new(name: impl Into<String>, size_bytes: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            path: path.into(),
        }
    }

    /// Read name and size of a file on disk
    pub async fn from_path(path: &Path) -> Result<Self> {
        debug!("from_path() called with {path:?}");

        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed to read metadata of {path:?}"))?;
        ensure!(metadata.is_file(), "failed since {path:?} is not a file");

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .with_context(|| format!("failed to get file name of {path:?}"))?;

        Ok(Self::new(name, metadata.len(), path))
    }
}

/// Which files may be uploaded
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwarePolicy {
    pub extension: String,
    pub max_size_bytes: u64,
}

impl Default for FirmwarePolicy {
    fn default() -> Self {
        Self {
            extension: DEFAULT_FIRMWARE_EXTENSION.to_string(),
            max_size_bytes: DEFAULT_MAX_FIRMWARE_BYTES,
        }
    }
}

/// A firmware file that passed the [`FileValidator`]
///
/// Only the validator can create one, so an upload cannot start with a file
/// that skipped the policy check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedFirmware(FirmwareFile);

impl ValidatedFirmware {
    pub fn file(&self) -> &FirmwareFile {
        &self.0
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn size_bytes(&self) -> u64 {
        self.0.size_bytes
    }

    /// Load the image right before the upload
    pub async fn read(&self) -> Result<Vec<u8>> {
        let data = tokio::fs::read(&self.0.path)
            .await
            .with_context(|| format!("failed to read firmware {:?}", self.0.path))?;

        ensure!(
            data.len() as u64 == self.0.size_bytes,
            "failed since firmware {:?} changed size after selection",
            self.0.path
        );

        Ok(data)
    }
}

#[derive(Clone, Debug, Default)]
pub struct FileValidator {
    policy: FirmwarePolicy,
}

impl FileValidator {
    pub fn new(policy: FirmwarePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FirmwarePolicy {
        &self.policy
    }

    pub fn check(&self, file: &FirmwareFile) -> Result<(), ValidationError> {
        if !file.name.ends_with(&self.policy.extension) {
            return Err(ValidationError::InvalidExtension {
                name: file.name.clone(),
                expected: self.policy.extension.clone(),
            });
        }

        if file.size_bytes > self.policy.max_size_bytes {
            return Err(ValidationError::FileTooLarge {
                size_bytes: file.size_bytes,
                max: format_size(self.policy.max_size_bytes),
            });
        }

        Ok(())
    }

    pub fn validate(&self, file: FirmwareFile) -> Result<ValidatedFirmware, ValidationError> {
        self.check(&file)?;
        debug!(
            "firmware {} accepted ({})",
            file.name,
            format_size(file.size_bytes)
        );
        Ok(ValidatedFirmware(file))
    }
}
