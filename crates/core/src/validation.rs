//! Job input validation.
//!
//! [`validate_input`] checks the raw `input` payload of a job and either
//! returns the two image paths or every problem it found, so the caller can
//! report them all at once.

use std::path::Path;

use serde_json::Value;

use crate::types::{ImagePair, ImageSlot};

/// Human-readable problems found in a job input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Input validation failed: {}", .0.join("; "))]
pub struct ValidationErrors(pub Vec<String>);

impl ValidationErrors {
    pub fn messages(&self) -> &[String] {
        &self.0
    }

    pub fn into_messages(self) -> Vec<String> {
        self.0
    }
}

/// Validate a job input object.
///
/// Both `image1_path` and `image2_path` must be present, be strings, and
/// name something that exists on the local filesystem. Never panics:
/// non-object inputs simply report both fields as missing.
pub fn validate_input(input: &Value) -> Result<ImagePair, ValidationErrors> {
    tracing::info!(input = %input, "Validating job input");

    let mut errors = Vec::new();
    let image1 = check_image_field(input, ImageSlot::First, &mut errors);
    let image2 = check_image_field(input, ImageSlot::Second, &mut errors);

    match (image1, image2) {
        (Some(image1), Some(image2)) if errors.is_empty() => Ok(ImagePair::new(image1, image2)),
        _ => Err(ValidationErrors(errors)),
    }
}

fn check_image_field<'a>(
    input: &'a Value,
    slot: ImageSlot,
    errors: &mut Vec<String>,
) -> Option<&'a str> {
    let Some(raw) = input.get(slot.field()) else {
        errors.push(format!("{} path ('{}') is required", slot.label(), slot.field()));
        return None;
    };

    let Some(path) = raw.as_str() else {
        errors.push(format!("{} path ('{}') must be a string", slot.label(), slot.field()));
        return None;
    };

    tracing::debug!(slot = slot.field(), path, "Checking image exists");
    if !Path::new(path).exists() {
        errors.push(format!("{} doesn't exist at path: {path}", slot.label()));
        log_directory_listing(Path::new(path));
        return None;
    }

    Some(path)
}

/// Log what the parent directory of a missing image does contain.
fn log_directory_listing(missing: &Path) {
    let Some(dir) = missing.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return;
    };

    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let names: Vec<String> = entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            tracing::debug!(dir = %dir.display(), files = ?names, "Available files next to missing image");
        }
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Cannot list directory of missing image");
        }
    }
}
