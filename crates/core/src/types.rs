//! Job-level value types shared by the worker crates.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde_json::Value;

/// Which of the two input images a value refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSlot {
    /// The face source (`image1_path`).
    First,
    /// The swap target (`image2_path`).
    Second,
}

impl ImageSlot {
    /// Both slots, in submission order.
    pub const ALL: [ImageSlot; 2] = [ImageSlot::First, ImageSlot::Second];

    /// Key of this slot in the job input object.
    pub fn field(self) -> &'static str {
        match self {
            ImageSlot::First => "image1_path",
            ImageSlot::Second => "image2_path",
        }
    }

    /// Human-readable label used in error messages.
    pub fn label(self) -> &'static str {
        match self {
            ImageSlot::First => "Image 1",
            ImageSlot::Second => "Image 2",
        }
    }
}

impl fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The two validated image paths of a face-swap job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePair {
    pub image1: PathBuf,
    pub image2: PathBuf,
}

impl ImagePair {
    pub fn new(image1: impl Into<PathBuf>, image2: impl Into<PathBuf>) -> Self {
        Self {
            image1: image1.into(),
            image2: image2.into(),
        }
    }

    /// Path for the given slot.
    pub fn get(&self, slot: ImageSlot) -> &PathBuf {
        match slot {
            ImageSlot::First => &self.image1,
            ImageSlot::Second => &self.image2,
        }
    }

    /// Resolve relative paths against the current working directory.
    ///
    /// The engine runs with its own working directory, so it must only ever
    /// see absolute paths. Symlinks are left unresolved.
    pub fn into_absolute(self) -> io::Result<Self> {
        Ok(Self {
            image1: std::path::absolute(&self.image1)?,
            image2: std::path::absolute(&self.image2)?,
        })
    }
}

/// Whether a raw job asks for a health check instead of a face swap.
///
/// Accepts the flag at the top level of the job (`{"health_check": true}`)
/// or inside its `input` object, since queue platforms wrap the caller's
/// payload under `input`.
pub fn is_health_check(job: &Value) -> bool {
    let flag = |v: &Value| v.get("health_check").and_then(Value::as_bool);
    flag(job)
        .or_else(|| job.get("input").and_then(flag))
        .unwrap_or(false)
}

/// The caller's payload of a raw job, or an empty object when absent.
pub fn job_input(job: &Value) -> Value {
    job.get("input")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()))
}
