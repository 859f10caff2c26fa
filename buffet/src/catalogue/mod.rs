//! Image catalogue: the bootable images users may pick from.
//!
//! Loaded once from `index.json` into an immutable snapshot. The runtime
//! swaps whole snapshots on reload, so a request never observes a
//! half-updated catalogue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use buffet_shared::errors::{BuffetError, BuffetResult};
use serde::{Deserialize, Deserializer, Serialize};

use crate::runtime::constants::filenames;

/// Which accelerator an image needs to boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorHint {
    /// Hardware acceleration when the host offers it, TCG otherwise.
    #[default]
    Auto,
    /// Refuse to boot without hardware acceleration.
    Native,
    /// Always use software emulation.
    Software,
}

/// One `index.json` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Boot image file name under the images directory; doubles as the image ref.
    pub iso: String,

    #[serde(default)]
    pub name: String,

    #[serde(default, deserialize_with = "string_or_number")]
    pub version: Option<String>,

    #[serde(default)]
    pub desktop: Option<String>,

    #[serde(default)]
    pub homepage: Option<String>,

    #[serde(default)]
    pub desktop_homepage: Option<String>,

    /// Guest CPU architecture, as used in `qemu-system-<arch>`.
    #[serde(default = "default_architecture")]
    pub architecture: String,

    #[serde(default)]
    pub accelerator: AcceleratorHint,

    /// Logo file name under `logos/`.
    #[serde(default)]
    pub logo: Option<String>,
}

fn default_architecture() -> String {
    "x86_64".to_string()
}

/// Versions show up as both `"24.04"` and `12` in hand-written catalogues.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl ImageEntry {
    pub fn image_ref(&self) -> &str {
        &self.iso
    }

    pub fn metadata(&self) -> CatalogueMetadata {
        CatalogueMetadata {
            name: self.name.clone(),
            version: self.version.clone(),
            desktop: self.desktop.clone(),
            homepage: self.homepage.clone(),
            desktop_homepage: self.desktop_homepage.clone(),
            architecture: self.architecture.clone(),
        }
    }

    fn validate(&self) -> BuffetResult<()> {
        if self.iso.is_empty()
            || self.iso.starts_with('.')
            || self.iso.contains(['/', '\\'])
        {
            return Err(BuffetError::Config(format!(
                "catalogue entry has invalid image file name '{}'",
                self.iso
            )));
        }
        if self.architecture.is_empty()
            || !self
                .architecture
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(BuffetError::Config(format!(
                "image '{}' has invalid architecture '{}'",
                self.iso, self.architecture
            )));
        }
        if let Some(logo) = &self.logo
            && (logo.starts_with('.') || logo.contains(['/', '\\']))
        {
            return Err(BuffetError::Config(format!(
                "image '{}' has invalid logo '{}'",
                self.iso, logo
            )));
        }
        Ok(())
    }
}

/// Catalogue fields merged into a session view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueMetadata {
    pub name: String,
    pub version: Option<String>,
    pub desktop: Option<String>,
    pub homepage: Option<String>,
    pub desktop_homepage: Option<String>,
    pub architecture: String,
}

/// A catalogue entry with its logo inlined for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageListing {
    #[serde(flatten)]
    pub entry: ImageEntry,
    /// Base64 PNG, or `None` when neither the logo nor the fallback exists.
    pub logo_base64: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ImageCatalogue {
    entries: Vec<ImageEntry>,
    by_ref: HashMap<String, usize>,
    logos_dir: PathBuf,
}

impl ImageCatalogue {
    /// Read and validate `index.json`.
    pub fn load(index_path: &Path, logos_dir: &Path) -> BuffetResult<Self> {
        let raw = std::fs::read_to_string(index_path).map_err(|e| {
            BuffetError::Config(format!(
                "failed to read catalogue {}: {}",
                index_path.display(),
                e
            ))
        })?;
        let entries: Vec<ImageEntry> = serde_json::from_str(&raw).map_err(|e| {
            BuffetError::Config(format!(
                "invalid catalogue {}: {}",
                index_path.display(),
                e
            ))
        })?;

        let catalogue = Self::from_entries(entries, logos_dir.to_path_buf())?;
        tracing::info!(
            path = %index_path.display(),
            images = catalogue.len(),
            "Loaded image catalogue"
        );
        Ok(catalogue)
    }

    pub fn from_entries(entries: Vec<ImageEntry>, logos_dir: PathBuf) -> BuffetResult<Self> {
        let mut by_ref = HashMap::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            entry.validate()?;
            if by_ref.insert(entry.iso.clone(), idx).is_some() {
                return Err(BuffetError::Config(format!(
                    "duplicate catalogue entry '{}'",
                    entry.iso
                )));
            }
        }
        Ok(Self {
            entries,
            by_ref,
            logos_dir,
        })
    }

    pub fn lookup(&self, image_ref: &str) -> Option<&ImageEntry> {
        self.by_ref.get(image_ref).map(|&idx| &self.entries[idx])
    }

    pub fn contains(&self, image_ref: &str) -> bool {
        self.by_ref.contains_key(image_ref)
    }

    pub fn metadata(&self, image_ref: &str) -> Option<CatalogueMetadata> {
        self.lookup(image_ref).map(ImageEntry::metadata)
    }

    pub fn entries(&self) -> &[ImageEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry with its logo base64-encoded.
    pub fn listing(&self) -> Vec<ImageListing> {
        self.entries
            .iter()
            .map(|entry| ImageListing {
                entry: entry.clone(),
                logo_base64: self.logo_base64(entry),
            })
            .collect()
    }

    fn logo_base64(&self, entry: &ImageEntry) -> Option<String> {
        let own = entry.logo.as_deref().map(|logo| self.logos_dir.join(logo));
        let fallback = self.logos_dir.join(filenames::UNKNOWN_LOGO);

        own.into_iter()
            .chain(std::iter::once(fallback))
            .find_map(|path| std::fs::read(&path).ok())
            .map(|bytes| BASE64.encode(bytes))
    }
}
