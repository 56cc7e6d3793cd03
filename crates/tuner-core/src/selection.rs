use std::collections::HashSet;
use std::path::Path;

use crate::limits::{MAX_CAPTIONS_PER_DATASET, MAX_IMAGES_PER_DATASET};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];

/// A file the user picked for upload, held in memory until it is transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedFile {
    pub name: String,
    pub size: u64,
    pub last_modified_unix_time_ms: u64,
    /// Declared media type, if the source provided one.
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Selection identity: two files with the same triple are the same pick.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileFingerprint {
    pub name: String,
    pub size: u64,
    pub last_modified_unix_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Caption,
    Archive,
    Other,
}

impl SelectedFile {
    pub fn new(
        name: impl Into<String>,
        last_modified_unix_time_ms: u64,
        content_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            size: bytes.len() as u64,
            last_modified_unix_time_ms,
            content_type,
            bytes,
        }
    }

    pub fn fingerprint(&self) -> FileFingerprint {
        FileFingerprint {
            name: self.name.clone(),
            size: self.size,
            last_modified_unix_time_ms: self.last_modified_unix_time_ms,
        }
    }

    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    /// Declared type wins; the extension is only consulted when no type was declared.
    pub fn kind(&self) -> FileKind {
        let declared = self
            .content_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        if let Some(t) = declared {
            if t.starts_with("image/") {
                return FileKind::Image;
            }
            if t == "text/plain" {
                return FileKind::Caption;
            }
            if t == "application/zip" {
                return FileKind::Archive;
            }
        }
        match self.extension().as_deref() {
            Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => FileKind::Image,
            Some("txt") => FileKind::Caption,
            Some("zip") => FileKind::Archive,
            _ => FileKind::Other,
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind() == FileKind::Image
    }

    /// Media type to send with the upload.
    pub fn effective_content_type(&self) -> String {
        if let Some(t) = self.content_type.as_deref().filter(|t| !t.is_empty()) {
            return t.to_string();
        }
        match self.extension().as_deref() {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("png") => "image/png",
            Some("webp") => "image/webp",
            Some("gif") => "image/gif",
            Some("txt") => "text/plain",
            Some("zip") => "application/zip",
            _ => "application/octet-stream",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionLimits {
    pub max_images: u64,
    pub max_captions: u64,
}

impl Default for SelectionLimits {
    fn default() -> Self {
        Self {
            max_images: MAX_IMAGES_PER_DATASET,
            max_captions: MAX_CAPTIONS_PER_DATASET,
        }
    }
}

impl SelectionLimits {
    /// Room left in a dataset that already holds `images` images and `captions` captions.
    pub fn remaining(images: u64, captions: u64) -> Self {
        let d = Self::default();
        Self {
            max_images: d.max_images.saturating_sub(images),
            max_captions: d.max_captions.saturating_sub(captions),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Duplicate,
    LimitReached(FileKind),
    Unsupported,
}

/// Files waiting to be uploaded, de-duplicated by [`FileFingerprint`] and kept in pick order.
#[derive(Debug, Clone, Default)]
pub struct PendingSelection {
    files: Vec<SelectedFile>,
    seen: HashSet<FileFingerprint>,
    limits: SelectionLimits,
    images: u64,
    captions: u64,
}

impl PendingSelection {
    pub fn new(limits: SelectionLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    pub fn add(&mut self, file: SelectedFile) -> AddOutcome {
        let kind = file.kind();
        let (count, max) = match kind {
            FileKind::Image => (&mut self.images, self.limits.max_images),
            FileKind::Caption => (&mut self.captions, self.limits.max_captions),
            FileKind::Archive | FileKind::Other => return AddOutcome::Unsupported,
        };
        let fp = file.fingerprint();
        if self.seen.contains(&fp) {
            return AddOutcome::Duplicate;
        }
        if *count >= max {
            return AddOutcome::LimitReached(kind);
        }
        *count += 1;
        self.seen.insert(fp);
        self.files.push(file);
        AddOutcome::Added
    }

    pub fn extend<I: IntoIterator<Item = SelectedFile>>(&mut self, files: I) -> Vec<AddOutcome> {
        files.into_iter().map(|f| self.add(f)).collect()
    }

    pub fn remove(&mut self, fingerprint: &FileFingerprint) -> Option<SelectedFile> {
        if !self.seen.remove(fingerprint) {
            return None;
        }
        let idx = self
            .files
            .iter()
            .position(|f| f.fingerprint() == *fingerprint)?;
        let file = self.files.remove(idx);
        match file.kind() {
            FileKind::Image => self.images = self.images.saturating_sub(1),
            FileKind::Caption => self.captions = self.captions.saturating_sub(1),
            _ => {}
        }
        Some(file)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[SelectedFile] {
        &self.files
    }

    pub fn image_count(&self) -> u64 {
        self.images
    }

    pub fn caption_count(&self) -> u64 {
        self.captions
    }

    pub fn into_files(self) -> Vec<SelectedFile> {
        self.files
    }
}
