//! Heuristic source classification over an extracted UFDR workspace.
//!
//! Nothing inside an archive is guaranteed: table names, column names, and
//! file layouts vary by source application. Classification is keyword-driven
//! at two levels — file names/extensions for the workspace walk, and column
//! names for individual tables inside a relational database. Files that match
//! nothing are dropped without error.

use std::path::{Path, PathBuf};

use anyhow::Result;
use walkdir::WalkDir;

use crate::normalize::{TEXT_FIELDS, TIMESTAMP_FIELDS};

pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "heic", "heif", "tiff",
];

const DB_EXTENSIONS: &[&str] = &["sqlite", "db"];
const MESSAGE_NAME_HINTS: &[&str] = &["sms", "message", "chat", "imessage", "mms", "whatsapp", "calllog"];
const CONTACT_NAME_HINTS: &[&str] = &["contact", "addressbook"];

const NAME_PART_COLUMNS: &[&str] = &["first", "last", "name"];
const REACHABILITY_COLUMNS: &[&str] = &["phone", "number", "email", "address"];

/// What a workspace member was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    MessageDb,
    ContactDb,
    ContactMarkup,
    SystemProperties,
    Image,
}

/// What a database table's columns look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Message,
    Contact,
}

/// Classified member files of one extracted archive.
#[derive(Debug, Default)]
pub struct UfdrSources {
    /// The extraction report, when the tool shipped one.
    pub report: Option<PathBuf>,
    pub message_dbs: Vec<PathBuf>,
    pub contact_dbs: Vec<PathBuf>,
    pub contact_xml_files: Vec<PathBuf>,
    pub system_plists: Vec<PathBuf>,
    pub image_files: Vec<PathBuf>,
}

/// Walk the extraction directory and bucket every classifiable member file.
pub fn discover_sources(extraction_dir: &Path) -> Result<UfdrSources> {
    let mut sources = UfdrSources::default();

    for entry in WalkDir::new(extraction_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();

        if sources.report.is_none()
            && path
                .file_name()
                .is_some_and(|n| n.eq_ignore_ascii_case("report.xml"))
        {
            sources.report = Some(path.to_path_buf());
            continue;
        }

        match classify_file(path) {
            Some(SourceKind::MessageDb) => sources.message_dbs.push(path.to_path_buf()),
            Some(SourceKind::ContactDb) => sources.contact_dbs.push(path.to_path_buf()),
            Some(SourceKind::ContactMarkup) => sources.contact_xml_files.push(path.to_path_buf()),
            Some(SourceKind::SystemProperties) => sources.system_plists.push(path.to_path_buf()),
            Some(SourceKind::Image) => sources.image_files.push(path.to_path_buf()),
            None => {}
        }
    }

    // Deterministic processing order regardless of walk order.
    sources.message_dbs.sort();
    sources.contact_dbs.sort();
    sources.contact_xml_files.sort();
    sources.system_plists.sort();
    sources.image_files.sort();

    Ok(sources)
}

/// Classify one file by extension and filename keywords.
pub fn classify_file(path: &Path) -> Option<SourceKind> {
    let extension = path.extension()?.to_string_lossy().to_lowercase();
    let name = path.file_name()?.to_string_lossy().to_lowercase();

    if DB_EXTENSIONS.contains(&extension.as_str()) {
        if MESSAGE_NAME_HINTS.iter().any(|hint| name.contains(hint)) {
            return Some(SourceKind::MessageDb);
        }
        if CONTACT_NAME_HINTS.iter().any(|hint| name.contains(hint)) {
            return Some(SourceKind::ContactDb);
        }
        return None;
    }
    if extension == "xml" && name.contains("contact") {
        return Some(SourceKind::ContactMarkup);
    }
    if extension == "plist" {
        return Some(SourceKind::SystemProperties);
    }
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        return Some(SourceKind::Image);
    }
    None
}

/// Best-effort MIME guess for inventoried media, by extension only.
pub fn guess_mime(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_string_lossy().to_lowercase();
    match extension.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tiff" => Some("image/tiff"),
        "heic" | "heif" => Some("image/heic"),
        _ => None,
    }
}

/// Classify a table by its column names.
///
/// A table whose columns intersect both the body and timestamp keyword sets
/// is message-like; one with contact/name-part columns plus a way to reach
/// the person (phone, number, email, address) is contact-like. A table that
/// satisfies both heuristics is a message table — messages are the richer
/// record, and this rule is the single tie-break for the whole pipeline.
pub fn classify_columns<S: AsRef<str>>(columns: &[S]) -> Option<TableKind> {
    let lowered: Vec<String> = columns
        .iter()
        .map(|c| c.as_ref().to_lowercase())
        .collect();
    let has = |candidates: &[&str]| {
        candidates
            .iter()
            .any(|field| lowered.iter().any(|column| column == field))
    };

    if has(TEXT_FIELDS) && has(TIMESTAMP_FIELDS) {
        return Some(TableKind::Message);
    }
    if (lowered.iter().any(|c| c == "contact") || has(NAME_PART_COLUMNS))
        && has(REACHABILITY_COLUMNS)
    {
        return Some(TableKind::Contact);
    }
    None
}
