//! Core data models used throughout hivesearch.
//!
//! These types represent the normalized records that flow from connectors
//! through the queues into the indexing pipeline, plus the config-schema
//! descriptors that the UI renders when a user connects a new source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What kind of record a document is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Document,
    Message,
    Comment,
    Person,
    Issue,
    PullRequest,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Document => "document",
            DocumentKind::Message => "message",
            DocumentKind::Comment => "comment",
            DocumentKind::Person => "person",
            DocumentKind::Issue => "issue",
            DocumentKind::PullRequest => "pull_request",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document" => Some(DocumentKind::Document),
            "message" => Some(DocumentKind::Message),
            "comment" => Some(DocumentKind::Comment),
            "person" => Some(DocumentKind::Person),
            "issue" => Some(DocumentKind::Issue),
            "pull_request" => Some(DocumentKind::PullRequest),
            _ => None,
        }
    }
}

/// Underlying file format for document-store records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    GoogleDoc,
    Docx,
    Pptx,
    Txt,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::GoogleDoc => "google_doc",
            FileKind::Docx => "docx",
            FileKind::Pptx => "pptx",
            FileKind::Txt => "txt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "google_doc" => Some(FileKind::GoogleDoc),
            "docx" => Some(FileKind::Docx),
            "pptx" => Some(FileKind::Pptx),
            "txt" => Some(FileKind::Txt),
            _ => None,
        }
    }

    /// Map an upstream MIME type onto a file kind, if we recognize it.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime {
            "application/vnd.google-apps.document" => Some(FileKind::GoogleDoc),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(FileKind::Docx)
            }
            "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
                Some(FileKind::Pptx)
            }
            "text/plain" => Some(FileKind::Txt),
            _ => None,
        }
    }
}

/// How a config field should be rendered by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Textarea,
    Password,
}

/// One declared field of a connector's config schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub input_kind: FieldKind,
    pub label: String,
    pub placeholder: String,
}

impl ConfigField {
    /// Create a text field. Label defaults to the title-cased name and the
    /// placeholder defaults to the label.
    pub fn new(name: &str) -> Self {
        let label = title_case(name);
        Self {
            name: name.to_string(),
            input_kind: FieldKind::Text,
            placeholder: label.clone(),
            label,
        }
    }

    pub fn with_kind(mut self, kind: FieldKind) -> Self {
        self.input_kind = kind;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self.placeholder = label.to_string();
        self
    }

    pub fn with_placeholder(mut self, placeholder: &str) -> Self {
        self.placeholder = placeholder.to_string();
        self
    }
}

fn title_case(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// A selectable sub-partition of a source (a wiki space, a channel, a
/// project). Shown to the user when a connector has prerequisites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub value: String,
    pub label: String,
}

/// The normalized record every connector produces, queued for indexing
/// together with its children (comments, thread replies).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Owning source; filled in by the framework when the record is emitted.
    #[serde(default)]
    pub source_id: i64,
    /// Identifier within the upstream system, unique per source.
    pub external_id: String,
    pub kind: DocumentKind,
    #[serde(default)]
    pub file_kind: Option<FileKind>,
    pub title: String,
    pub content: String,
    pub author: String,
    #[serde(default)]
    pub author_image_url: Option<String>,
    /// Human-readable breadcrumb (space name, channel, folder path).
    pub location: String,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub children: Vec<DocumentRecord>,
}

/// One unit of crawl work on the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub source_id: i64,
    /// Name of a method the connector declared; workers dispatch on it.
    pub method: String,
    pub kwargs: Map<String, Value>,
    pub attempts_remaining: u32,
}

impl TaskItem {
    pub const DEFAULT_ATTEMPTS: u32 = 3;

    pub fn new(source_id: i64, method: &str, kwargs: Map<String, Value>) -> Self {
        Self {
            source_id,
            method: method.to_string(),
            kwargs,
            attempts_remaining: Self::DEFAULT_ATTEMPTS,
        }
    }
}
