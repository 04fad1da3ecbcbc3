//! Text extraction for uploaded documents
//!
//! PDF and DOCX are decoded; anything text-like is read as UTF-8. Files of
//! an unknown type are accepted when their bytes are valid UTF-8.

use std::io::Read;
use std::path::Path;

use super::DocumentError;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

const TEXT_MIME_TYPES: &[&str] = &[
    "application/json",
    "application/toml",
    "application/x-sh",
    "application/x-yaml",
    "application/xml",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "py", "sh", "bat", "cmd", "json", "csv", "log", "toml", "yaml", "yml", "xml",
    "rs", "js", "ts", "html", "css", "sql",
];

/// Maximum decompressed size of `word/document.xml`
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Pdf,
    Docx,
    Text,
    Unknown,
}

fn classify(content_type: Option<&str>, file_name: &str) -> Kind {
    let mime = content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .unwrap_or_default();
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if mime == MIME_PDF || extension == "pdf" {
        Kind::Pdf
    } else if mime == MIME_DOCX || extension == "docx" {
        Kind::Docx
    } else if mime.starts_with("text/")
        || TEXT_MIME_TYPES.contains(&mime.as_str())
        || TEXT_EXTENSIONS.contains(&extension.as_str())
    {
        Kind::Text
    } else {
        Kind::Unknown
    }
}

/// Extract plain text from an uploaded file.
pub fn extract_text(
    bytes: &[u8],
    content_type: Option<&str>,
    file_name: &str,
) -> Result<String, DocumentError> {
    let text = match classify(content_type, file_name) {
        Kind::Pdf => extract_pdf(bytes)?,
        Kind::Docx => extract_docx(bytes)?,
        Kind::Text => decode_text(bytes),
        Kind::Unknown => match std::str::from_utf8(bytes) {
            Ok(text) => {
                tracing::warn!(file = file_name, ?content_type, "Unknown file type, treating as plain text");
                strip_bom(text).to_string()
            }
            Err(_) => {
                return Err(DocumentError::UnsupportedType(
                    content_type.unwrap_or("application/octet-stream").to_string(),
                ))
            }
        },
    };

    if text.trim().is_empty() {
        return Err(DocumentError::Empty);
    }
    Ok(text)
}

fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => strip_bom(text).to_string(),
        Err(_) => {
            tracing::warn!("Document is not valid UTF-8, replacing invalid sequences");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, DocumentError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| DocumentError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, DocumentError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| DocumentError::Docx(e.to_string()))?;

    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| DocumentError::Docx(e.to_string()))?;

    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| DocumentError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(DocumentError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }

    paragraphs_from_document_xml(&xml)
}

/// Collect `w:t` runs, one line per `w:p` paragraph.
fn paragraphs_from_document_xml(xml: &[u8]) -> Result<String, DocumentError> {
    use quick_xml::events::Event;

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| DocumentError::Docx(e.to_string()))?;
                current.push_str(&text);
            }
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"p" => {
                paragraphs.push(std::mem::take(&mut current))
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => paragraphs.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(DocumentError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !current.is_empty() {
        paragraphs.push(current);
    }
    Ok(paragraphs.join("\n"))
}
