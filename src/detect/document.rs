use crate::config::FORMAT_SNIFF_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Zip, // CBZ/EPUB
    Rar, // CBR
    Png,
    Jpeg,
    Unknown,
}

impl DocumentFormat {
    pub fn label(self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Zip => "zip",
            DocumentFormat::Rar => "rar",
            DocumentFormat::Png => "png",
            DocumentFormat::Jpeg => "jpeg",
            DocumentFormat::Unknown => "unknown",
        }
    }
}

/// Detect document format from file header bytes.
pub fn detect_document(header: &[u8]) -> DocumentFormat {
    // PDF: "%PDF-" within the first 1 KB (some producers prepend junk).
    let head = &header[..header.len().min(FORMAT_SNIFF_BYTES)];
    if find(head, b"%PDF-").is_some() {
        return DocumentFormat::Pdf;
    }

    if header.starts_with(b"PK\x03\x04") {
        return DocumentFormat::Zip;
    }

    if header.starts_with(b"Rar!\x1A\x07") {
        return DocumentFormat::Rar;
    }

    if header.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        return DocumentFormat::Png;
    }

    if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return DocumentFormat::Jpeg;
    }

    DocumentFormat::Unknown
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
