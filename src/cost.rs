//! Credit pricing for ingestion requests.
//!
//! Pure and total: any combination of inputs maps to a deterministic cost of
//! at least one credit. Negative sizes clamp to zero before pricing.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Text,
    Url,
    File,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Text => "text",
            SourceKind::Url => "url",
            SourceKind::File => "file",
            SourceKind::Unknown => "unknown",
        }
    }
}

/// Sizing metadata produced by the ingestion adapters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CostInput {
    pub source_kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub bytes: i64,
    #[serde(default)]
    pub pages: i64,
    #[serde(default)]
    pub text_chars: i64,
    #[serde(default)]
    pub pixels: i64,
}

const MIB: i64 = 1024 * 1024;

/// Credits owed for one ingestion request.
///
/// - text: 1 + 1 per additional 4k chars
/// - url: 2 + 1 per additional 6k chars
/// - pdf: 2 + 1 per 5 pages + 1 per additional 10k extracted chars
/// - image: 2 + 1 per ~2MP beyond the first 2 (unsized images price as 1MP)
/// - other file: 2 + 1 per 5 MiB
pub fn cost(input: &CostInput) -> i64 {
    let chars = input.text_chars.max(0);

    match input.source_kind {
        SourceKind::Text => 1 + (chars - 4000).max(0) / 4000,
        SourceKind::Url => 2 + (chars - 6000).max(0) / 6000,
        SourceKind::File => {
            let mimetype = input
                .mimetype
                .as_deref()
                .unwrap_or_default()
                .to_ascii_lowercase();

            if mimetype.contains("pdf") {
                let pages = input.pages.max(1);
                2 + (pages - 1) / 5 + (chars - 10_000).max(0) / 10_000
            } else if mimetype.starts_with("image/") {
                let pixels = input.pixels.max(0);
                if pixels == 0 {
                    // Unsized image: treated as one megapixel, base price.
                    2
                } else {
                    2 + (pixels - 2_000_000).max(0) / 2_000_000
                }
            } else {
                let bytes = input.bytes.max(0);
                2 + bytes / (5 * MIB)
            }
        }
        SourceKind::Unknown => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(chars: i64) -> CostInput {
        CostInput {
            source_kind: SourceKind::Text,
            text_chars: chars,
            ..CostInput::default()
        }
    }

    fn file(mimetype: &str) -> CostInput {
        CostInput {
            source_kind: SourceKind::File,
            mimetype: Some(mimetype.to_string()),
            ..CostInput::default()
        }
    }

    #[test]
    fn text_pricing_steps_every_4k_chars() {
        assert_eq!(cost(&text(0)), 1);
        assert_eq!(cost(&text(4000)), 1);
        assert_eq!(cost(&text(8000)), 2);
        assert_eq!(cost(&text(8001)), 2);
        assert_eq!(cost(&text(12_001)), 3);
    }

    #[test]
    fn url_pricing_steps_every_6k_chars() {
        let mut input = text(6000);
        input.source_kind = SourceKind::Url;
        assert_eq!(cost(&input), 2);
        input.text_chars = 12_000;
        assert_eq!(cost(&input), 3);
    }

    #[test]
    fn pdf_pricing_counts_pages_and_chars() {
        let mut input = file("application/pdf");
        input.pages = 6;
        assert_eq!(cost(&input), 3);
        input.pages = 1;
        input.text_chars = 20_000;
        assert_eq!(cost(&input), 3);
        input.pages = 0;
        input.text_chars = 0;
        assert_eq!(cost(&input), 2);
    }

    #[test]
    fn image_pricing_by_megapixels() {
        let mut input = file("image/png");
        input.pixels = 5_000_000;
        assert_eq!(cost(&input), 3);
        input.pixels = 0;
        assert_eq!(cost(&input), 2);
        input.pixels = 3_999_999;
        assert_eq!(cost(&input), 2);
    }

    #[test]
    fn opaque_file_pricing_by_bytes() {
        let mut input = file("application/zip");
        input.bytes = 4 * MIB;
        assert_eq!(cost(&input), 2);
        input.bytes = 11 * MIB;
        assert_eq!(cost(&input), 4);
    }

    #[test]
    fn garbage_inputs_clamp_to_zero() {
        let mut input = text(-500);
        assert_eq!(cost(&input), 1);
        input.source_kind = SourceKind::File;
        input.mimetype = Some("image/jpeg".into());
        input.pixels = -1;
        assert_eq!(cost(&input), 2);
        input.mimetype = None;
        input.bytes = -9999;
        assert_eq!(cost(&input), 2);
    }

    #[test]
    fn unknown_kind_is_flat() {
        assert_eq!(cost(&CostInput::default()), 1);
    }
}
