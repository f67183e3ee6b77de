use chardetng::EncodingDetector;
use encoding_rs::Encoding;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPage {
    pub url: String,
    pub html: String,
    pub encoding_label: String,
    pub content_type: Option<String>,
}

/// Decode raw page bytes into UTF-8 using: BOM -> Content-Type charset -> chardetng fallback.
///
/// Malformed sequences are replaced rather than rejected; crawled pages are often
/// slightly broken and scripts still want the rest of the document.
pub fn decode_page(bytes: &[u8], content_type: Option<&str>) -> (String, &'static Encoding) {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return decode_with(bytes, encoding);
    }

    if let Some(label) = content_type.and_then(extract_charset) {
        if let Some(enc) = Encoding::for_label(label.as_bytes()) {
            return decode_with(bytes, enc);
        }
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let enc = detector.guess(None, true);
    decode_with(bytes, enc)
}

/// Decode an archive entry name that is not valid UTF-8 (GBK, Shift_JIS and friends).
pub fn decode_entry_name(raw: &[u8]) -> String {
    if let Ok(name) = std::str::from_utf8(raw) {
        return name.to_string();
    }
    let mut detector = EncodingDetector::new();
    detector.feed(raw, true);
    let enc = detector.guess(None, true);
    let (text, _, _) = enc.decode(raw);
    text.into_owned()
}

fn extract_charset(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .filter_map(|part| {
            let (key, value) = part.trim().split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim_matches([' ', '"', '\''].as_ref()).to_string())
        })
        .next()
}

fn decode_with(bytes: &[u8], enc: &'static Encoding) -> (String, &'static Encoding) {
    let (text, used, _had_errors) = enc.decode(bytes);
    (text.into_owned(), used)
}
