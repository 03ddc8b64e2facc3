//! Descriptive acquisition metadata from `header` and `header2` sections.

use crate::error::{CoreError, Result};
use flate2::read::ZlibDecoder;
use serde::Serialize;
use std::io::Read;

/// Upper bound on inflated header text.
const MAX_HEADER_TEXT: u64 = 1024 * 1024;

/// Keys that are never shown.
const HIDDEN_KEYS: &[&str] = &["p", "dc"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionMetadata {
    fields: Vec<(String, String)>,
}

impl AcquisitionMetadata {
    /// Parses the tab separated table that follows the `main` line.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));
        lines.find(|line| line.trim().eq_ignore_ascii_case("main"))?;
        let keys = lines.next()?;
        let values = lines.next()?;

        let fields = keys
            .split('\t')
            .zip(values.split('\t'))
            .map(|(k, v)| (k.trim(), v.trim()))
            .filter(|(k, _)| !k.is_empty() && !HIDDEN_KEYS.contains(k))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Some(Self { fields })
    }

    /// Inflates a header section body and parses it.
    ///
    /// `header2` bodies are UTF-16LE, `header` bodies are single-byte text.
    pub fn from_section(body: &[u8], utf16: bool) -> Result<Option<Self>> {
        let text = inflate_text(body, utf16)?;
        Ok(Self::parse(&text))
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialises the fields in the single-category `header` text layout.
    pub fn to_header_text(&self) -> String {
        let clean = |s: &str| s.replace(['\t', '\r', '\n'], " ");
        let keys: Vec<String> = self.fields.iter().map(|(k, _)| clean(k)).collect();
        let values: Vec<String> = self.fields.iter().map(|(_, v)| clean(v)).collect();
        format!("1\r\nmain\r\n{}\r\n{}\r\n\r\n", keys.join("\t"), values.join("\t"))
    }
}

/// Display label for a metadata key.
pub fn label(key: &str) -> &str {
    match key {
        "a" => "Description",
        "c" => "Case number",
        "n" => "Evidence number",
        "e" => "Examiner",
        "t" => "Notes",
        "md" => "Model",
        "sn" => "Serial number",
        "av" => "Imager version",
        "ov" => "OS version",
        "m" => "Acquired time",
        "u" => "System time",
        other => other,
    }
}

fn inflate_text(body: &[u8], utf16: bool) -> Result<String> {
    let mut raw = Vec::new();
    ZlibDecoder::new(body)
        .take(MAX_HEADER_TEXT)
        .read_to_end(&mut raw)
        .map_err(|e| CoreError::InvalidFormat(format!("header section does not inflate: {e}")))?;

    if !utf16 {
        return Ok(String::from_utf8_lossy(&raw).into_owned());
    }

    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .skip_while(|&unit| unit == 0xFEFF)
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    const TEXT: &str = "1\r\nmain\r\nc\tn\ta\te\tt\tav\tov\tm\tu\tp\r\n\
                        42\tEV-1\tlaptop disk\tJ. Doe\t\t6.1\tLinux\t1700000000\t1700000100\tsecret\r\n\r\n";

    #[test]
    fn test_parse_header_text() {
        let meta = AcquisitionMetadata::parse(TEXT).unwrap();
        assert_eq!(meta.get("c"), Some("42"));
        assert_eq!(meta.get("e"), Some("J. Doe"));
        assert_eq!(meta.get("m"), Some("1700000000"));
        assert_eq!(meta.get("p"), None);
        assert_eq!(label("e"), "Examiner");
        assert_eq!(label("zz"), "zz");
    }

    #[test]
    fn test_parse_without_main_line() {
        assert!(AcquisitionMetadata::parse("1\nsomething\nelse\n").is_none());
    }

    #[test]
    fn test_header_section_ascii() {
        let meta = AcquisitionMetadata::from_section(&deflate(TEXT.as_bytes()), false)
            .unwrap()
            .unwrap();
        assert_eq!(meta.get("n"), Some("EV-1"));
    }

    #[test]
    fn test_header2_section_utf16() {
        let mut utf16 = vec![0xFF, 0xFE];
        for unit in TEXT.encode_utf16() {
            utf16.extend_from_slice(&unit.to_le_bytes());
        }
        let meta = AcquisitionMetadata::from_section(&deflate(&utf16), true)
            .unwrap()
            .unwrap();
        assert_eq!(meta.get("a"), Some("laptop disk"));
    }

    #[test]
    fn test_garbage_section_is_an_error() {
        assert!(AcquisitionMetadata::from_section(b"not zlib at all", false).is_err());
    }

    #[test]
    fn test_header_text_round_trip() {
        let meta = AcquisitionMetadata::from_pairs([("c", "7"), ("e", "tab\there")]);
        let parsed = AcquisitionMetadata::parse(&meta.to_header_text()).unwrap();
        assert_eq!(parsed.get("c"), Some("7"));
        assert_eq!(parsed.get("e"), Some("tab here"));
    }
}
