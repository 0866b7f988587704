use unicode_normalization::UnicodeNormalization;

/// Canonical form of an inbound prompt: NFC, no BOM, LF line endings, trimmed.
/// An empty result means the prompt carried nothing worth sending upstream.
pub fn clean_prompt(s: &str) -> String {
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}
