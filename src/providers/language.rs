//! Provider language normalization.
//!
//! Providers report languages as 2-letter codes, 3-letter codes or plain
//! English names depending on the API. Everything is folded into ISO-639-2/B
//! here. Brazilian Portuguese is its own code (`pob`), distinct from
//! European Portuguese, because mixing the two is the single most common
//! subtitle complaint.

struct Language {
    code: &'static str,
    name: &'static str,
    aliases: &'static [&'static str],
}

const LANGUAGES: &[Language] = &[
    Language { code: "eng", name: "English", aliases: &["en", "en-us", "en-gb"] },
    Language { code: "spa", name: "Spanish", aliases: &["es", "es-es", "es-la", "es-419", "spl", "spanish (latin america)"] },
    Language { code: "fre", name: "French", aliases: &["fr", "fra", "fr-fr", "fr-ca"] },
    Language { code: "ger", name: "German", aliases: &["de", "deu"] },
    Language { code: "ita", name: "Italian", aliases: &["it"] },
    Language { code: "por", name: "Portuguese", aliases: &["pt", "pt-pt"] },
    Language { code: "pob", name: "Portuguese (Brazil)", aliases: &["pt-br", "pt_br", "ptbr", "pb", "brazilian", "brazilian portuguese", "portuguese (brazilian)"] },
    Language { code: "rus", name: "Russian", aliases: &["ru"] },
    Language { code: "jpn", name: "Japanese", aliases: &["ja", "jp"] },
    Language { code: "kor", name: "Korean", aliases: &["ko"] },
    Language { code: "chi", name: "Chinese", aliases: &["zh", "zho", "zh-cn", "zh-tw", "chinese (simplified)", "chinese (traditional)"] },
    Language { code: "ara", name: "Arabic", aliases: &["ar"] },
    Language { code: "hin", name: "Hindi", aliases: &["hi"] },
    Language { code: "tur", name: "Turkish", aliases: &["tr"] },
    Language { code: "pol", name: "Polish", aliases: &["pl"] },
    Language { code: "dut", name: "Dutch", aliases: &["nl", "nld"] },
    Language { code: "swe", name: "Swedish", aliases: &["sv"] },
    Language { code: "nor", name: "Norwegian", aliases: &["no", "nb", "nob"] },
    Language { code: "dan", name: "Danish", aliases: &["da"] },
    Language { code: "fin", name: "Finnish", aliases: &["fi"] },
    Language { code: "ell", name: "Greek", aliases: &["el", "gre"] },
    Language { code: "heb", name: "Hebrew", aliases: &["he", "iw"] },
    Language { code: "hun", name: "Hungarian", aliases: &["hu"] },
    Language { code: "cze", name: "Czech", aliases: &["cs", "ces"] },
    Language { code: "slo", name: "Slovak", aliases: &["sk", "slk"] },
    Language { code: "rum", name: "Romanian", aliases: &["ro", "ron"] },
    Language { code: "bul", name: "Bulgarian", aliases: &["bg"] },
    Language { code: "ukr", name: "Ukrainian", aliases: &["uk"] },
    Language { code: "srp", name: "Serbian", aliases: &["sr"] },
    Language { code: "hrv", name: "Croatian", aliases: &["hr"] },
    Language { code: "slv", name: "Slovenian", aliases: &["sl"] },
    Language { code: "tha", name: "Thai", aliases: &["th"] },
    Language { code: "vie", name: "Vietnamese", aliases: &["vi"] },
    Language { code: "ind", name: "Indonesian", aliases: &["id"] },
    Language { code: "may", name: "Malay", aliases: &["ms", "msa"] },
    Language { code: "per", name: "Persian", aliases: &["fa", "fas", "farsi"] },
    Language { code: "urd", name: "Urdu", aliases: &["ur"] },
    Language { code: "ben", name: "Bengali", aliases: &["bn"] },
    Language { code: "tam", name: "Tamil", aliases: &["ta"] },
    Language { code: "tel", name: "Telugu", aliases: &["te"] },
    Language { code: "tgl", name: "Tagalog", aliases: &["tl", "fil", "filipino"] },
];

/// Folds a raw provider language tag into ISO-639-2/B. Unknown tags map to
/// `None` and the candidate carrying them is dropped.
pub fn normalize(raw: &str) -> Option<&'static str> {
    let tag = raw.trim().to_lowercase();
    if tag.is_empty() {
        return None;
    }
    for language in LANGUAGES {
        if language.code == tag
            || language.name.to_lowercase() == tag
            || language.aliases.contains(&tag.as_str())
        {
            return Some(language.code);
        }
    }
    None
}

/// Human name used by listing pseudo-entries (`Make <LanguageName>`).
pub fn display_name(code: &str) -> Option<&'static str> {
    LANGUAGES
        .iter()
        .find(|language| language.code == code)
        .map(|language| language.name)
}

/// Two-letter tag understood by the OpenSubtitles API, when one exists.
pub fn to_opensubtitles_tag(code: &str) -> Option<&'static str> {
    if code == "pob" {
        return Some("pt-br");
    }
    if code == "chi" {
        return Some("zh-cn");
    }
    LANGUAGES
        .iter()
        .find(|language| language.code == code)
        .and_then(|language| language.aliases.first().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_common_tags() {
        assert_eq!(normalize("en"), Some("eng"));
        assert_eq!(normalize("eng"), Some("eng"));
        assert_eq!(normalize("English"), Some("eng"));
        assert_eq!(normalize("fra"), Some("fre"));
        assert_eq!(normalize("deu"), Some("ger"));
    }

    #[test]
    fn brazilian_portuguese_is_distinct() {
        assert_eq!(normalize("pt-br"), Some("pob"));
        assert_eq!(normalize("Brazilian"), Some("pob"));
        assert_eq!(normalize("pt"), Some("por"));
        assert_ne!(normalize("pt-br"), normalize("pt"));
    }

    #[test]
    fn unknown_tags_are_dropped() {
        assert_eq!(normalize("xx"), None);
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("klingon"), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(display_name("eng"), Some("English"));
        assert_eq!(display_name("pob"), Some("Portuguese (Brazil)"));
        assert_eq!(display_name("xxx"), None);
    }

    #[test]
    fn opensubtitles_tags() {
        assert_eq!(to_opensubtitles_tag("eng"), Some("en"));
        assert_eq!(to_opensubtitles_tag("pob"), Some("pt-br"));
    }
}
