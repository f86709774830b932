pub const AUTO: &str = "AUTO";

/// Interface language code to Tesseract traineddata name.
const TESSERACT_LANGUAGES: &[(&str, &str)] = &[
    ("AUTO", "eng"),
    ("AR", "ara"),
    ("BG", "bul"),
    ("CS", "ces"),
    ("DA", "dan"),
    ("DE", "deu"),
    ("EL", "ell"),
    ("EN", "eng"),
    ("ES", "spa"),
    ("ET", "est"),
    ("FI", "fin"),
    ("FR", "fra"),
    ("HU", "hun"),
    ("ID", "ind"),
    ("IT", "ita"),
    ("JA", "jpn"),
    ("KO", "kor"),
    ("LT", "lit"),
    ("LV", "lav"),
    ("NB", "nor"),
    ("NL", "nld"),
    ("PL", "pol"),
    ("PT", "por"),
    ("RO", "ron"),
    ("RU", "rus"),
    ("SK", "slk"),
    ("SL", "slv"),
    ("SV", "swe"),
    ("TR", "tur"),
    ("UK", "ukr"),
    ("ZH", "chi_sim"),
];

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

pub fn is_auto(code: &str) -> bool {
    let code = normalize_code(code);
    code.is_empty() || code == AUTO
}

pub fn is_supported(code: &str) -> bool {
    let code = normalize_code(code);
    TESSERACT_LANGUAGES.iter().any(|(key, _)| *key == code)
}

/// Unknown codes fall back to English.
pub fn tesseract_language(code: &str) -> &'static str {
    let code = normalize_code(code);
    TESSERACT_LANGUAGES
        .iter()
        .find(|(key, _)| *key == code)
        .map(|(_, value)| *value)
        .unwrap_or("eng")
}

/// Translation is pointless when a concrete source already equals the target.
pub fn same_language(source: &str, target: &str) -> bool {
    !is_auto(source) && normalize_code(source) == normalize_code(target)
}
