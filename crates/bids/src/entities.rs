use std::collections::BTreeMap;
use std::path::Path;

/// Entity name to value for a single file, keyed by long entity names.
pub type Entities = BTreeMap<String, String>;

const ENTITY_ALIASES: &[(&str, &str)] = &[
    ("sub", "subject"),
    ("ses", "session"),
    ("acq", "acquisition"),
    ("ce", "ceagent"),
    ("rec", "reconstruction"),
    ("dir", "direction"),
];

const NUMERIC_ENTITIES: &[&str] = &["run", "echo", "flip", "inv", "mt"];

const DATATYPES: &[&str] = &[
    "anat", "func", "dwi", "fmap", "perf", "meg", "eeg", "ieeg", "beh", "pet", "micr", "nirs",
    "motion",
];

/// Entities that describe the file type rather than the acquisition.
pub const FILE_TYPE_ENTITIES: &[&str] = &["suffix", "extension", "datatype"];

/// Maps a filename key (`sub`, `acq`, ...) to its long entity name.
pub fn long_name(key: &str) -> &str {
    ENTITY_ALIASES
        .iter()
        .find(|(short, _)| *short == key)
        .map(|(_, long)| *long)
        .unwrap_or(key)
}

pub fn is_numeric(entity: &str) -> bool {
    NUMERIC_ENTITIES.contains(&entity)
}

/// Compares two entity values, numerically for index-like entities.
pub fn values_equal(entity: &str, left: &str, right: &str) -> bool {
    if is_numeric(entity) {
        if let (Ok(l), Ok(r)) = (left.parse::<u64>(), right.parse::<u64>()) {
            return l == r;
        }
    }
    left == right
}

/// Splits a filename into its stem and extension; the extension keeps its leading dot.
pub fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.find('.') {
        Some(0) | None => (file_name, ""),
        Some(idx) => file_name.split_at(idx),
    }
}

pub fn parse_entities(path: &Path) -> Entities {
    let mut entities = Entities::new();
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        return entities;
    };
    let (stem, extension) = split_extension(file_name);
    let tokens: Vec<&str> = stem.split('_').filter(|t| !t.is_empty()).collect();
    for (idx, token) in tokens.iter().enumerate() {
        match token.split_once('-') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                entities.insert(long_name(key).to_string(), value.to_string());
            }
            _ if idx + 1 == tokens.len() => {
                entities.insert("suffix".to_string(), token.to_string());
            }
            _ => {}
        }
    }
    if !extension.is_empty() {
        entities.insert("extension".to_string(), extension.to_string());
    }
    let datatype = path
        .parent()
        .and_then(|dir| dir.file_name())
        .and_then(|name| name.to_str())
        .filter(|name| DATATYPES.contains(name));
    if let Some(datatype) = datatype {
        entities.insert("datatype".to_string(), datatype.to_string());
    }
    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_names_and_derived_entities() {
        let path = Path::new("/data/sub-01/ses-2/func/sub-01_ses-2_task-rest_acq-mb_echo-1_bold.nii.gz");
        let entities = parse_entities(path);
        assert_eq!(entities.get("subject").map(String::as_str), Some("01"));
        assert_eq!(entities.get("session").map(String::as_str), Some("2"));
        assert_eq!(entities.get("acquisition").map(String::as_str), Some("mb"));
        assert_eq!(entities.get("echo").map(String::as_str), Some("1"));
        assert_eq!(entities.get("suffix").map(String::as_str), Some("bold"));
        assert_eq!(entities.get("extension").map(String::as_str), Some(".nii.gz"));
        assert_eq!(entities.get("datatype").map(String::as_str), Some("func"));
    }

    #[test]
    fn top_level_sidecar_has_no_subject_or_datatype() {
        let entities = parse_entities(Path::new("/data/task-rest_bold.json"));
        assert!(!entities.contains_key("subject"));
        assert!(!entities.contains_key("datatype"));
        assert_eq!(entities.get("task").map(String::as_str), Some("rest"));
        assert_eq!(entities.get("extension").map(String::as_str), Some(".json"));
    }

    #[test]
    fn numeric_entities_ignore_zero_padding() {
        assert!(values_equal("echo", "01", "1"));
        assert!(!values_equal("task", "01", "1"));
        assert!(!values_equal("run", "2", "1"));
    }

    #[test]
    fn dotfiles_keep_full_name_as_stem() {
        assert_eq!(split_extension(".bidsignore"), (".bidsignore", ""));
        assert_eq!(split_extension("README"), ("README", ""));
    }
}
