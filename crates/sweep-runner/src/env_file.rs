//! Loader for shell-style environment files.
//!
//! An environment file declares one experiment as `key=value` lines, the way a
//! shell script exporting variables would. Only the subset a shell would treat
//! as plain assignments is accepted: comments, `export` prefixes, single and
//! double quotes, and `$NAME` / `${NAME}` substitution.

use crate::error::{Result, SweepError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Fields every environment file must define, in reporting order.
pub const REQUIRED_FIELDS: [&str; 7] = [
    "model",
    "target_lang",
    "save_folder",
    "data",
    "prompt",
    "hidden_base",
    "hidden_target",
];

pub const OPTIONAL_FIELDS: [&str; 3] = ["data_sample_size", "margin_variant", "device"];

/// One experiment configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentConfig {
    pub source: PathBuf,
    pub model: PathBuf,
    pub target_lang: String,
    pub save_folder: PathBuf,
    pub data: String,
    pub prompt: String,
    pub hidden_base: String,
    pub hidden_target: String,
    /// Kept as written; an empty value is distinct from an absent one here.
    pub data_sample_size: Option<String>,
    pub margin_variant: Option<String>,
    pub device: Option<String>,
}

impl EnvironmentConfig {
    /// File stem used to label work items and scheduler jobs.
    pub fn name(&self) -> String {
        self.source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("env")
            .to_string()
    }
}

pub fn load(path: &Path) -> Result<EnvironmentConfig> {
    if !path.is_file() {
        return Err(SweepError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let text = fs::read_to_string(path).map_err(|source| SweepError::ConfigUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    parse(path, &text)
}

/// Parse environment file contents. `path` is only used for error reporting.
pub fn parse(path: &Path, text: &str) -> Result<EnvironmentConfig> {
    let mut vars: HashMap<String, String> = HashMap::new();
    let mut fields: HashMap<String, String> = HashMap::new();

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = || SweepError::MalformedLine {
            path: path.to_path_buf(),
            line: line_no,
            content: raw_line.to_string(),
        };
        let line = line
            .strip_prefix("export ")
            .map(str::trim_start)
            .unwrap_or(line);
        let (key, raw_value) = line.split_once('=').ok_or_else(malformed)?;
        if !is_valid_name(key) {
            return Err(malformed());
        }

        let (value, undefined) = expand_value(raw_value, |name| {
            vars.get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
        })
        .map_err(|_| malformed())?;
        for name in undefined {
            warn!(
                file = %path.display(),
                line = line_no,
                variable = %name,
                "undefined variable expands to empty string"
            );
        }

        let field = key.to_ascii_lowercase();
        if REQUIRED_FIELDS.contains(&field.as_str()) || OPTIONAL_FIELDS.contains(&field.as_str()) {
            fields.insert(field, value.clone());
        } else {
            debug!(file = %path.display(), key, "ignoring unrecognized key");
        }
        vars.insert(key.to_string(), value);
    }

    for field in REQUIRED_FIELDS {
        let present = fields
            .get(field)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);
        if !present {
            return Err(SweepError::MissingRequiredField {
                path: path.to_path_buf(),
                field,
            });
        }
    }

    let data_sample_size = fields.remove("data_sample_size");
    let margin_variant = fields.remove("margin_variant");
    let device = fields.remove("device");
    let mut take = |name: &str| fields.remove(name).unwrap_or_default();
    Ok(EnvironmentConfig {
        source: path.to_path_buf(),
        model: PathBuf::from(take("model")),
        target_lang: take("target_lang"),
        save_folder: PathBuf::from(take("save_folder")),
        data: take("data"),
        prompt: take("prompt"),
        hidden_base: take("hidden_base"),
        hidden_target: take("hidden_target"),
        data_sample_size,
        margin_variant,
        device,
    })
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Expand quotes, escapes and substitutions in the right-hand side of an
/// assignment. Returns the value and the names that resolved to nothing.
fn expand_value<F>(raw: &str, lookup: F) -> std::result::Result<(String, Vec<String>), String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::new();
    let mut undefined = Vec::new();
    let mut chars = raw.trim().chars().peekable();
    let mut quote: Option<char> = None;
    let mut after_space = raw.starts_with(char::is_whitespace);
    // Length of `out` that came from quotes or escapes; trimming stops here.
    let mut literal_len = 0;

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('\''), '\'') => {
                quote = None;
                literal_len = out.len();
            }
            (Some('\''), _) => out.push(c),
            (Some('"'), '"') => {
                quote = None;
                literal_len = out.len();
            }
            (None, '\'') | (None, '"') => quote = Some(c),
            (None, '#') if after_space => break,
            (Some('"'), '\\') => match chars.peek() {
                Some(&next) if matches!(next, '"' | '\\' | '$' | '`') => {
                    out.push(next);
                    chars.next();
                }
                _ => out.push('\\'),
            },
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    out.push(next);
                    literal_len = out.len();
                }
            }
            (_, '$') => {
                let name = if chars.peek() == Some(&'{') {
                    chars.next();
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(ch) => name.push(ch),
                            None => return Err("unterminated ${".to_string()),
                        }
                    }
                    if !is_valid_name(&name) {
                        return Err(format!("bad substitution ${{{}}}", name));
                    }
                    name
                } else {
                    let mut name = String::new();
                    while let Some(&ch) = chars.peek() {
                        let ok = if name.is_empty() {
                            ch.is_ascii_alphabetic() || ch == '_'
                        } else {
                            ch.is_ascii_alphanumeric() || ch == '_'
                        };
                        if !ok {
                            break;
                        }
                        name.push(ch);
                        chars.next();
                    }
                    name
                };
                if name.is_empty() {
                    out.push('$');
                } else {
                    match lookup(&name) {
                        Some(v) => out.push_str(&v),
                        None => undefined.push(name),
                    }
                }
            }
            _ => out.push(c),
        }
        after_space = quote.is_none() && c.is_whitespace();
    }

    if quote.is_some() {
        return Err("unterminated quote".to_string());
    }
    let trimmed = out.trim_end().len().max(literal_len);
    out.truncate(trimmed);
    Ok((out, undefined))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const COMPLETE: &str = "\
MODEL=/models/llama
TARGET_LANG=gle_Latn
SAVE_FOLDER=/runs/gle
DATA=full
PROMPT=zero
HIDDEN_BASE=mean
HIDDEN_TARGET=last
";

    fn parse_text(text: &str) -> Result<EnvironmentConfig> {
        parse(Path::new("test.env"), text)
    }

    #[test]
    fn parses_complete_file() {
        let cfg = parse_text(COMPLETE).expect("complete file should parse");
        assert_eq!(cfg.model, PathBuf::from("/models/llama"));
        assert_eq!(cfg.target_lang, "gle_Latn");
        assert_eq!(cfg.save_folder, PathBuf::from("/runs/gle"));
        assert_eq!(cfg.hidden_target, "last");
        assert_eq!(cfg.data_sample_size, None);
        assert_eq!(cfg.name(), "test");
    }

    #[test]
    fn reports_each_missing_required_field() {
        for field in REQUIRED_FIELDS {
            let text: String = COMPLETE
                .lines()
                .filter(|l| !l.to_ascii_lowercase().starts_with(&format!("{}=", field)))
                .map(|l| format!("{}\n", l))
                .collect();
            match parse_text(&text) {
                Err(SweepError::MissingRequiredField { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected missing {}, got {:?}", field, other),
            }
        }
    }

    #[test]
    fn empty_required_value_counts_as_missing() {
        let text = COMPLETE.replace("PROMPT=zero", "PROMPT=\"\"");
        match parse_text(&text) {
            Err(SweepError::MissingRequiredField { field, .. }) => assert_eq!(field, "prompt"),
            other => panic!("expected missing prompt, got {:?}", other),
        }
    }

    #[test]
    fn handles_export_comments_and_quotes() {
        let text = "\
# experiment for Irish
export MODEL='/models/my model'
export TARGET_LANG=gle_Latn   # inline comment
SAVE_FOLDER=\"/runs/with \\\"quotes\\\"\"
DATA=sample
PROMPT=few
HIDDEN_BASE=mean
HIDDEN_TARGET=mean
DATA_SAMPLE_SIZE=250
";
        let cfg = parse_text(text).expect("parse");
        assert_eq!(cfg.model, PathBuf::from("/models/my model"));
        assert_eq!(cfg.target_lang, "gle_Latn");
        assert_eq!(cfg.save_folder, PathBuf::from("/runs/with \"quotes\""));
        assert_eq!(cfg.data_sample_size.as_deref(), Some("250"));
    }

    #[test]
    fn substitutes_earlier_keys() {
        let text = format!(
            "{}BASE=/scratch\nSAVE_FOLDER=${{BASE}}/out/$TARGET_LANG\nSINGLE='$BASE'\n",
            COMPLETE
        );
        let cfg = parse_text(&text).expect("parse");
        assert_eq!(cfg.save_folder, PathBuf::from("/scratch/out/gle_Latn"));
    }

    #[test]
    fn single_quotes_suppress_substitution() {
        let (value, undefined) =
            expand_value("'$HOME/x'", |_| Some("nope".to_string())).expect("expand");
        assert_eq!(value, "$HOME/x");
        assert!(undefined.is_empty());
    }

    #[test]
    fn undefined_variable_expands_empty_and_is_reported() {
        let (value, undefined) =
            expand_value("a${SWEEP_SURELY_UNSET_VAR}b", |_| None).expect("expand");
        assert_eq!(value, "ab");
        assert_eq!(undefined, vec!["SWEEP_SURELY_UNSET_VAR".to_string()]);
    }

    #[test]
    fn quoted_trailing_whitespace_survives_a_comment() {
        let (plain, _) = expand_value("'a '", |_| None).expect("plain");
        let (commented, _) = expand_value("'a ' # note", |_| None).expect("commented");
        assert_eq!(plain, "a ");
        assert_eq!(commented, "a ");

        let (double, _) = expand_value("\"b  \"   # note", |_| None).expect("double");
        assert_eq!(double, "b  ");
        let (escaped, _) = expand_value("c\\  # note", |_| None).expect("escaped");
        assert_eq!(escaped, "c ");
        let (bare, _) = expand_value("d   # note", |_| None).expect("bare");
        assert_eq!(bare, "d");
    }

    #[test]
    fn quoted_save_folder_keeps_trailing_space_before_comment() {
        let text = COMPLETE.replace("SAVE_FOLDER=/runs/gle", "SAVE_FOLDER='/runs/gle ' # note");
        let cfg = parse_text(&text).expect("parse");
        assert_eq!(cfg.save_folder, PathBuf::from("/runs/gle "));
    }

    #[cfg(unix)]
    #[test]
    fn substitution_falls_back_to_process_environment() {
        let path = std::env::var("PATH").expect("PATH is set");
        let text = format!("{}DEVICE=${{PATH}}\nMARGIN_VARIANT=$PATH\n", COMPLETE);
        let cfg = parse_text(&text).expect("parse");
        assert_eq!(cfg.device.as_deref(), Some(path.as_str()));
        assert_eq!(cfg.margin_variant.as_deref(), Some(path.as_str()));
    }

    #[cfg(unix)]
    #[test]
    fn file_keys_shadow_process_environment() {
        assert!(std::env::var("PATH").is_ok());
        let text = format!("{}PATH=/file/bin\nDEVICE=$PATH/cuda\n", COMPLETE);
        let cfg = parse_text(&text).expect("parse");
        assert_eq!(cfg.device.as_deref(), Some("/file/bin/cuda"));
    }

    #[test]
    fn keys_are_case_insensitive_and_later_wins() {
        let text = format!("{}prompt=few\n", COMPLETE);
        let cfg = parse_text(&text).expect("parse");
        assert_eq!(cfg.prompt, "few");
    }

    #[test]
    fn empty_optional_value_is_kept_as_present() {
        let text = format!("{}DATA_SAMPLE_SIZE=\n", COMPLETE);
        let cfg = parse_text(&text).expect("parse");
        assert_eq!(cfg.data_sample_size.as_deref(), Some(""));
    }

    #[test]
    fn rejects_lines_without_assignment() {
        let text = format!("{}echo hello\n", COMPLETE);
        match parse_text(&text) {
            Err(SweepError::MalformedLine { line, .. }) => assert_eq!(line, 8),
            other => panic!("expected malformed line, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unterminated_quote() {
        let text = format!("{}DEVICE=\"cuda\n", COMPLETE);
        assert!(matches!(
            parse_text(&text),
            Err(SweepError::MalformedLine { .. })
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let path = std::env::temp_dir().join(format!(
            "sweep_missing_{}_{}.env",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        assert!(matches!(load(&path), Err(SweepError::ConfigNotFound { .. })));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = std::env::temp_dir().join(format!(
            "sweep_env_load_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("gle.env");
        fs::write(&path, COMPLETE).expect("write");
        let cfg = load(&path).expect("load");
        assert_eq!(cfg.source, path);
        assert_eq!(cfg.name(), "gle");
        let _ = fs::remove_dir_all(dir);
    }
}
