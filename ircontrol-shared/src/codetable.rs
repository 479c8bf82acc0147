use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use crate::code::{parse_value, IrCode, Protocol};

/// Problems found while parsing a code definition source. None of them abort the load.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadWarning {
    #[error("line {line}: unknown protocol `{token}`, skipped")]
    UnknownProtocol { line: usize, token: String },
    #[error("line {line}: malformed `{text}`, skipped")]
    MalformedLine { line: usize, text: String },
    #[error("line {line}: overwriting duplicate code {code}, `{previous}` becomes `{name}`")]
    DuplicateCode {
        line: usize,
        code: IrCode,
        previous: String,
        name: String,
    },
    #[error("line {line}: unknown directive `@{key}`, ignored")]
    UnknownDirective { line: usize, key: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CodeTableError {
    #[error("code source {} not found", path.display())]
    SourceNotFound { path: PathBuf },
    #[error("reading code source {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// The result of parsing one code definition source.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CodeSource {
    /// Names with the preset applied, in file order.
    pub entries: Vec<(String, IrCode)>,
    pub warnings: Vec<LoadWarning>,
}

/// Parse the line based code format.
///
/// ```text
/// # comment
/// @preset samsung_tv_
/// SAMSUNG 32 0xE0E040BF standby
/// NEC 32 536929905 volup
/// ```
///
/// `preset` overrides an `@preset` directive found in the source.
pub fn load_from_text(text: &str, preset: Option<&str>) -> CodeSource {
    let mut entries: Vec<(String, IrCode)> = Vec::new();
    let mut warnings = Vec::new();
    let mut seen: HashMap<IrCode, usize> = HashMap::new();
    let mut default_preset = String::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(directive) = trimmed.strip_prefix('@') {
            let mut parts = directive.splitn(2, char::is_whitespace);
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default().trim();
            match key {
                "preset" => default_preset = value.to_string(),
                _ => warnings.push(LoadWarning::UnknownDirective {
                    line,
                    key: key.to_string(),
                }),
            }
            continue;
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        let (protocol, bits, value, name) = match tokens[..] {
            [p, b, v, n] => (p, b, v, n),
            _ => {
                warnings.push(LoadWarning::MalformedLine {
                    line,
                    text: trimmed.to_string(),
                });
                continue;
            }
        };

        let protocol = match Protocol::from_name(protocol) {
            Some(p) => p,
            None => {
                warnings.push(LoadWarning::UnknownProtocol {
                    line,
                    token: protocol.to_string(),
                });
                continue;
            }
        };

        let (bits, value) = match (bits.parse::<u8>().ok(), parse_value(value)) {
            (Some(b), Some(v)) => (b, v),
            _ => {
                warnings.push(LoadWarning::MalformedLine {
                    line,
                    text: trimmed.to_string(),
                });
                continue;
            }
        };

        let code = IrCode::new(protocol, bits, value);
        match seen.get(&code) {
            Some(&at) => {
                let previous = std::mem::replace(&mut entries[at].0, name.to_string());
                warnings.push(LoadWarning::DuplicateCode {
                    line,
                    code,
                    previous,
                    name: name.to_string(),
                });
            }
            None => {
                seen.insert(code, entries.len());
                entries.push((name.to_string(), code));
            }
        }
    }

    let preset = preset.unwrap_or(&default_preset);
    for (name, _) in entries.iter_mut() {
        name.insert_str(0, preset);
    }
    for warning in warnings.iter_mut() {
        if let LoadWarning::DuplicateCode { previous, name, .. } = warning {
            previous.insert_str(0, preset);
            name.insert_str(0, preset);
        }
    }

    CodeSource { entries, warnings }
}

/// Bidirectional name and code lookup.
///
/// The code to name direction is authoritative: when two names claim the same code the
/// one merged last wins. A name keeps the first code it was bound to.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CodeTable {
    by_name: HashMap<String, IrCode>,
    by_code: HashMap<IrCode, String>,
}

impl CodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge parsed entries into the table, returns the number of entries processed.
    pub fn merge<I>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, IrCode)>,
    {
        entries
            .into_iter()
            .map(|(name, code)| self.add_code(name, code))
            .count()
    }

    pub fn add_code(&mut self, name: impl Into<String>, code: IrCode) {
        let name = name.into();

        match self.by_name.get(&name) {
            Some(bound) if *bound != code => {
                warn!(
                    "Name {} already bound to {}, not rebinding to {}",
                    name, bound, code
                );
            }
            Some(_) => {}
            None => {
                self.by_name.insert(name.clone(), code);
            }
        }

        if let Some(previous) = self.by_code.insert(code, name) {
            let current = &self.by_code[&code];
            if previous != *current {
                warn!("Code {} was {}, now {}", code, previous, current);
            }
        }
    }

    /// Load a code file and merge it.
    ///
    /// Warnings are logged and the remaining lines are still merged. A missing file
    /// leaves the table untouched.
    pub fn load_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        preset: Option<&str>,
    ) -> Result<usize, CodeTableError> {
        let path = path.as_ref();

        let text = fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                error!("Code source {} not found", path.display());
                CodeTableError::SourceNotFound {
                    path: path.to_path_buf(),
                }
            } else {
                CodeTableError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let source = load_from_text(&text, preset);
        for warning in &source.warnings {
            warn!("{}: {}", path.display(), warning);
        }

        let merged = self.merge(source.entries);
        debug!("Loaded {} codes from {}", merged, path.display());

        Ok(merged)
    }

    pub fn lookup_name_for_code(&self, code: &IrCode) -> Option<&str> {
        self.by_code.get(code).map(String::as_str)
    }

    pub fn lookup_code_for_name(&self, name: &str) -> Option<IrCode> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &IrCode)> {
        self.by_name.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Render the table in the code file format, sorted by name.
    ///
    /// Every code is written once, with the name it resolves to, so reloading the text
    /// restores every code lookup. A source binds a code to a single name, so names that
    /// only alias a code owned by another name are written as `# alias:` comments and do
    /// not survive a reload.
    pub fn to_text(&self) -> String {
        let mut owned: Vec<(&str, &IrCode)> = self
            .by_code
            .iter()
            .map(|(code, name)| (name.as_str(), code))
            .collect();
        // A name's own code goes first, so the reload binds the name to it again.
        owned.sort_by_key(|(name, code)| {
            (*name, self.by_name.get(*name) != Some(*code), code.tuple())
        });

        let mut aliases: Vec<(&str, &IrCode)> = self
            .by_name
            .iter()
            .filter(|(name, code)| {
                self.by_code.get(*code).map(String::as_str) != Some(name.as_str())
            })
            .map(|(name, code)| (name.as_str(), code))
            .collect();
        aliases.sort_by_key(|(name, _)| *name);

        let mut out = String::new();
        for (name, code) in owned {
            let _ = writeln!(out, "{} {}", code.to_config_line(), name);
        }
        for (name, code) in aliases {
            let _ = writeln!(out, "# alias: {} {}", code.to_config_line(), name);
        }
        out
    }
}
