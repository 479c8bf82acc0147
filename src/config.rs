use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, error, info, warn};
use serde::Deserialize;

use ircontrol_shared::{CodeTable, IrCode};

use crate::actions::{Action, ActionRegistry, EmitTarget, Executor};

pub const DEFAULT_CONFIG: &str = "ircontrol.yml";
pub const DEFAULT_SERIAL: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUDRATE: u32 = 9600;
pub const DEFAULT_TCP_HOST: &str = "127.0.0.1";
pub const DEFAULT_TCP_PORT: u16 = 9999;
pub const DEFAULT_MAX_CONCURRENT_ACTIONS: usize = 16;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

/// (De)serialize an [`IrCode`] as `"SAMSUNG 32 0xE0E040BF"`.
pub mod code_line {
    use ircontrol_shared::IrCode;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(code: &IrCode, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&code.to_config_line())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<IrCode, D::Error> {
        let line = String::deserialize(deserializer)?;
        line.parse()
            .map_err(|e| de::Error::custom(format!("`{}`: {}", line, e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeFile {
    pub path: PathBuf,
    #[serde(default)]
    pub preset: Option<String>,
}

/// Inline code definitions, nested groups ending in codes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CodeNode {
    Code(#[serde(with = "code_line")] IrCode),
    Group(BTreeMap<String, CodeNode>),
}

/// Contents of the YAML configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub serial: Option<String>,
    pub baudrate: Option<u32>,
    pub tcp_host: Option<String>,
    pub tcp_port: Option<u16>,
    pub code_files: Vec<CodeFile>,
    pub codes: BTreeMap<String, CodeNode>,
    pub actions: BTreeMap<String, Action>,
    pub max_concurrent_actions: Option<usize>,
    pub max_connections: Option<usize>,
    pub shutdown_grace_ms: Option<u64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Like [`ConfigFile::load`], but a missing file gives the defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Flatten the group tree into `group_subgroup_name` entries.
pub fn flatten_codes(tree: &BTreeMap<String, CodeNode>) -> Vec<(String, IrCode)> {
    fn walk(prefix: &str, tree: &BTreeMap<String, CodeNode>, out: &mut Vec<(String, IrCode)>) {
        for (key, node) in tree {
            let name = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}_{}", prefix, key)
            };
            match node {
                CodeNode::Code(code) => out.push((name, *code)),
                CodeNode::Group(group) => walk(&name, group, out),
            }
        }
    }

    let mut out = Vec::new();
    walk("", tree, &mut out);
    out
}

/// Load every code file in order, then the inline codes.
///
/// A missing or unreadable file is logged and skipped.
pub fn load_codes(file: &ConfigFile, base_dir: &Path) -> CodeTable {
    let mut codes = CodeTable::new();

    for source in &file.code_files {
        let path = base_dir.join(&source.path);
        if let Err(e) = codes.load_file(&path, source.preset.as_deref()) {
            error!("{}", e);
        }
    }

    let inline = codes.merge(flatten_codes(&file.codes));
    debug!("{} inline codes, {} names total", inline, codes.len());

    codes
}

pub fn load_actions(file: &ConfigFile, codes: &CodeTable, executor: Executor) -> ActionRegistry {
    let mut actions = ActionRegistry::new(executor);

    for (name, action) in &file.actions {
        if codes.lookup_code_for_name(name).is_none() {
            warn!("Action {} is bound to a name without a code", name);
        }
        if let Action::Emit {
            target: EmitTarget::Name(target),
        } = action
        {
            if codes.lookup_code_for_name(target).is_none() {
                warn!("Action {} emits unknown name {}", name, target);
            }
        }
        actions.register(name.clone(), action.clone());
    }

    actions
}

/// Everything the dispatcher and the command ingress share, built once at startup.
#[derive(Debug)]
pub struct Config {
    pub codes: CodeTable,
    pub actions: ActionRegistry,
}

impl Config {
    pub fn new(codes: CodeTable, actions: ActionRegistry) -> Self {
        Config { codes, actions }
    }

    pub fn build(file: &ConfigFile, base_dir: &Path) -> anyhow::Result<Self> {
        let executor = Executor::new(
            file.max_concurrent_actions
                .unwrap_or(DEFAULT_MAX_CONCURRENT_ACTIONS),
        )?;
        let codes = load_codes(file, base_dir);
        let actions = load_actions(file, &codes, executor);

        Ok(Config::new(codes, actions))
    }
}
