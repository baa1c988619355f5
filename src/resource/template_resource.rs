use std::path::Path;

use serde::Deserialize;

use crate::constants::OWNER_SENTINEL;
use crate::constants::RUNTIME_CONFDIR_PLACEHOLDER;
use crate::utils::file_io::parse_mode;
use crate::Result;

/// One convergence unit: a template and the file it renders into.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TemplateResource {
    /// Template path, relative to `confdir/templates` unless absolute
    pub src: String,

    /// Destination file
    pub dest: String,

    /// Key prefix owning this resource
    #[serde(default)]
    pub prefix: String,

    /// Keys relative to `prefix`
    #[serde(default)]
    pub keys: Vec<String>,

    /// Octal permission string, empty to inherit from the destination
    #[serde(default)]
    pub mode: String,

    #[serde(default = "default_owner")]
    pub uid: i64,

    #[serde(default = "default_owner")]
    pub gid: i64,

    /// Validation command, `{{ src }}` expands to the staged file
    #[serde(default)]
    pub check_cmd: String,

    #[serde(default)]
    pub reload_cmd: String,

    /// PEM private key for the decrypting template accessors
    #[serde(skip)]
    pub private_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TemplateResourceFile {
    pub(crate) template: TemplateResource,
}

fn default_owner() -> i64 {
    OWNER_SENTINEL
}

impl TemplateResource {
    /// `prefix` joined with every key. Recomputed on each call.
    pub fn abs_keys(&self) -> Vec<String> {
        self.keys.iter().map(|k| join_key(&self.prefix, k)).collect()
    }

    /// Parsed `mode`, `None` when not declared
    pub fn file_mode(&self) -> Result<Option<u32>> {
        if self.mode.trim().is_empty() {
            return Ok(None);
        }
        parse_mode(&self.mode).map(Some)
    }

    /// Substitutes the confdir placeholder in paths and commands
    pub(crate) fn expand_placeholders(
        &mut self,
        confdir: &Path,
    ) {
        let confdir = confdir.to_string_lossy();
        for field in [&mut self.dest, &mut self.check_cmd, &mut self.reload_cmd] {
            if field.contains(RUNTIME_CONFDIR_PLACEHOLDER) {
                *field = field.replace(RUNTIME_CONFDIR_PLACEHOLDER, &confdir);
            }
        }
    }
}

/// Joins key segments into one clean absolute key.
///
/// `join_key("/app", "worker_count") == "/app/worker_count"`; repeated and
/// trailing slashes are dropped, `.`/`..` segments resolved.
pub fn join_key(
    prefix: &str,
    key: &str,
) -> String {
    let mut terms: Vec<&str> = Vec::new();
    for term in prefix.split('/').chain(key.split('/')) {
        match term {
            "" | "." => {}
            ".." => {
                terms.pop();
            }
            t => terms.push(t),
        }
    }
    format!("/{}", terms.join("/"))
}
