use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::CommandHook;
use crate::Config;
use crate::Error;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

/// A throwaway confdir with `conf.d/`, `templates/` and `out/`.
pub struct ResourceTree {
    pub dir: TempDir,
}

impl ResourceTree {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp confdir");
        fs::create_dir_all(dir.path().join("conf.d")).expect("create conf.d");
        fs::create_dir_all(dir.path().join("templates")).expect("create templates");
        fs::create_dir_all(dir.path().join("out")).expect("create out");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn out(
        &self,
        name: &str,
    ) -> PathBuf {
        self.root().join("out").join(name)
    }

    pub fn write_template(
        &self,
        name: &str,
        content: &str,
    ) {
        fs::write(self.root().join("templates").join(name), content).expect("write template");
    }

    pub fn write_descriptor(
        &self,
        name: &str,
        content: &str,
    ) {
        fs::write(self.root().join("conf.d").join(name), content).expect("write descriptor");
    }

    /// One-shot config rooted at this tree
    pub fn config(&self) -> Config {
        Config {
            confdir: self.root().to_path_buf(),
            onetime: true,
            ..Default::default()
        }
    }
}

/// Every hook invocation: (hook name, dest, command, failed)
pub type HookLog = Arc<Mutex<Vec<(String, PathBuf, String, bool)>>>;

pub fn recording_hook(
    name: &str,
    log: HookLog,
) -> CommandHook {
    let name = name.to_string();
    Arc::new(move |dest: &Path, cmd: &str, err: Option<&Error>| {
        log.lock()
            .push((name.clone(), dest.to_path_buf(), cmd.to_string(), err.is_some()));
    })
}

/// Descriptor for `name.tmpl` rendered into `out/name`
pub fn descriptor(
    name: &str,
    keys: &[&str],
    check_cmd: &str,
    reload_cmd: &str,
) -> String {
    let keys = keys.iter().map(|k| format!("\"{k}\"")).collect::<Vec<_>>().join(", ");
    format!(
        r#"[template]
src = "{name}.tmpl"
dest = "${{RUNTIME_CONFDIR}}/out/{name}"
prefix = "/app"
keys = [{keys}]
mode = "0644"
check_cmd = "{check_cmd}"
reload_cmd = "{reload_cmd}"
"#
    )
}
