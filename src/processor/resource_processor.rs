use std::collections::HashMap;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use nix::unistd::getegid;
use nix::unistd::geteuid;
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backends::key_pairs;
use crate::backends::remap_with_pairs;
use crate::constants::OWNER_SENTINEL;
use crate::metrics::COMMAND_FAILURES;
use crate::metrics::FILE_WRITES;
use crate::metrics::PASS_LATENCY_METRIC;
use crate::metrics::RESOURCE_PASSES;
use crate::template::render_command;
use crate::template::render_template;
use crate::utils::command::run_shell;
use crate::utils::file_io::create_parent_dir_if_not_exist;
use crate::utils::file_io::existing_mode;
use crate::utils::file_io::is_same_config;
use crate::utils::file_io::path_error;
use crate::utils::file_io::replace_file;
use crate::utils::file_io::set_mode;
use crate::utils::file_io::set_owner;
use crate::utils::file_io::ReplaceOutcome;
use crate::utils::file_io::DEFAULT_FILE_MODE;
use crate::BackendClient;
use crate::BackendError;
use crate::CommandHook;
use crate::Config;
use crate::Decryptor;
use crate::Error;
use crate::KvStore;
use crate::Result;
use crate::SyncError;
use crate::SystemError;
use crate::TemplateError;
use crate::TemplateFunc;
use crate::TemplateResource;
use crate::join_key;

/// Binds one [`TemplateResource`] to a backend client and converges its
/// destination file.
///
/// Built once per resource per call and reused across passes.
pub struct TemplateResourceProcessor {
    resource: TemplateResource,
    src: PathBuf,
    dest: PathBuf,
    uid: u32,
    gid: u32,
    store: KvStore,
    funcs: TemplateFunc,
    client: Arc<dyn BackendClient>,
    config: Arc<Config>,
    cursor: u64,
}

impl TemplateResourceProcessor {
    pub fn new(
        mut resource: TemplateResource,
        config: Arc<Config>,
        client: Arc<dyn BackendClient>,
    ) -> Result<Self> {
        if let Some(prefix) = &config.prefix {
            resource.prefix = prefix.clone();
        }

        let src = PathBuf::from(&resource.src);
        let src = if src.is_absolute() {
            src
        } else {
            config.templates_dir().join(src)
        };
        let dest = PathBuf::from(&resource.dest);
        let uid = resolve_owner(resource.uid, geteuid().as_raw(), &dest)?;
        let gid = resolve_owner(resource.gid, getegid().as_raw(), &dest)?;

        let decryptor = match &resource.private_key {
            Some(pem) => Some(Arc::new(Decryptor::from_pem(pem)?)),
            None => None,
        };
        let store = KvStore::new();
        let funcs = TemplateFunc::new(store.clone(), decryptor, config.hooks.template_key_adjuster.clone());

        Ok(Self {
            resource,
            src,
            dest,
            uid,
            gid,
            store,
            funcs,
            client,
            config,
            cursor: 0,
        })
    }

    pub fn resource(&self) -> &TemplateResource {
        &self.resource
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    /// Last watch cursor, zero before the first watch
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Runs one full pass: mode, fetch, render, compare, replace.
    pub async fn process(&self) -> Result<()> {
        let started = Instant::now();
        let dest = self.dest_label();
        let result = self.sync_pass().await;

        PASS_LATENCY_METRIC
            .with_label_values(&[dest.as_str()])
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        let outcome = if result.is_ok() { "ok" } else { "error" };
        RESOURCE_PASSES.with_label_values(&[dest.as_str(), outcome]).inc();
        if let Err(e) = &result {
            error!(dest = %dest, "resource pass failed: {}", e);
        }
        result
    }

    async fn sync_pass(&self) -> Result<()> {
        let mode = self.set_file_mode()?;
        self.set_vars().await?;
        let staged = self.create_stage_file(mode).await?;
        self.sync(staged, mode).await
    }

    /// Blocks until the backend reports a change on this resource's keys.
    ///
    /// Returns `false` when `stop` fired first. The stored cursor only
    /// advances on success.
    pub async fn wait_for_change(
        &mut self,
        stop: CancellationToken,
    ) -> Result<bool> {
        let prefix = self.adjust_key(&join_key(&self.resource.prefix, ""));
        let keys: Vec<String> = self.resource.abs_keys().iter().map(|k| self.adjust_key(k)).collect();
        let cursor = self.client.watch_prefix(&prefix, &keys, self.cursor, stop.clone()).await?;
        if stop.is_cancelled() {
            return Ok(false);
        }
        debug!(dest = %self.dest.display(), "watch cursor {} -> {}", self.cursor, cursor);
        self.cursor = cursor;
        Ok(true)
    }

    fn dest_label(&self) -> String {
        self.dest.to_string_lossy().into_owned()
    }

    fn adjust_key(
        &self,
        key: &str,
    ) -> String {
        match &self.config.hooks.abs_key_adjuster {
            Some(hook) => hook(key),
            None => key.to_string(),
        }
    }

    /// Explicit mode, else the destination's current mode, else 0644.
    fn set_file_mode(&self) -> Result<u32> {
        if let Some(mode) = self.resource.file_mode()? {
            return Ok(mode);
        }
        Ok(existing_mode(&self.dest)?.unwrap_or(DEFAULT_FILE_MODE))
    }

    /// Fetches the resource keys and swaps them into the store, keyed
    /// relative to the resource prefix.
    async fn set_vars(&self) -> Result<()> {
        let logical = self.resource.abs_keys();
        let pairs = key_pairs(&logical, |k| self.adjust_key(k));
        let real: Vec<String> = pairs.iter().map(|(_, r)| r.clone()).collect();

        debug!(dest = %self.dest.display(), "retrieving keys {:?}", real);
        let values = tokio::time::timeout(self.config.retry.timeout(), self.client.get_values(&real))
            .await
            .map_err(|_| BackendError::RetryTimeout)??;

        let entries: HashMap<String, String> = values
            .into_iter()
            .map(|(k, v)| (strip_prefix(&self.resource.prefix, &remap_with_pairs(&pairs, &k)), v))
            .collect();
        self.store.replace_all(entries);
        Ok(())
    }

    /// Renders the template into a temporary file next to the destination.
    async fn create_stage_file(
        &self,
        mode: u32,
    ) -> Result<TempPath> {
        let source = match tokio::fs::read_to_string(&self.src).await {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TemplateError::MissingSource(self.src.clone()).into());
            }
            Err(e) => return Err(path_error(&self.src, e)),
        };

        let name = self.resource.src.clone();
        let funcs = self.funcs.clone();
        let extra = self.config.func_map.clone();
        let rendered = tokio::task::spawn_blocking(move || render_template(&name, &source, &funcs, &extra))
            .await
            .map_err(SystemError::TaskFailed)??;

        create_parent_dir_if_not_exist(&self.dest)?;
        let dir = match self.dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self
            .dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut staged = tempfile::Builder::new()
            .prefix(&format!(".{file_name}"))
            .tempfile_in(&dir)
            .map_err(|e| path_error(&dir, e))?;
        staged
            .write_all(rendered.as_bytes())
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|e| path_error(staged.path(), e))?;

        let staged = staged.into_temp_path();
        set_mode(&staged, mode)?;
        set_owner(&staged, self.uid, self.gid)?;
        debug!(dest = %self.dest.display(), "staged {:?}", staged);
        Ok(staged)
    }

    async fn sync(
        &self,
        staged: TempPath,
        mode: u32,
    ) -> Result<()> {
        if is_same_config(&staged, &self.dest).await? {
            debug!(dest = %self.dest.display(), "target config in sync");
            self.discard(staged);
            return Ok(());
        }
        info!(dest = %self.dest.display(), "target config out of sync");

        if self.config.noop {
            warn!(dest = %self.dest.display(), "noop mode enabled, target not updated");
            self.discard(staged);
            return Ok(());
        }

        if !self.config.sync_only && !self.resource.check_cmd.trim().is_empty() {
            let result = self.check(&staged).await;
            self.fire(&self.config.hooks.on_check_cmd_done, &self.resource.check_cmd, &result);
            if let Err(e) = result {
                self.discard(staged);
                return Err(e);
            }
        }

        let result = replace_file(&staged, &self.dest, mode, self.uid, self.gid).map(|outcome| {
            if outcome == ReplaceOutcome::Copied {
                warn!(dest = %self.dest.display(), "destination replaced by copy");
            }
        });
        self.fire(&self.config.hooks.on_update_done, "", &result);
        if result.is_ok() {
            // the staged path no longer exists, do not unlink it on drop
            let _ = staged.keep();
            FILE_WRITES.with_label_values(&[self.dest_label().as_str()]).inc();
            info!(dest = %self.dest.display(), "target config has been updated");
        }
        result?;

        if !self.config.sync_only && !self.resource.reload_cmd.trim().is_empty() {
            let result = self.reload().await;
            self.fire(&self.config.hooks.on_reload_cmd_done, &self.resource.reload_cmd, &result);
            result?;
        }
        Ok(())
    }

    async fn check(
        &self,
        staged: &Path,
    ) -> Result<()> {
        let cmd = render_command(&self.resource.check_cmd, &staged.to_string_lossy())?;
        debug!(dest = %self.dest.display(), cmd = %cmd, "running check command");
        let outcome = run_shell(&cmd).await?;
        if !outcome.success {
            COMMAND_FAILURES
                .with_label_values(&[self.dest_label().as_str(), "check"])
                .inc();
            return Err(SyncError::CheckFailed {
                cmd,
                status: outcome.status,
                output: outcome.output,
            }
            .into());
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        let cmd = self.resource.reload_cmd.clone();
        debug!(dest = %self.dest.display(), cmd = %cmd, "running reload command");
        let outcome = run_shell(&cmd).await?;
        if !outcome.success {
            COMMAND_FAILURES
                .with_label_values(&[self.dest_label().as_str(), "reload"])
                .inc();
            return Err(SyncError::ReloadFailed {
                cmd,
                status: outcome.status,
                output: outcome.output,
            }
            .into());
        }
        Ok(())
    }

    fn fire(
        &self,
        hook: &Option<CommandHook>,
        cmd: &str,
        result: &Result<()>,
    ) {
        if let Some(hook) = hook {
            hook(&self.dest, cmd, result.as_ref().err());
        }
    }

    fn discard(
        &self,
        staged: TempPath,
    ) {
        if self.config.keep_stage_file {
            match staged.keep() {
                Ok(path) => info!(dest = %self.dest.display(), "keeping staged file {:?}", path),
                Err(e) => warn!("cannot keep staged file: {}", e),
            }
        }
    }
}

/// Maps the `-1` sentinel to the effective id of the process.
fn resolve_owner(
    id: i64,
    effective: u32,
    dest: &Path,
) -> Result<u32> {
    if id == OWNER_SENTINEL {
        return Ok(effective);
    }
    u32::try_from(id).map_err(|_| {
        Error::Template(TemplateError::InvalidResource {
            path: dest.to_path_buf(),
            reason: format!("invalid owner id {id}"),
        })
    })
}

/// `/app/worker_count` under prefix `/app` (or `app`) becomes
/// `/worker_count`. Keys outside the prefix, such as `/application/x`,
/// are kept whole.
pub(super) fn strip_prefix(
    prefix: &str,
    key: &str,
) -> String {
    let prefix = join_key(prefix, "");
    if prefix == "/" {
        return join_key("/", key);
    }
    match key.strip_prefix(prefix.as_str()) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => join_key("/", rest),
        _ => join_key("/", key),
    }
}
