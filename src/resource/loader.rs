use std::path::Path;
use std::path::PathBuf;

use config::Config;
use config::File;
use config::FileFormat;
use glob::Pattern;
use tracing::debug;
use tracing::warn;

use super::TemplateResource;
use super::TemplateResourceFile;
use crate::constants::DESCRIPTOR_EXTENSION;
use crate::constants::IGNORE_MARKER;
use crate::constants::KNOWN_PLATFORMS;
use crate::constants::TARGET_OS_ENV;
use crate::utils::file_io::path_error;
use crate::Error;
use crate::Result;
use crate::TemplateError;

/// Outcome of loading a descriptor directory.
///
/// Callers may proceed with `resources` and report `errors`.
#[derive(Debug, Default)]
pub struct LoadedResources {
    pub resources: Vec<TemplateResource>,
    pub errors: Vec<(PathBuf, Error)>,
}

/// Platform descriptors are filtered against: `CONFD_TARGET_OS` when set,
/// the host platform otherwise.
pub fn target_platform() -> String {
    match std::env::var(TARGET_OS_ENV) {
        Ok(os) if !os.trim().is_empty() => canonical_platform(os.trim()),
        _ => canonical_platform(std::env::consts::OS),
    }
}

/// `darwin` and `macos` name the same platform.
fn canonical_platform(name: &str) -> String {
    match name.to_lowercase().as_str() {
        "darwin" => "macos".to_string(),
        other => other.to_string(),
    }
}

/// Loads every descriptor of `dir`.
///
/// `confdir` replaces the `${RUNTIME_CONFDIR}` placeholder. Only a missing or
/// unreadable directory is an error; per-file failures are collected.
pub fn list_template_resource(
    dir: &Path,
    confdir: &Path,
) -> Result<LoadedResources> {
    if !dir.is_dir() {
        return Err(path_error(dir, std::io::Error::from(std::io::ErrorKind::NotFound)));
    }

    let pattern = format!(
        "{}/*.{}",
        Pattern::escape(&dir.to_string_lossy()),
        DESCRIPTOR_EXTENSION
    );
    let platform = target_platform();
    let mut loaded = LoadedResources::default();

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in glob::glob(&pattern).map_err(TemplateError::Pattern)? {
        match entry {
            Ok(path) => paths.push(path),
            Err(e) => {
                let path = e.path().to_path_buf();
                loaded.errors.push((path, e.into_error().into()));
            }
        }
    }
    paths.sort();

    for path in paths {
        if let Some(reason) = skip_by_name(&path, &platform) {
            debug!("skip descriptor {:?}: {}", path, reason);
            continue;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                loaded.errors.push((path.clone(), path_error(&path, e)));
                continue;
            }
        };
        if has_ignore_marker(&content) {
            debug!("skip descriptor {:?}: ignore marker", path);
            continue;
        }
        match parse_template_resource(&path, &content, confdir) {
            Ok(resource) => loaded.resources.push(resource),
            Err(e) => {
                warn!("cannot load descriptor {:?}: {}", path, e);
                loaded.errors.push((path, e));
            }
        }
    }

    Ok(loaded)
}

/// Decodes a single descriptor file. Unset `uid`/`gid` stay at the `-1` sentinel.
pub fn load_template_resource_file(
    path: &Path,
    confdir: &Path,
) -> Result<TemplateResource> {
    let content = std::fs::read_to_string(path).map_err(|e| path_error(path, e))?;
    parse_template_resource(path, &content, confdir)
}

fn parse_template_resource(
    path: &Path,
    content: &str,
    confdir: &Path,
) -> Result<TemplateResource> {
    let file: TemplateResourceFile = Config::builder()
        .add_source(File::from_str(content, FileFormat::Toml))
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|source| TemplateError::Descriptor {
            path: path.to_path_buf(),
            source,
        })?;

    let mut resource = file.template;
    resource.expand_placeholders(confdir);

    let invalid = |reason: &str| {
        Error::from(TemplateError::InvalidResource {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        })
    };
    if resource.src.trim().is_empty() {
        return Err(invalid("src is required"));
    }
    if resource.dest.trim().is_empty() {
        return Err(invalid("dest is required"));
    }
    resource.file_mode()?;

    Ok(resource)
}

fn skip_by_name(
    path: &Path,
    platform: &str,
) -> Option<&'static str> {
    let name = path.file_name()?.to_string_lossy();
    if name.starts_with('_') || name.starts_with('.') {
        return Some("hidden file");
    }
    if path.extension().map(|e| e != DESCRIPTOR_EXTENSION).unwrap_or(true) {
        return Some("unexpected extension");
    }
    let stem = path.file_stem()?.to_string_lossy();
    if let Some((_, tag)) = stem.rsplit_once('.') {
        let tag = canonical_platform(tag);
        if KNOWN_PLATFORMS.contains(&tag.as_str()) && tag != platform {
            return Some("tagged for another platform");
        }
    }
    None
}

fn has_ignore_marker(content: &str) -> bool {
    content.lines().any(|l| l.trim() == IGNORE_MARKER)
}
