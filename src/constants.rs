// -
// Resource descriptors

/// Placeholder in `dest`, `check_cmd` and `reload_cmd` replaced by the confdir
pub const RUNTIME_CONFDIR_PLACEHOLDER: &str = "${RUNTIME_CONFDIR}";

/// Extension of descriptor files
pub(crate) const DESCRIPTOR_EXTENSION: &str = "toml";

/// A descriptor containing this line is never loaded
pub const IGNORE_MARKER: &str = "# confd:ignore";

/// Overrides the host platform when filtering platform-tagged descriptors
pub const TARGET_OS_ENV: &str = "CONFD_TARGET_OS";

/// Platform tags recognised in descriptor names such as `nginx.linux.toml`
pub(crate) const KNOWN_PLATFORMS: &[&str] = &[
    "linux", "windows", "macos", "darwin", "freebsd", "openbsd", "netbsd", "android", "ios",
];

/// `uid`/`gid` value meaning "use the effective identity of the process"
pub const OWNER_SENTINEL: i64 = -1;

// -
// Scheduling

/// Dispatcher sleep when no call is pending (ms)
pub(crate) const DISPATCH_IDLE_MS: u64 = 20;

/// Time budget of the connectivity probe run by `Processor::go` (ms)
pub(crate) const PROBE_TIMEOUT_MS: u64 = 3000;

/// Key scanned by the connectivity probe; expected to hold nothing
pub(crate) const PROBE_KEY: &str = "/.confd-probe";

/// Cursor returned by the first watch call so the caller fetches once
pub const INITIAL_CURSOR: u64 = 1;

// -
// metad

/// Response header carrying the metad data version
pub const METAD_VERSION_HEADER: &str = "X-Metad-Version";
