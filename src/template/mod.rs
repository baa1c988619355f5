//! Template rendering: the per-resource key/value projection, the function
//! library exposed to templates, and the encryption envelope used by the
//! decrypting accessors.
//!
//! Templates use minijinja syntax, e.g.
//!
//! ```text
//! worker_processes {{ getv("/worker_count", "1") }};
//! {% for upstream in getvs("/upstreams/*") %}server {{ upstream }};
//! {% endfor %}
//! ```

mod crypt;
mod funcs;
mod kv_store;

pub use crypt::*;
pub use funcs::*;
pub use kv_store::*;


use std::collections::HashMap;

use minijinja::context;
use minijinja::Environment;
use minijinja::UndefinedBehavior;

use crate::Result;
use crate::TemplateFn;

/// Renders `source` with the resource's function library installed.
pub fn render_template(
    name: &str,
    source: &str,
    funcs: &TemplateFunc,
    extra: &HashMap<String, TemplateFn>,
) -> Result<String> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    funcs.register(&mut env, extra);
    env.add_template(name, source)?;
    let rendered = env.get_template(name)?.render(context! {})?;
    Ok(rendered)
}

/// Expands `{{ src }}` in a check command with the staged file path.
pub fn render_command(
    cmd: &str,
    src: &str,
) -> Result<String> {
    let env = Environment::new();
    Ok(env.render_str(cmd, context! { src => src })?)
}
