//! Declarative resource descriptors and the directory loader.
//!
//! A descriptor is a TOML file with one `[template]` table:
//!
//! ```toml
//! [template]
//! src = "nginx.conf.tmpl"
//! dest = "/etc/nginx/nginx.conf"
//! prefix = "/app"
//! keys = ["worker_count"]
//! mode = "0644"
//! check_cmd = "nginx -t -c {{ src }}"
//! reload_cmd = "nginx -s reload"
//! ```

mod loader;
mod template_resource;

pub use loader::*;
pub use template_resource::*;
