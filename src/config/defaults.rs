//! Built-in defaults (first configuration layer)

use serde_json::{json, Value};

/// Default worker count: serial unless explicitly raised
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default working directory, relative to the buildroot
pub const DEFAULT_WORKDIR: &str = ".isolated-compile";

/// Default classpath configuration
pub const DEFAULT_CONF: &str = "default";

/// Default compiler executable
pub const DEFAULT_COMPILER: &str = "zinc";

/// Source globs accepted by default
pub const DEFAULT_SOURCE_GLOBS: &[&str] = &["**/*.java", "**/*.scala"];

/// Built-in configuration as a mergeable value
pub fn builtin_defaults() -> Value {
    json!({
        "compile": {
            "worker_count": DEFAULT_WORKER_COUNT,
            "capture_log": false,
            "workdir": DEFAULT_WORKDIR,
            "confs": [DEFAULT_CONF],
            "source_globs": DEFAULT_SOURCE_GLOBS,
        },
        "classpath": {
            "extra": [],
            "extra_placement": "append",
        },
        "compiler": {
            "program": DEFAULT_COMPILER,
            "args": [],
        },
        "cache": {},
    })
}
