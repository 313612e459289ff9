// src/config.rs
//
// §10.3: `ExecuteOptions` is constructible directly in code — the common
// case, since this is a library-first crate — and, for the CLI binary,
// additionally loadable from an optional `--config <path>.yaml` via
// `serde_yaml`, the teacher's own format of choice for structured config
// (it already parses YAML for its workflow DSL). CLI flags override file
// values; file values override `ExecuteOptions::default()` — the latter
// falls out for free because `ExecuteOptions` derives `Deserialize` with
// `#[serde(default)]` at the struct level, so a YAML document naming only
// a handful of fields fills the rest in from `Default::default()`.

use crate::types::ExecuteOptions;
use anyhow::{Context, Result};
use std::path::Path;

pub fn load_options(path: &Path) -> Result<ExecuteOptions> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {path:?}"))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing config file {path:?} as YAML"))
}
