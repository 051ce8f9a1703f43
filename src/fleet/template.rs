use anyhow::{Context, Result};
use std::path::Path;

/// Values substituted into the worker script template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub channel: &'a str,
    pub config_path: &'a Path,
    pub conduit_path: &'a Path,
    pub data_dir: &'a Path,
}

/// Replace `{{channel}}`, `{{config_path}}`, `{{conduit_path}}` and
/// `{{data_dir}}`. Other text is left untouched.
pub fn render(template: &str, vars: &TemplateVars<'_>) -> String {
    template
        .replace("{{channel}}", vars.channel)
        .replace("{{config_path}}", &vars.config_path.to_string_lossy())
        .replace("{{conduit_path}}", &vars.conduit_path.to_string_lossy())
        .replace("{{data_dir}}", &vars.data_dir.to_string_lossy())
}

pub fn load(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read worker template {}", path.display()))
}
