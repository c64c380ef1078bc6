//! Scaffolding for modules that have no configuration yet.

use handlebars::Handlebars;
use serde_json::json;

use crate::config::InstallationTarget;
use crate::error::InstallError;
use crate::modules::ModuleId;

const MODULE_TEMPLATE: &str = include_str!("../templates/terragrunt.hcl.hbs");

/// Render the default `terragrunt.hcl` for `module`.
///
/// # Errors
///
/// Returns [`InstallError::Template`] if rendering fails.
pub fn module_template(target: &InstallationTarget, module: ModuleId) -> Result<String, InstallError> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(handlebars::no_escape);
    registry
        .render_template(
            MODULE_TEMPLATE,
            &json!({
                "module": module.dir_name(),
                "environment": target.environment,
                "region": target.region,
            }),
        )
        .map_err(|e| InstallError::Template {
            module,
            reason: e.to_string(),
        })
}
