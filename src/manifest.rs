//! Plugin manifest model, parsing, and validation.
//!
//! Each plugin directory carries a `plugin.manifest.json` describing the
//! plugin, its dependencies, and the symbols its module exposes. Parsing is
//! strict serde; validation collects every problem instead of stopping at
//! the first, and is pure so repeated validation of the same manifest always
//! yields the same report.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostResult};

/// Well-known manifest file name inside a plugin directory.
pub const MANIFEST_FILE: &str = "plugin.manifest.json";

/// Relative path of the plugin code bundle inside a plugin directory.
pub const MODULE_ENTRY: &str = "dist/index.js";

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").expect("name regex is valid"));
static GUARD_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("guard name regex is valid"));
static GUARD_CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Za-z0-9]*$").expect("guard class regex is valid"));

/// Parsed plugin manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Lowercase identifier, unique per host.
    pub name: String,
    /// SemVer version string.
    pub version: String,
    pub description: String,
    pub author: String,
    pub license: String,
    /// Names of plugins that must reach LOADED before this one.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Priority within a dependency-free tier; lower loads earlier.
    #[serde(default)]
    pub load_order: u32,
    /// Failure of a critical plugin aborts the whole load.
    #[serde(default)]
    pub critical: bool,
    /// Module composition declaration.
    #[serde(default)]
    pub module: ModuleDeclaration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecuritySection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<CompatibilitySection>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Symbols and components the plugin binary exposes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDeclaration {
    #[serde(default)]
    pub controllers: Vec<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub guards: Vec<GuardEntry>,
    #[serde(default)]
    pub cross_plugin_services: Vec<CrossPluginServiceConfig>,
}

/// A guard declaration: either local to this plugin or a reference to
/// another plugin's exported guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum GuardEntry {
    External(ExternalGuard),
    Local(LocalGuard),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalGuard {
    pub name: String,
    pub class_name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub exported: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalGuard {
    pub name: String,
    /// Name of the plugin that declares (and exports) this guard.
    pub source: String,
}

impl GuardEntry {
    pub fn name(&self) -> &str {
        match self {
            GuardEntry::Local(local) => &local.name,
            GuardEntry::External(external) => &external.name,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, GuardEntry::Local(_))
    }
}

/// Declaration of a service exposed to other plugins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CrossPluginServiceConfig {
    pub service_name: String,
    /// Caller-suggested token; the service manager still uniquifies it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Globally visible to other plugins by name.
    #[serde(default)]
    pub global: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub deprecated: bool,
}

/// Trust and integrity declarations. Enforced by an external policy layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySection {
    #[serde(default)]
    pub trust_level: TrustLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default)]
    pub sandbox_required: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Internal,
    Verified,
    #[default]
    Community,
    Untrusted,
    Quarantined,
}

/// Host version range the plugin supports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompatibilitySection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_host_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_host_version: Option<String>,
}

/// Outcome of validating a manifest. Pure: the same manifest always yields
/// the same report.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Validation tuning. The regex budget bounds each pattern evaluation and
/// is configured through `PLUGIN_REGEX_TIMEOUT_MS`.
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub regex_timeout: Duration,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            regex_timeout: Duration::from_millis(100),
        }
    }
}

/// Parse and validate manifest JSON with the default limits.
pub fn parse_manifest(content: &str, plugin_hint: &str) -> HostResult<PluginManifest> {
    parse_manifest_limited(content, plugin_hint, &ValidationLimits::default())
}

/// Parse and validate manifest JSON under explicit limits.
pub fn parse_manifest_limited(
    content: &str,
    plugin_hint: &str,
    limits: &ValidationLimits,
) -> HostResult<PluginManifest> {
    let manifest: PluginManifest =
        serde_json::from_str(content).map_err(|e| HostError::ManifestInvalid {
            plugin: plugin_hint.to_string(),
            reason: e.to_string(),
        })?;
    let report = validate_limited(&manifest, limits);
    if !report.is_valid {
        return Err(HostError::ManifestInvalid {
            plugin: manifest.name.clone(),
            reason: report.errors.join("; "),
        });
    }
    Ok(manifest)
}

/// Validate a parsed manifest against the host's rules.
pub fn validate(manifest: &PluginManifest) -> ValidationReport {
    validate_limited(manifest, &ValidationLimits::default())
}

/// Validate under explicit limits.
pub fn validate_limited(manifest: &PluginManifest, limits: &ValidationLimits) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if manifest.name.is_empty() {
        errors.push("name must not be empty".to_string());
    } else if !matches_within(&NAME_RE, &manifest.name, "name", limits, &mut errors) {
        errors.push(format!(
            "name '{}' must be lowercase alphanumeric with dashes",
            manifest.name
        ));
    }

    if semver::Version::parse(&manifest.version).is_err() {
        errors.push(format!("version '{}' is not valid semver", manifest.version));
    }

    if manifest.description.is_empty() {
        warnings.push("description is empty".to_string());
    }
    if manifest.author.is_empty() {
        errors.push("author must not be empty".to_string());
    }
    if manifest.license.is_empty() {
        errors.push("license must not be empty".to_string());
    }

    check_string_array(&manifest.dependencies, "dependencies", &mut errors);
    check_string_array(&manifest.module.controllers, "module.controllers", &mut errors);
    check_string_array(&manifest.module.providers, "module.providers", &mut errors);
    check_string_array(&manifest.module.exports, "module.exports", &mut errors);
    check_string_array(&manifest.module.imports, "module.imports", &mut errors);
    check_string_array(&manifest.permissions, "permissions", &mut errors);

    if manifest.dependencies.iter().any(|d| d == &manifest.name) {
        errors.push(format!("plugin '{}' depends on itself", manifest.name));
    }

    for guard in &manifest.module.guards {
        match guard {
            GuardEntry::Local(local) => {
                if !matches_within(&GUARD_NAME_RE, &local.name, "guard name", limits, &mut errors)
                {
                    errors.push(format!("guard name '{}' is invalid", local.name));
                }
                if !matches_within(
                    &GUARD_CLASS_RE,
                    &local.class_name,
                    "guard class",
                    limits,
                    &mut errors,
                ) {
                    errors.push(format!(
                        "guard class '{}' must be PascalCase",
                        local.class_name
                    ));
                }
                for dep in &local.dependencies {
                    if !matches_within(
                        &GUARD_NAME_RE,
                        dep,
                        "guard dependency",
                        limits,
                        &mut errors,
                    ) {
                        errors.push(format!(
                            "guard '{}' has invalid dependency name '{dep}'",
                            local.name
                        ));
                    }
                }
            }
            GuardEntry::External(external) => {
                if !matches_within(
                    &GUARD_NAME_RE,
                    &external.name,
                    "guard name",
                    limits,
                    &mut errors,
                ) {
                    errors.push(format!("guard name '{}' is invalid", external.name));
                }
                if !matches_within(
                    &NAME_RE,
                    &external.source,
                    "guard source",
                    limits,
                    &mut errors,
                ) {
                    errors.push(format!(
                        "external guard '{}' has invalid source plugin '{}'",
                        external.name, external.source
                    ));
                }
            }
        }
    }

    for service in &manifest.module.cross_plugin_services {
        if service.service_name.is_empty() {
            errors.push("crossPluginServices entry has an empty serviceName".to_string());
        }
        if service.deprecated {
            warnings.push(format!(
                "service '{}' is declared deprecated",
                service.service_name
            ));
        }
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Run one bounded regex evaluation. An evaluation that blows the budget
/// records its own error and reports `true` so the caller does not stack a
/// mismatch error on top of the budget one.
fn matches_within(
    re: &Regex,
    text: &str,
    field: &str,
    limits: &ValidationLimits,
    errors: &mut Vec<String>,
) -> bool {
    let started = Instant::now();
    let matched = re.is_match(text);
    if started.elapsed() > limits.regex_timeout {
        errors.push(format!(
            "{field}: regex evaluation exceeded the {}ms budget",
            limits.regex_timeout.as_millis()
        ));
        return true;
    }
    matched
}

fn check_string_array(values: &[String], field: &str, errors: &mut Vec<String>) {
    for value in values {
        if value.trim().is_empty() {
            errors.push(format!("{field} contains an empty entry"));
        }
    }
}
