use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The manifest applied when no rule set is supplied: one trace per second
/// plus five percent of the rest.
static DEFAULT_MANIFEST: Lazy<Manifest> = Lazy::new(|| Manifest {
    version: 2,
    default_rule: Rule {
        fixed_target: 1,
        rate: 0.05,
        ..Default::default()
    },
    rules: Vec::new(),
});

/// A validated, versioned set of local sampling rules plus a default rule.
///
/// Manifests are immutable after validation. Each strategy instance works on
/// its own normalized deep copy, so a refresh can never race with in-flight
/// matches against a copy still being read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    #[serde(rename = "default")]
    pub default_rule: Rule,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// A single local sampling rule.
///
/// Match fields are glob patterns (`*`, `?`), matched case-insensitively.
/// `fixed_target` is the per-second reservoir capacity and `rate` the
/// Bernoulli fallback probability once the reservoir is drained.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url_path: String,
    #[serde(default)]
    pub fixed_target: u64,
    #[serde(default)]
    pub rate: f64,
}

impl Manifest {
    /// Parses a manifest from its JSON representation and validates it.
    pub fn from_json(bytes: &[u8]) -> Result<Manifest> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|err| Error::InvalidRule(err.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks version support, the default rule's shape, and every rule's
    /// match fields and quantities. Total: never panics on malformed input.
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 && self.version != 2 {
            return Err(Error::UnsupportedManifestVersion(self.version));
        }
        if !self.default_rule.host.is_empty()
            || !self.default_rule.service_name.is_empty()
            || !self.default_rule.http_method.is_empty()
            || !self.default_rule.url_path.is_empty()
        {
            return Err(Error::InvalidRule(
                "default rule must not have host, service name, http method, or url path".into(),
            ));
        }
        validate_quantities(&self.default_rule)?;
        for rule in &self.rules {
            validate_quantities(rule)?;
            if rule.http_method.is_empty() || rule.url_path.is_empty() {
                return Err(Error::InvalidRule(
                    "rules must specify http method and url path".into(),
                ));
            }
            match self.version {
                1 => {
                    if rule.service_name.is_empty() {
                        return Err(Error::InvalidRule(
                            "version 1 rules must specify service name".into(),
                        ));
                    }
                    if !rule.host.is_empty() {
                        return Err(Error::InvalidRule(
                            "version 1 rules must not specify host".into(),
                        ));
                    }
                }
                _ => {
                    if rule.host.is_empty() {
                        return Err(Error::InvalidRule("version 2 rules must specify host".into()));
                    }
                    if !rule.service_name.is_empty() {
                        return Err(Error::InvalidRule(
                            "version 2 rules must not specify service name".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns a working deep copy migrated to version-2 field names:
    /// version-1 rules match on `service_name`, which becomes `host`.
    pub(crate) fn normalized(&self) -> Manifest {
        let mut copy = self.clone();
        if copy.version == 1 {
            for rule in &mut copy.rules {
                rule.host = std::mem::take(&mut rule.service_name);
            }
            copy.version = 2;
        }
        copy
    }
}

impl Default for Manifest {
    fn default() -> Self {
        DEFAULT_MANIFEST.clone()
    }
}

fn validate_quantities(rule: &Rule) -> Result<()> {
    if rule.rate < 0.0 || !rule.rate.is_finite() {
        return Err(Error::InvalidRule(format!(
            "rate must be a non-negative number, got {}",
            rule.rate
        )));
    }
    Ok(())
}
