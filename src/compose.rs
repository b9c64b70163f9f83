//! Compose document generation for container-backed sandboxes.
//!
//! A template is either a complete compose document or a services-only
//! fragment. Both are parsed into a YAML value, parameters are substituted
//! into string scalars (keys and values), and fragments are wrapped with a
//! schema version, a default bridge network, and per-run named volumes.

use std::fmt;
use std::path::{Path, PathBuf};

use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};

use crate::config::SandboxIdentity;
use crate::error::{Error, Result};

/// Compose schema version written into wrapped fragments.
pub const COMPOSE_VERSION: &str = "3.8";

/// Subnet of the generated default bridge network.
pub const DEFAULT_SUBNET: &str = "172.20.0.0/16";

/// Parameters substituted into a compose template.
#[derive(Clone, PartialEq, Eq)]
pub struct ComposeParameters {
    pub run_id: String,
    pub distribution: String,
    pub username: String,
    pub credential: String,
}

impl fmt::Debug for ComposeParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposeParameters")
            .field("run_id", &self.run_id)
            .field("distribution", &self.distribution)
            .field("username", &self.username)
            .field("credential", &"[REDACTED]")
            .finish()
    }
}

impl ComposeParameters {
    /// Builds parameters for an existing run.
    pub fn for_run(run_id: impl Into<String>, identity: &SandboxIdentity) -> Self {
        Self {
            run_id: run_id.into(),
            distribution: identity.distribution_id.clone(),
            username: identity.username.clone(),
            credential: identity.credential.clone(),
        }
    }

    /// Builds parameters with a freshly generated run id.
    pub fn generate(identity: &SandboxIdentity) -> Self {
        Self::for_run(generate_run_id(), identity)
    }

    /// Names of the storage and data volumes owned by this run.
    pub fn volume_names(&self) -> [String; 2] {
        [
            format!("{}-storage-{}", self.run_id, self.distribution),
            format!("{}-data-{}", self.run_id, self.distribution),
        ]
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "run_id" | "uuid" => Some(&self.run_id),
            "distribution" | "wsl-distro" => Some(&self.distribution),
            "username" | "wsl-usr" => Some(&self.username),
            "credential" | "wsl-pwd" => Some(&self.credential),
            _ => None,
        }
    }

    /// Replaces every known `${name}` placeholder in a single pass.
    ///
    /// Substituted values are never rescanned, and unknown placeholders are
    /// left untouched.
    pub fn render(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => match self.lookup(&after[..end]) {
                    Some(value) => {
                        out.push_str(value);
                        rest = &after[end + 1..];
                    }
                    None => {
                        out.push_str("${");
                        rest = after;
                    }
                },
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }

        out.push_str(rest);
        out
    }
}

/// Generates a run id: a second-resolution timestamp plus 48 random bits.
pub fn generate_run_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}",
        chrono::Local::now().format("%Y%m%d-%H%M%S"),
        &random[..12]
    )
}

/// Picks the primary template if it exists, otherwise the fallback.
pub fn locate_template(primary: &Path, fallback: &Path) -> Result<PathBuf> {
    if primary.is_file() {
        tracing::debug!(template = %primary.display(), "using primary compose template");
        Ok(primary.to_path_buf())
    } else if fallback.is_file() {
        tracing::warn!(
            primary = %primary.display(),
            fallback = %fallback.display(),
            "primary compose template missing, using fallback"
        );
        Ok(fallback.to_path_buf())
    } else {
        Err(Error::TemplateMissing {
            primary: primary.to_path_buf(),
            fallback: fallback.to_path_buf(),
        })
    }
}

/// Returns true if the document already has a version marker and a services section.
pub fn is_complete(document: &Value) -> bool {
    document
        .as_mapping()
        .is_some_and(|m| m.get("version").is_some() && m.get("services").is_some())
}

/// Generates a complete compose document from a template and parameters.
pub fn generate(template: &str, params: &ComposeParameters) -> Result<String> {
    let parsed: Value = serde_yaml::from_str(template)
        .map_err(|e| Error::Compose(format!("failed to parse template: {}", e)))?;
    let document = substitute(parsed, params);

    if is_complete(&document) {
        return serialize(&document);
    }

    let services = match document {
        Value::Mapping(services) if !services.is_empty() => services,
        Value::Null => return Err(Error::Compose("template defines no services".to_string())),
        Value::Mapping(_) => {
            return Err(Error::Compose("template defines no services".to_string()))
        }
        _ => {
            return Err(Error::Compose(
                "services fragment must be a mapping of service names".to_string(),
            ))
        }
    };

    let wrapped = wrap_services(services, params);
    let body = serialize(&wrapped)?;
    Ok(format!(
        "# Generated sandbox compose document\n# Generated at: {}\n\n{}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        body
    ))
}

fn serialize(document: &Value) -> Result<String> {
    serde_yaml::to_string(document)
        .map_err(|e| Error::Compose(format!("failed to render document: {}", e)))
}

fn substitute(value: Value, params: &ComposeParameters) -> Value {
    match value {
        Value::String(s) => Value::String(params.render(&s)),
        Value::Sequence(items) => {
            Value::Sequence(items.into_iter().map(|v| substitute(v, params)).collect())
        }
        Value::Mapping(mapping) => Value::Mapping(
            mapping
                .into_iter()
                .map(|(k, v)| (substitute(k, params), substitute(v, params)))
                .collect(),
        ),
        Value::Tagged(tagged) => {
            let TaggedValue { tag, value } = *tagged;
            Value::Tagged(Box::new(TaggedValue {
                tag,
                value: substitute(value, params),
            }))
        }
        other => other,
    }
}

fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

fn wrap_services(services: Mapping, params: &ComposeParameters) -> Value {
    let mut ipam_entry = Mapping::new();
    ipam_entry.insert(key("subnet"), key(DEFAULT_SUBNET));

    let mut ipam = Mapping::new();
    ipam.insert(key("config"), Value::Sequence(vec![Value::Mapping(ipam_entry)]));

    let mut default_network = Mapping::new();
    default_network.insert(key("driver"), key("bridge"));
    default_network.insert(key("ipam"), Value::Mapping(ipam));

    let mut networks = Mapping::new();
    networks.insert(key("default"), Value::Mapping(default_network));

    let mut volumes = Mapping::new();
    for name in params.volume_names() {
        volumes.insert(Value::String(name), Value::Null);
    }

    let mut document = Mapping::new();
    document.insert(key("version"), key(COMPOSE_VERSION));
    document.insert(key("services"), Value::Mapping(services));
    document.insert(key("networks"), Value::Mapping(networks));
    document.insert(key("volumes"), Value::Mapping(volumes));
    Value::Mapping(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ComposeParameters {
        ComposeParameters {
            run_id: "20261019-101500-abcdef012345".to_string(),
            distribution: "win11".to_string(),
            username: "devman".to_string(),
            credential: "devman".to_string(),
        }
    }

    const FRAGMENT: &str = r#"
  windows:
    image: dockurr/windows
    container_name: ${run_id}-windows-${distribution}
    environment:
      USERNAME: ${username}
      PASSWORD: ${credential}
    volumes:
      - ${run_id}-storage-${distribution}:/storage
"#;

    fn parse(doc: &str) -> Value {
        serde_yaml::from_str(doc).unwrap()
    }

    #[test]
    fn wraps_services_fragment() {
        let doc = generate(FRAGMENT, &params()).unwrap();
        assert!(doc.starts_with("# Generated sandbox compose document"));

        let value = parse(&doc);
        assert_eq!(value["version"], key("3.8"));
        assert_eq!(
            value["services"]["windows"]["container_name"],
            key("20261019-101500-abcdef012345-windows-win11")
        );
        assert_eq!(value["networks"]["default"]["driver"], key("bridge"));
        assert_eq!(
            value["networks"]["default"]["ipam"]["config"][0]["subnet"],
            key(DEFAULT_SUBNET)
        );

        let volumes = value["volumes"].as_mapping().unwrap();
        assert_eq!(volumes.len(), 2);
        assert!(volumes.contains_key("20261019-101500-abcdef012345-storage-win11"));
        assert!(volumes.contains_key("20261019-101500-abcdef012345-data-win11"));
    }

    #[test]
    fn complete_document_is_not_wrapped_twice() {
        let complete = format!("version: '3.8'\nservices:\n{}", FRAGMENT);
        let doc = generate(&complete, &params()).unwrap();
        let value = parse(&doc);

        let top = value.as_mapping().unwrap();
        assert_eq!(top.len(), 2);
        assert!(top.get("networks").is_none());
        assert_eq!(value["services"].as_mapping().unwrap().len(), 1);
        assert!(doc.contains("20261019-101500-abcdef012345-windows-win11"));
        assert!(!doc.contains("${"));
    }

    #[test]
    fn generate_is_idempotent_on_its_own_output() {
        let once = generate(FRAGMENT, &params()).unwrap();
        let twice = generate(&once, &params()).unwrap();
        assert_eq!(parse(&once), parse(&twice));
    }

    #[test]
    fn every_occurrence_is_replaced_identically() {
        let template = "svc:\n  name: ${run_id}\n  labels:\n    run: ${run_id}\n";
        let doc = generate(template, &params()).unwrap();
        let value = parse(&doc);
        assert_eq!(value["services"]["svc"]["name"], key(&params().run_id));
        assert_eq!(value["services"]["svc"]["labels"]["run"], key(&params().run_id));
    }

    #[test]
    fn substitutes_mapping_keys() {
        let template = "svc:\n  image: x\n${run_id}-extra:\n  image: y\n";
        let value = parse(&generate(template, &params()).unwrap());
        assert!(value["services"]
            .as_mapping()
            .unwrap()
            .contains_key("20261019-101500-abcdef012345-extra"));
    }

    #[test]
    fn special_characters_in_values_cannot_break_structure() {
        let mut p = params();
        p.credential = "p@ss: \"quoted\"\n  injected: true".to_string();
        let value = parse(&generate(FRAGMENT, &p).unwrap());

        let env = &value["services"]["windows"]["environment"];
        assert_eq!(env["PASSWORD"], Value::String(p.credential.clone()));
        assert!(env.get("injected").is_none());
    }

    #[test]
    fn legacy_placeholder_aliases_are_supported() {
        let template = "svc:\n  name: ${uuid}-${wsl-distro}-${wsl-usr}-${wsl-pwd}\n";
        let value = parse(&generate(template, &params()).unwrap());
        assert_eq!(
            value["services"]["svc"]["name"],
            key("20261019-101500-abcdef012345-win11-devman-devman")
        );
    }

    #[test]
    fn render_leaves_unknown_placeholders_and_does_not_rescan() {
        let mut p = params();
        p.username = "${credential}".to_string();
        assert_eq!(p.render("${username}/${HOME}"), "${credential}/${HOME}");
        assert_eq!(p.render("tail ${run_id"), "tail ${run_id");
        assert_eq!(p.render("no placeholders"), "no placeholders");
    }

    #[test]
    fn empty_or_scalar_templates_are_rejected() {
        assert!(matches!(generate("", &params()), Err(Error::Compose(_))));
        assert!(matches!(generate("just text", &params()), Err(Error::Compose(_))));
        assert!(matches!(
            generate("services: [unterminated", &params()),
            Err(Error::Compose(_))
        ));
    }

    #[test]
    fn locate_template_prefers_primary_then_fallback() {
        let dir = tempfile::TempDir::new().unwrap();
        let primary = dir.path().join("podman-sandbox");
        let fallback = dir.path().join("podman-sandbox-compose.yml");

        let err = locate_template(&primary, &fallback).unwrap_err();
        assert!(matches!(err, Error::TemplateMissing { .. }));

        std::fs::write(&fallback, "version: '3.8'\nservices: {}\n").unwrap();
        assert_eq!(locate_template(&primary, &fallback).unwrap(), fallback);

        std::fs::write(&primary, FRAGMENT).unwrap();
        assert_eq!(locate_template(&primary, &fallback).unwrap(), primary);
    }

    #[test]
    fn run_ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..100).map(|_| generate_run_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn debug_redacts_credential() {
        let debug = format!("{:?}", params());
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("credential: \"devman\""));
    }
}
