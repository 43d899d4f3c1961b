use cairn_core::Entity;
use serde_json::{Map, Value as Json};

/// Result of parsing one descriptor document.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserOutput {
    /// An entity-bearing descriptor that should be merged into the catalog.
    Component(Entity),
    /// A valid descriptor of a kind this catalog does not ingest.
    Other { kind: String },
}

/// Parse failure, tagged with the offending entity name when it is known.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ParserError {
    pub component_name: Option<String>,
    pub message: String,
}

impl ParserError {
    pub fn new(component_name: Option<String>, message: impl Into<String>) -> Self {
        Self { component_name, message: message.into() }
    }
}

pub trait DescriptorParser: Send + Sync {
    fn parse(&self, payload: &[u8]) -> Result<ParserOutput, ParserError>;
}

/// Parses YAML descriptor envelopes (`apiVersion`, `kind`, `metadata`, `spec`).
#[derive(Debug, Clone)]
pub struct YamlDescriptorParser {
    max_bytes: usize,
}

impl Default for YamlDescriptorParser {
    fn default() -> Self { Self { max_bytes: max_document_bytes() } }
}

impl YamlDescriptorParser {
    pub const COMPONENT_KIND: &'static str = "Component";

    pub fn new() -> Self { Self::default() }

    pub fn with_max_bytes(max_bytes: usize) -> Self { Self { max_bytes } }
}

/// 1 MiB.
const DEFAULT_MAX_DOCUMENT_BYTES: usize = 1 << 20;

fn max_document_bytes() -> usize {
    std::env::var("CAIRN_MAX_DOCUMENT_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_DOCUMENT_BYTES)
}

impl DescriptorParser for YamlDescriptorParser {
    fn parse(&self, payload: &[u8]) -> Result<ParserOutput, ParserError> {
        if payload.len() > self.max_bytes {
            return Err(ParserError::new(None, format!("descriptor too large: {} bytes (max {})", payload.len(), self.max_bytes)));
        }
        let doc: Json = serde_yaml::from_slice(payload)
            .map_err(|e| ParserError::new(None, format!("malformed YAML: {}", e)))?;
        let obj = doc.as_object().ok_or_else(|| ParserError::new(None, "descriptor must be a mapping"))?;
        let name = obj
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|n| n.as_str())
            .map(|s| s.to_string());
        let fail = |msg: String| ParserError::new(name.clone(), msg);

        validate_envelope(obj).map_err(fail)?;
        let kind = obj.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
        let entity: Entity = serde_json::from_value(doc).map_err(|e| fail(format!("invalid envelope: {}", e)))?;
        if kind == Self::COMPONENT_KIND {
            Ok(ParserOutput::Component(entity))
        } else {
            Ok(ParserOutput::Other { kind })
        }
    }
}

fn validate_envelope(obj: &Map<String, Json>) -> Result<(), String> {
    match obj.get("apiVersion") {
        Some(Json::String(v)) if valid_api_version(v) => {}
        Some(Json::String(v)) => return Err(format!("malformed apiVersion {:?}", v)),
        Some(_) => return Err("apiVersion must be a string".into()),
        None => return Err("missing apiVersion".into()),
    }
    match obj.get("kind") {
        Some(Json::String(k)) if !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric()) => {}
        Some(Json::String(k)) => return Err(format!("malformed kind {:?}", k)),
        Some(_) => return Err("kind must be a string".into()),
        None => return Err("missing kind".into()),
    }
    if let Some(meta) = obj.get("metadata") {
        let meta = meta.as_object().ok_or("metadata must be a mapping")?;
        for field in ["name", "namespace"] {
            match meta.get(field) {
                None => {}
                Some(Json::String(s)) if valid_name(s) => {}
                Some(Json::String(s)) => return Err(format!("malformed metadata.{} {:?}", field, s)),
                Some(_) => return Err(format!("metadata.{} must be a string", field)),
            }
        }
        for field in ["labels", "annotations"] {
            match meta.get(field) {
                None => {}
                Some(Json::Object(m)) => {
                    if let Some((k, _)) = m.iter().find(|(_, v)| !v.is_string()) {
                        return Err(format!("metadata.{}.{} must be a string", field, k));
                    }
                }
                Some(_) => return Err(format!("metadata.{} must be a mapping", field)),
            }
        }
    }
    match obj.get("spec") {
        None | Some(Json::Object(_)) => Ok(()),
        Some(_) => Err("spec must be a mapping".into()),
    }
}

/// `v1`, `v1beta2`, `group.example.com/v1alpha1`.
fn valid_api_version(v: &str) -> bool {
    let (group, version) = match v.rsplit_once('/') {
        Some((g, ver)) => (Some(g), ver),
        None => (None, v),
    };
    if let Some(g) = group {
        if g.is_empty() || !g.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-') {
            return false;
        }
    }
    let Some(rest) = version.strip_prefix('v') else { return false };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 { return false; }
    let tail = &rest[digits..];
    if tail.is_empty() { return true; }
    ["alpha", "beta"].iter().any(|stage| {
        tail.strip_prefix(stage).map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())).unwrap_or(false)
    })
}

/// 1-63 chars of `[a-zA-Z0-9-_.]`, starting and ending alphanumeric.
fn valid_name(s: &str) -> bool {
    let b = s.as_bytes();
    if b.is_empty() || b.len() > 63 { return false; }
    let edge_ok = |c: u8| c.is_ascii_alphanumeric();
    if !edge_ok(b[0]) || !edge_ok(b[b.len() - 1]) { return false; }
    b.iter().all(|&c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<ParserOutput, ParserError> {
        YamlDescriptorParser::with_max_bytes(4096).parse(yaml.as_bytes())
    }

    #[test]
    fn parses_component() {
        let out = parse(
            "apiVersion: backstage.io/v1alpha1\nkind: Component\nmetadata:\n  name: web\n  annotations:\n    owner: team-a\nspec:\n  type: website\n",
        )
        .expect("ok");
        let ParserOutput::Component(e) = out else { panic!("expected component") };
        assert_eq!(e.metadata.name.as_deref(), Some("web"));
        assert_eq!(e.metadata.annotations.get("owner").map(String::as_str), Some("team-a"));
        assert_eq!(e.spec, Some(serde_json::json!({ "type": "website" })));
    }

    #[test]
    fn other_kinds_are_not_components() {
        let out = parse("apiVersion: backstage.io/v1alpha1\nkind: Group\nmetadata:\n  name: team-a\n").expect("ok");
        assert_eq!(out, ParserOutput::Other { kind: "Group".into() });
    }

    #[test]
    fn component_without_name_parses() {
        let out = parse("apiVersion: v1\nkind: Component\nspec: {}\n").expect("ok");
        let ParserOutput::Component(e) = out else { panic!("expected component") };
        assert!(e.metadata.name.is_none());
    }

    #[test]
    fn errors_carry_component_name_when_known() {
        let err = parse("apiVersion: v1\nkind: Component\nmetadata:\n  name: web\nspec: [1, 2]\n").unwrap_err();
        assert_eq!(err.component_name.as_deref(), Some("web"));
        assert!(err.message.contains("spec"));

        let err = parse("kind: Component\nmetadata:\n  name: api\n").unwrap_err();
        assert_eq!(err.component_name.as_deref(), Some("api"));
    }

    #[test]
    fn malformed_yaml_has_no_name() {
        let err = parse("apiVersion: [unclosed\n").unwrap_err();
        assert!(err.component_name.is_none());
        assert!(parse("- just\n- a list\n").unwrap_err().message.contains("mapping"));
    }

    #[test]
    fn rejects_bad_names_and_labels() {
        assert!(parse("apiVersion: v1\nkind: Component\nmetadata:\n  name: -bad\n").is_err());
        assert!(parse("apiVersion: v1\nkind: Component\nmetadata:\n  name: ok\n  labels:\n    n: 3\n").is_err());
    }

    #[test]
    fn rejects_oversized_payload() {
        let big = format!("apiVersion: v1\nkind: Component\nmetadata:\n  name: a\n  description: {}\n", "x".repeat(5000));
        assert!(parse(&big).unwrap_err().message.contains("too large"));
    }

    #[test]
    fn default_limit_is_one_mebibyte() {
        let doc = "apiVersion: v1\nkind: Component\nmetadata:\n  name: a\n  description: ";
        let fill = DEFAULT_MAX_DOCUMENT_BYTES - doc.len() - 1;
        let parser = YamlDescriptorParser::with_max_bytes(DEFAULT_MAX_DOCUMENT_BYTES);
        let at_limit = format!("{}{}\n", doc, "x".repeat(fill));
        assert_eq!(at_limit.len(), 1_048_576);
        assert!(matches!(parser.parse(at_limit.as_bytes()), Ok(ParserOutput::Component(_))));
        let over = format!("{}{}\n", doc, "x".repeat(fill + 1));
        assert!(parser.parse(over.as_bytes()).unwrap_err().message.contains("too large"));
    }

    #[test]
    fn api_version_shapes() {
        assert!(valid_api_version("v1"));
        assert!(valid_api_version("backstage.io/v1alpha1"));
        assert!(valid_api_version("apps/v2beta3"));
        assert!(!valid_api_version("v1gamma1"));
        assert!(!valid_api_version("/v1"));
        assert!(!valid_api_version("Apps/v1"));
        assert!(!valid_api_version("1"));
    }

    #[test]
    fn name_shapes() {
        assert!(valid_name("a"));
        assert!(valid_name("my_service.v2"));
        assert!(!valid_name(""));
        assert!(!valid_name("trailing-"));
        assert!(!valid_name(&"a".repeat(64)));
    }
}
