// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed input/output port declarations and validation.
//!
//! A process declares its interface as two port namespaces, one for inputs
//! and one for outputs. Namespaces nest; a nested port is addressed by a
//! dotted path such as `nested.inner.value`. When values have to be stored
//! flat (as link labels), the dots are rewritten to `__` and back.
//!
//! Validation is strict: unknown keys are rejected unless the enclosing
//! namespace is dynamic, required ports must resolve (explicitly or via
//! default), and declared kinds must match. Input validation failures are
//! synchronous errors; output validation failures become structured exit
//! codes on the finished process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{EngineError, Result};

/// Separator used when a dotted port path is flattened into a link label.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// The JSON kinds a port accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// JSON boolean.
    Bool,
    /// JSON integer.
    Int,
    /// JSON float (accepts integers too).
    Float,
    /// JSON string.
    Str,
    /// JSON array.
    List,
    /// JSON object.
    Dict,
    /// Anything.
    Any,
}

impl ValueKind {
    /// Whether `value` is acceptable for this kind.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Bool => value.is_boolean(),
            Self::Int => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Str => value.is_string(),
            Self::List => value.is_array(),
            Self::Dict => value.is_object(),
            Self::Any => true,
        }
    }

    /// Human-readable kind name for error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::List => "list",
            Self::Dict => "dict",
            Self::Any => "any",
        }
    }
}

/// Default factory for an optional port.
pub type DefaultFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// A single typed port.
#[derive(Clone)]
pub struct Port {
    /// Whether a value must resolve for validation to pass.
    pub required: bool,
    /// Acceptable kinds; empty means any.
    pub kinds: Vec<ValueKind>,
    /// Factory producing a value when none is supplied.
    pub default: Option<DefaultFn>,
    /// Metadata ports parametrize execution without becoming provenance
    /// inputs; they are excluded from linking and content hashing.
    pub metadata: bool,
    /// Short help text.
    pub help: Option<String>,
}

impl Port {
    /// A required port accepting the given kind.
    pub fn required(kind: ValueKind) -> Self {
        Self {
            required: true,
            kinds: vec![kind],
            default: None,
            metadata: false,
            help: None,
        }
    }

    /// An optional port accepting the given kind.
    pub fn optional(kind: ValueKind) -> Self {
        Self {
            required: false,
            kinds: vec![kind],
            default: None,
            metadata: false,
            help: None,
        }
    }

    /// Attach a default value factory. Implies optional.
    pub fn with_default(mut self, default: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.required = false;
        self.default = Some(Arc::new(default));
        self
    }

    /// Mark this port as metadata.
    pub fn as_metadata(mut self) -> Self {
        self.metadata = true;
        self
    }

    /// Attach help text.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    fn accepts(&self, value: &Value) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|kind| kind.matches(value))
    }

    fn expected_kinds(&self) -> String {
        self.kinds
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("required", &self.required)
            .field("kinds", &self.kinds)
            .field("has_default", &self.default.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// An entry in a namespace: a leaf port or a nested namespace.
#[derive(Debug, Clone)]
pub enum PortEntry {
    /// A leaf port.
    Port(Port),
    /// A nested namespace.
    Namespace(PortNamespace),
}

/// An ordered collection of named ports and sub-namespaces.
#[derive(Debug, Clone, Default)]
pub struct PortNamespace {
    /// Entries keyed by segment name.
    pub entries: BTreeMap<String, PortEntry>,
    /// Dynamic namespaces accept keys that were never declared.
    pub dynamic: bool,
}

impl PortNamespace {
    /// An empty, non-dynamic namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty namespace accepting undeclared keys.
    pub fn dynamic() -> Self {
        Self {
            entries: BTreeMap::new(),
            dynamic: true,
        }
    }

    /// Add a leaf port under `name`.
    pub fn port(mut self, name: impl Into<String>, port: Port) -> Self {
        self.entries.insert(name.into(), PortEntry::Port(port));
        self
    }

    /// Add a nested namespace under `name`.
    pub fn namespace(mut self, name: impl Into<String>, namespace: PortNamespace) -> Self {
        self.entries
            .insert(name.into(), PortEntry::Namespace(namespace));
        self
    }

    /// Look up a port by dotted path.
    pub fn port_at(&self, path: &str) -> Option<&Port> {
        let mut namespace = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            match namespace.entries.get(segment)? {
                PortEntry::Port(port) => {
                    return segments.peek().is_none().then_some(port);
                }
                PortEntry::Namespace(nested) => namespace = nested,
            }
        }
        None
    }

    /// Dotted paths of all declared leaf ports, in deterministic order.
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_leaf_paths("", &mut paths);
        paths
    }

    fn collect_leaf_paths(&self, prefix: &str, paths: &mut Vec<String>) {
        for (name, entry) in &self.entries {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            match entry {
                PortEntry::Port(_) => paths.push(path),
                PortEntry::Namespace(nested) => nested.collect_leaf_paths(&path, paths),
            }
        }
    }
}

/// The declared interface of a process class.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Input port namespace.
    pub inputs: PortNamespace,
    /// Output port namespace.
    pub outputs: PortNamespace,
}

impl ProcessSpec {
    /// Start building a spec.
    pub fn builder() -> SpecBuilder {
        SpecBuilder::default()
    }
}

/// Builder for [`ProcessSpec`].
#[derive(Debug, Default)]
pub struct SpecBuilder {
    inputs: PortNamespace,
    outputs: PortNamespace,
}

impl SpecBuilder {
    /// Declare an input port.
    pub fn input(mut self, name: impl Into<String>, port: Port) -> Self {
        self.inputs = self.inputs.port(name, port);
        self
    }

    /// Declare a nested input namespace.
    pub fn input_namespace(mut self, name: impl Into<String>, namespace: PortNamespace) -> Self {
        self.inputs = self.inputs.namespace(name, namespace);
        self
    }

    /// Accept undeclared input keys at the top level.
    pub fn dynamic_inputs(mut self) -> Self {
        self.inputs.dynamic = true;
        self
    }

    /// Declare an output port.
    pub fn output(mut self, name: impl Into<String>, port: Port) -> Self {
        self.outputs = self.outputs.port(name, port);
        self
    }

    /// Accept undeclared output keys at the top level.
    pub fn dynamic_outputs(mut self) -> Self {
        self.outputs.dynamic = true;
        self
    }

    /// Finish the spec.
    pub fn build(self) -> ProcessSpec {
        ProcessSpec {
            inputs: self.inputs,
            outputs: self.outputs,
        }
    }
}

/// The outcome of validating raw inputs against a spec.
#[derive(Debug, Clone, Default)]
pub struct ValidatedInputs {
    /// Resolved values keyed by dotted port path, defaults included.
    pub values: BTreeMap<String, Value>,
    /// Paths of ports declared as metadata.
    pub metadata: BTreeSet<String>,
}

impl ValidatedInputs {
    /// Resolved value at a dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }

    /// Values that participate in provenance (non-metadata only).
    pub fn provenance_values(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .filter(|(path, _)| !self.metadata.contains(*path))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect()
    }
}

/// A single problem found while validating outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputViolation {
    /// A required output was never attached.
    Missing {
        /// The dotted path of the missing port.
        path: String,
    },
    /// An attached output is undeclared or has the wrong kind.
    Invalid {
        /// The offending dotted path.
        path: String,
        /// What is wrong with it.
        message: String,
    },
}

/// Validate raw inputs (a JSON object, possibly nested) against the input
/// namespace. Returns resolved dotted-path values with defaults applied.
pub fn validate_inputs(spec: &ProcessSpec, inputs: &Value) -> Result<ValidatedInputs> {
    let object = inputs.as_object().ok_or_else(|| {
        EngineError::validation("<root>", "inputs must be an object".to_string())
    })?;

    let mut validated = ValidatedInputs::default();
    validate_namespace(&spec.inputs, "", object, &mut validated)?;
    Ok(validated)
}

fn validate_namespace(
    namespace: &PortNamespace,
    prefix: &str,
    supplied: &serde_json::Map<String, Value>,
    out: &mut ValidatedInputs,
) -> Result<()> {
    let qualify = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        }
    };

    // Reject undeclared keys unless the namespace is dynamic.
    if !namespace.dynamic {
        for key in supplied.keys() {
            if !namespace.entries.contains_key(key) {
                return Err(EngineError::validation(
                    qualify(key),
                    "unexpected input: no such port".to_string(),
                ));
            }
        }
    }

    for (name, entry) in &namespace.entries {
        let path = qualify(name);
        match entry {
            PortEntry::Port(port) => match supplied.get(name) {
                Some(value) => {
                    if !port.accepts(value) {
                        return Err(EngineError::validation(
                            path,
                            format!("expected {}, got {value}", port.expected_kinds()),
                        ));
                    }
                    if port.metadata {
                        out.metadata.insert(path.clone());
                    }
                    out.values.insert(path, value.clone());
                }
                None => {
                    if let Some(default) = &port.default {
                        if port.metadata {
                            out.metadata.insert(path.clone());
                        }
                        out.values.insert(path, default());
                    } else if port.required {
                        return Err(EngineError::validation(
                            path,
                            "required port has no value and no default".to_string(),
                        ));
                    }
                }
            },
            PortEntry::Namespace(nested) => {
                let empty = serde_json::Map::new();
                let sub = match supplied.get(name) {
                    Some(Value::Object(sub)) => sub,
                    Some(other) => {
                        return Err(EngineError::validation(
                            path,
                            format!("expected a namespace object, got {other}"),
                        ));
                    }
                    None => &empty,
                };
                validate_namespace(nested, &path, sub, out)?;
            }
        }
    }

    // Dynamic namespaces pass undeclared keys through untouched.
    if namespace.dynamic {
        for (key, value) in supplied {
            if !namespace.entries.contains_key(key) {
                out.values.insert(qualify(key), value.clone());
            }
        }
    }

    Ok(())
}

/// Validate attached outputs (keyed by dotted path) against the output
/// namespace. Returns all violations; an empty vector means the outputs
/// are acceptable.
pub fn validate_outputs(
    spec: &ProcessSpec,
    outputs: &BTreeMap<String, Value>,
) -> Vec<OutputViolation> {
    let mut violations = Vec::new();

    for path in spec.outputs.leaf_paths() {
        let port = match spec.outputs.port_at(&path) {
            Some(port) => port,
            None => continue,
        };
        match outputs.get(&path) {
            Some(value) => {
                if !port.accepts(value) {
                    violations.push(OutputViolation::Invalid {
                        path: path.clone(),
                        message: format!("expected {}, got {value}", port.expected_kinds()),
                    });
                }
            }
            None => {
                if port.required {
                    violations.push(OutputViolation::Missing { path: path.clone() });
                }
            }
        }
    }

    for path in outputs.keys() {
        if spec.outputs.port_at(path).is_none() && !output_path_is_dynamic(&spec.outputs, path) {
            violations.push(OutputViolation::Invalid {
                path: path.clone(),
                message: "unexpected output: no such port".to_string(),
            });
        }
    }

    violations
}

fn output_path_is_dynamic(namespace: &PortNamespace, path: &str) -> bool {
    let mut namespace = namespace;
    for segment in path.split('.') {
        match namespace.entries.get(segment) {
            Some(PortEntry::Namespace(nested)) => namespace = nested,
            Some(PortEntry::Port(_)) => return false,
            None => return namespace.dynamic,
        }
    }
    false
}

/// Rewrite a dotted port path into a flat link label.
pub fn path_to_label(path: &str) -> String {
    path.replace('.', NAMESPACE_SEPARATOR)
}

/// Rewrite a flat link label back into a dotted port path.
pub fn label_to_path(label: &str) -> String {
    label.replace(NAMESPACE_SEPARATOR, ".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> ProcessSpec {
        ProcessSpec::builder()
            .input("x", Port::required(ValueKind::Int))
            .input("y", Port::required(ValueKind::Int))
            .input(
                "label",
                Port::optional(ValueKind::Str)
                    .with_default(|| json!("untitled"))
                    .as_metadata(),
            )
            .input_namespace(
                "options",
                PortNamespace::new().port("retries", Port::optional(ValueKind::Int)),
            )
            .output("result", Port::required(ValueKind::Int))
            .output("log", Port::optional(ValueKind::Str))
            .build()
    }

    #[test]
    fn test_valid_inputs_with_defaults() {
        let validated = validate_inputs(
            &spec(),
            &json!({"x": 1, "y": 2, "options": {"retries": 3}}),
        )
        .unwrap();

        assert_eq!(validated.get("x"), Some(&json!(1)));
        assert_eq!(validated.get("options.retries"), Some(&json!(3)));
        assert_eq!(validated.get("label"), Some(&json!("untitled")));
        assert!(validated.metadata.contains("label"));

        // Metadata excluded from provenance values.
        let provenance = validated.provenance_values();
        assert!(!provenance.contains_key("label"));
        assert!(provenance.contains_key("x"));
    }

    #[test]
    fn test_missing_required_input() {
        let err = validate_inputs(&spec(), &json!({"x": 1})).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("'y'"));
    }

    #[test]
    fn test_unexpected_input_rejected() {
        let err = validate_inputs(&spec(), &json!({"x": 1, "y": 2, "z": 3})).unwrap_err();
        assert!(err.to_string().contains("'z'"));
    }

    #[test]
    fn test_kind_mismatch() {
        let err = validate_inputs(&spec(), &json!({"x": "one", "y": 2})).unwrap_err();
        assert!(err.to_string().contains("expected int"));
    }

    #[test]
    fn test_dynamic_namespace_accepts_unknown_keys() {
        let spec = ProcessSpec::builder()
            .input("x", Port::required(ValueKind::Int))
            .dynamic_inputs()
            .build();

        let validated = validate_inputs(&spec, &json!({"x": 1, "extra": true})).unwrap();
        assert_eq!(validated.get("extra"), Some(&json!(true)));
    }

    #[test]
    fn test_float_accepts_int() {
        let spec = ProcessSpec::builder()
            .input("ratio", Port::required(ValueKind::Float))
            .build();
        validate_inputs(&spec, &json!({"ratio": 2})).unwrap();
        validate_inputs(&spec, &json!({"ratio": 2.5})).unwrap();
    }

    #[test]
    fn test_output_validation() {
        let spec = spec();

        let mut outputs = BTreeMap::new();
        outputs.insert("result".to_string(), json!(3));
        assert!(validate_outputs(&spec, &outputs).is_empty());

        // Missing required output.
        let violations = validate_outputs(&spec, &BTreeMap::new());
        assert_eq!(
            violations,
            vec![OutputViolation::Missing {
                path: "result".to_string()
            }]
        );

        // Wrong kind and unexpected key.
        let mut outputs = BTreeMap::new();
        outputs.insert("result".to_string(), json!("three"));
        outputs.insert("surprise".to_string(), json!(1));
        let violations = validate_outputs(&spec, &outputs);
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn test_dynamic_outputs() {
        let spec = ProcessSpec::builder().dynamic_outputs().build();
        let mut outputs = BTreeMap::new();
        outputs.insert("anything".to_string(), json!([1, 2]));
        assert!(validate_outputs(&spec, &outputs).is_empty());
    }

    #[test]
    fn test_path_label_rewriting() {
        assert_eq!(path_to_label("options.retries"), "options__retries");
        assert_eq!(label_to_path("options__retries"), "options.retries");
        assert_eq!(path_to_label("flat"), "flat");
    }

    #[test]
    fn test_leaf_paths_are_ordered() {
        assert_eq!(
            spec().inputs.leaf_paths(),
            vec!["label", "options.retries", "x", "y"]
        );
    }

    #[test]
    fn test_port_at() {
        let spec = spec();
        assert!(spec.inputs.port_at("options.retries").is_some());
        assert!(spec.inputs.port_at("options").is_none());
        assert!(spec.inputs.port_at("options.nope").is_none());
        assert!(spec.inputs.port_at("x.deep").is_none());
    }
}
