use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TaskError};
use crate::task::{ContextValue, TaskContext};

/// `file` is the legacy declaration that still accepts `a:b:c` literal lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputQualifier {
    #[default]
    Path,
    File,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    File,
    Dir,
    #[default]
    Any,
}

/// Target expression of an output declaration.
///
/// - `"out_${sample}.txt"`: literal name, `${var}` placeholders are
///   replaced with context values
/// - `{"var": "reads"}`: the value of a context variable, as is
/// - `[...]`: a list of targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputTarget {
    Literal(String),
    List(Vec<OutputTarget>),
    Var { var: String },
}

impl OutputTarget {
    pub fn evaluate(&self, ctx: &TaskContext) -> Result<ContextValue> {
        match self {
            OutputTarget::Literal(s) => interpolate(s, ctx).map(ContextValue::Str),
            OutputTarget::Var { var } => Ok(ctx.get(var).cloned().unwrap_or(ContextValue::Null)),
            OutputTarget::List(items) => items
                .iter()
                .map(|t| t.evaluate(ctx))
                .collect::<Result<Vec<_>>>()
                .map(ContextValue::List),
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::Literal(s) => f.write_str(s),
            OutputTarget::Var { var } => write!(f, "${{{var}}}"),
            OutputTarget::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

fn interpolate(template: &str, ctx: &TaskContext) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            TaskError::InvalidOutputSpec(format!("unterminated placeholder in `{template}`"))
        })?;
        let name = after[..end].trim();
        let value = ctx.get(name).ok_or_else(|| {
            TaskError::InvalidOutputSpec(format!("unknown variable `{name}` in `{template}`"))
        })?;
        out.push_str(&value.to_string());
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Matching options of one output declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct OutputOptions {
    pub optional: bool,
    pub follow_links: bool,
    pub glob: bool,
    /// Let glob wildcards match dot-files.
    pub hidden: bool,
    /// Let glob matches include the files staged as task inputs.
    pub include_inputs: bool,
    pub max_depth: Option<usize>,
    #[serde(rename = "type")]
    pub kind: OutputType,
}

impl Default for OutputOptions {
    fn default() -> Self {
        Self {
            optional: false,
            follow_links: true,
            glob: true,
            hidden: false,
            include_inputs: false,
            max_depth: None,
            kind: OutputType::Any,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    pub target: OutputTarget,
    #[serde(default)]
    pub qualifier: OutputQualifier,
    #[serde(default)]
    pub options: OutputOptions,
}

impl OutputSpec {
    pub fn path(target: impl Into<String>) -> Self {
        Self {
            target: OutputTarget::Literal(target.into()),
            qualifier: OutputQualifier::Path,
            options: OutputOptions::default(),
        }
    }

    pub fn file(target: impl Into<String>) -> Self {
        Self {
            qualifier: OutputQualifier::File,
            ..Self::path(target)
        }
    }

    /// Builds a declaration from a loose option map. Keys outside the
    /// recognised set are rejected.
    pub fn from_options(
        target: OutputTarget,
        qualifier: OutputQualifier,
        options: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        let options: OutputOptions = serde_json::from_value(serde_json::Value::Object(options))
            .map_err(|e| TaskError::InvalidOutputSpec(e.to_string()))?;
        Ok(Self {
            target,
            qualifier,
            options,
        })
    }

    pub fn with_options(mut self, options: OutputOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TaskContext {
        let mut ctx = TaskContext::new();
        ctx.insert("sample".into(), ContextValue::Str("s1".into()));
        ctx.insert("bam".into(), ContextValue::Path("s1.bam".into()));
        ctx
    }

    #[test]
    fn options_defaults() {
        let o = OutputOptions::default();
        assert!(o.follow_links);
        assert!(o.glob);
        assert!(!o.hidden);
        assert!(!o.optional);
        assert!(!o.include_inputs);
        assert_eq!(o.max_depth, None);
        assert_eq!(o.kind, OutputType::Any);
    }

    #[test]
    fn from_options_accepts_known_keys() {
        let map = json!({"optional": true, "hidden": true, "maxDepth": 2, "type": "file"});
        let spec = OutputSpec::from_options(
            OutputTarget::Literal("*.txt".into()),
            OutputQualifier::Path,
            map.as_object().unwrap().clone(),
        )
        .unwrap();
        assert!(spec.options.optional);
        assert!(spec.options.hidden);
        assert!(spec.options.follow_links);
        assert_eq!(spec.options.max_depth, Some(2));
        assert_eq!(spec.options.kind, OutputType::File);
    }

    #[test]
    fn from_options_rejects_unknown_keys() {
        let map = json!({"optional": true, "folowLinks": false});
        let err = OutputSpec::from_options(
            OutputTarget::Literal("x".into()),
            OutputQualifier::Path,
            map.as_object().unwrap().clone(),
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::InvalidOutputSpec(ref m) if m.contains("folowLinks")));
    }

    #[test]
    fn literal_interpolates_context() {
        let t = OutputTarget::Literal("${sample}.vcf".into());
        assert_eq!(t.evaluate(&ctx()).unwrap(), ContextValue::Str("s1.vcf".into()));
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let t = OutputTarget::Literal("${nope}.vcf".into());
        assert!(matches!(
            t.evaluate(&ctx()),
            Err(TaskError::InvalidOutputSpec(_))
        ));
    }

    #[test]
    fn var_keeps_the_value_kind() {
        let t = OutputTarget::Var { var: "bam".into() };
        assert_eq!(t.evaluate(&ctx()).unwrap(), ContextValue::Path("s1.bam".into()));
        let missing = OutputTarget::Var { var: "other".into() };
        assert_eq!(missing.evaluate(&ctx()).unwrap(), ContextValue::Null);
    }

    #[test]
    fn spec_from_json() {
        let spec: OutputSpec = serde_json::from_value(json!({
            "target": ["a.txt", {"var": "bam"}],
            "qualifier": "file",
            "options": {"glob": false}
        }))
        .unwrap();
        assert_eq!(spec.qualifier, OutputQualifier::File);
        assert!(!spec.options.glob);
        assert_eq!(
            spec.target,
            OutputTarget::List(vec![
                OutputTarget::Literal("a.txt".into()),
                OutputTarget::Var { var: "bam".into() },
            ])
        );
    }
}
