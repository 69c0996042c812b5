//! Pipeline text parsing and alias resolution.
//!
//! Grammar: `pipeline = op ("|" op)*`, `op = name arg*`. The parser reads
//! one identifier, resolves it against the alias table and the operator
//! registry, and delegates argument parsing to the operator's factory.
//! Aliases expand recursively with a cycle guard.

use weir_types::EngineError;

use crate::config::EngineConfig;
use crate::op::Operator;
use crate::pipeline::registry::Registry;
use crate::pipeline::Pipeline;

/// Parse a pipeline string into a typed operator chain.
pub fn parse_pipeline(
    text: &str,
    registry: &Registry,
    config: &EngineConfig,
) -> Result<Pipeline, EngineError> {
    let mut ops = Vec::new();
    let mut stack = Vec::new();
    parse_into(text, registry, config, &mut stack, &mut ops)?;
    if ops.is_empty() {
        return Err(EngineError::syntax("pipeline is empty"));
    }
    Ok(Pipeline::new(ops))
}

fn parse_into(
    text: &str,
    registry: &Registry,
    config: &EngineConfig,
    stack: &mut Vec<String>,
    ops: &mut Vec<Box<dyn Operator>>,
) -> Result<(), EngineError> {
    let mut rest = text;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return Ok(());
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '|')
            .unwrap_or(rest.len());
        let name = &rest[..end];
        if name.is_empty() {
            return Err(EngineError::syntax(format!(
                "expected an operator name, got `{}`",
                rest.chars().next().map(String::from).unwrap_or_default()
            )));
        }
        rest = &rest[end..];

        let alias = config.operators.get(name);
        let builtin = registry.get(name);
        match (alias, builtin) {
            (Some(_), Some(_)) => {
                return Err(EngineError::invalid_configuration(format!(
                    "`{name}` names both a built-in operator and an alias"
                )));
            }
            (Some(body), None) => {
                if stack.iter().any(|seen| seen == name) {
                    return Err(EngineError::invalid_configuration(format!(
                        "alias `{name}` expands recursively (via {})",
                        stack.join(" -> ")
                    )));
                }
                stack.push(name.to_string());
                parse_into(body, registry, config, stack, ops)?;
                stack.pop();
                // An alias body is a complete operator sequence: only a
                // pipe or the end of input may follow its use.
                rest = rest.trim_start();
                if !rest.is_empty() && !rest.starts_with('|') {
                    return Err(EngineError::syntax(format!(
                        "unexpected arguments after alias `{name}`"
                    )));
                }
            }
            (None, Some(factory)) => {
                let (parsed, tail) = factory.parse(rest)?;
                ops.extend(parsed);
                rest = tail.trim_start();
            }
            (None, None) => {
                return Err(EngineError::lookup(format!("unknown operator `{name}`")));
            }
        }

        rest = rest.trim_start();
        if rest.is_empty() {
            return Ok(());
        }
        match rest.strip_prefix('|') {
            Some(after) => {
                rest = after;
                if rest.trim_start().is_empty() {
                    return Err(EngineError::syntax("trailing `|` without an operator"));
                }
            }
            None => {
                return Err(EngineError::syntax(format!(
                    "expected `|` between operators, got `{}`",
                    rest.chars().take(12).collect::<String>()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config_with(aliases: &[(&str, &str)]) -> EngineConfig {
        EngineConfig {
            operators: aliases
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            ..EngineConfig::default()
        }
    }

    fn parse(text: &str, config: &EngineConfig) -> Result<Pipeline, EngineError> {
        parse_pipeline(text, &Registry::with_builtins(), config)
    }

    #[test]
    fn test_parse_simple_chain() {
        let pipeline = parse("read json | head 3", &EngineConfig::default()).unwrap();
        assert_eq!(pipeline.to_string(), "read json | head 3");
        assert_eq!(pipeline.operators().len(), 2);
    }

    #[test]
    fn test_unknown_operator_is_lookup_error() {
        let err = parse("transmogrify", &EngineConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::Lookup(_)));
        assert!(err.to_string().contains("transmogrify"));
    }

    #[test]
    fn test_empty_pipeline_is_syntax_error() {
        assert!(matches!(
            parse("", &EngineConfig::default()),
            Err(EngineError::Syntax(_))
        ));
        assert!(matches!(
            parse("   ", &EngineConfig::default()),
            Err(EngineError::Syntax(_))
        ));
    }

    #[test]
    fn test_trailing_pipe_is_syntax_error() {
        assert!(matches!(
            parse("pass |", &EngineConfig::default()),
            Err(EngineError::Syntax(_))
        ));
        assert!(matches!(
            parse("pass | | pass", &EngineConfig::default()),
            Err(EngineError::Syntax(_))
        ));
    }

    #[test]
    fn test_alias_expansion() {
        let config = config_with(&[("suricata", "read json --ndjson --selector event_type:suricata")]);
        let pipeline = parse("suricata | head 1", &config).unwrap();
        assert_eq!(
            pipeline.to_string(),
            "read json --ndjson --selector event_type:suricata | head 1"
        );
    }

    #[test]
    fn test_alias_referencing_alias() {
        let config = config_with(&[("a", "pass"), ("b", "a | a")]);
        let pipeline = parse("b", &config).unwrap();
        assert_eq!(pipeline.to_string(), "pass | pass");
    }

    #[test]
    fn test_recursive_alias_is_detected() {
        let config = config_with(&[("foo", "bar"), ("bar", "foo")]);
        let err = parse("foo", &config).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
        assert!(err.to_string().contains("foo"));
    }

    #[test]
    fn test_self_recursive_alias_is_detected() {
        let config = config_with(&[("loop", "loop | head 1")]);
        assert!(matches!(
            parse("loop", &config),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_alias_shadowing_builtin_is_rejected() {
        let config = config_with(&[("head", "pass")]);
        let err = parse("head 3", &config).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_alias_must_be_followed_by_pipe_or_end() {
        let config = config_with(&[("noop", "pass")]);
        assert!(parse("noop | pass", &config).is_ok());
        let err = parse("noop extra", &config).unwrap_err();
        assert!(matches!(err, EngineError::Syntax(_)));
    }
}
