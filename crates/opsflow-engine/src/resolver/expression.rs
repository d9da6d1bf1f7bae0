//! Entity-model expression analysis.
//!
//! Grammar (one hop per `.`-separated segment):
//!
//! ```text
//! package:entity[{attr op value}] ( .relation:entity[{attr op value}] )*
//! ```
//!
//! The first segment names a package and entity; each later segment follows
//! a relation attribute of the previous hop's entity and inherits its
//! package.

use serde::{Deserialize, Serialize};

use super::ResolveError;

/// One step of an analyzed expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionHop {
    pub package: String,
    pub entity: String,
    /// Relation attribute on the previous hop; `None` for the root hop.
    pub relation: Option<String>,
    pub filter: Option<HopFilter>,
}

/// Inline attribute filter, e.g. `{id eq host-1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopFilter {
    pub attr: String,
    pub op: String,
    pub value: String,
}

/// Analyze an expression into its hop list.
pub fn analyze_expression(expression: &str) -> Result<Vec<ExpressionHop>, ResolveError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(ResolveError::EmptyHops(expression.to_string()));
    }

    let mut hops = Vec::new();
    let mut package: Option<String> = None;

    for segment in split_segments(trimmed) {
        let (head, filter) = split_filter(&segment, expression)?;
        let (left, entity) = head.split_once(':').ok_or_else(|| {
            ResolveError::BadExpression(format!(
                "segment `{}` in `{}` is missing `:`",
                head, expression
            ))
        })?;
        if left.is_empty() || entity.is_empty() {
            return Err(ResolveError::BadExpression(format!(
                "segment `{}` in `{}` has an empty name",
                head, expression
            )));
        }

        let hop = match &package {
            // Root hop: left side is the package.
            None => {
                package = Some(left.to_string());
                ExpressionHop {
                    package: left.to_string(),
                    entity: entity.to_string(),
                    relation: None,
                    filter,
                }
            }
            // Later hop: left side is the relation attribute.
            Some(pkg) => ExpressionHop {
                package: pkg.clone(),
                entity: entity.to_string(),
                relation: Some(left.to_string()),
                filter,
            },
        };
        hops.push(hop);
    }

    if hops.is_empty() {
        return Err(ResolveError::EmptyHops(expression.to_string()));
    }
    Ok(hops)
}

/// Data-node routine expressions are multi-line: one expression per
/// non-empty line.
pub fn split_data_expressions(routine: &str) -> Vec<&str> {
    routine
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Split on `.` but never inside a `{...}` filter.
fn split_segments(expression: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0u32;
    for ch in expression.chars() {
        match ch {
            '{' => {
                depth += 1;
                current.push(ch);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            '.' if depth == 0 => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    segments.push(current);
    segments
}

fn split_filter(
    segment: &str,
    expression: &str,
) -> Result<(String, Option<HopFilter>), ResolveError> {
    let Some(open) = segment.find('{') else {
        return Ok((segment.to_string(), None));
    };
    let Some(close) = segment.rfind('}') else {
        return Err(ResolveError::BadExpression(format!(
            "unterminated filter in `{}`",
            expression
        )));
    };
    let head = segment[..open].to_string();
    let body = &segment[open + 1..close];
    let mut parts = body.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(attr), Some(op), Some(value)) if !attr.is_empty() && !value.is_empty() => Ok((
            head,
            Some(HopFilter {
                attr: attr.to_string(),
                op: op.to_string(),
                value: value.to_string(),
            }),
        )),
        _ => Err(ResolveError::BadExpression(format!(
            "filter `{{{}}}` in `{}` is not `attr op value`",
            body, expression
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_hop() {
        let hops = analyze_expression("wecmdb:app_system").unwrap();
        assert_eq!(hops.len(), 1);
        assert_eq!(hops[0].package, "wecmdb");
        assert_eq!(hops[0].entity, "app_system");
        assert!(hops[0].relation.is_none());
        assert!(hops[0].filter.is_none());
    }

    #[test]
    fn root_filter() {
        let hops = analyze_expression("wecmdb:app_system{id eq sys-1}").unwrap();
        let filter = hops[0].filter.as_ref().unwrap();
        assert_eq!(filter.attr, "id");
        assert_eq!(filter.op, "eq");
        assert_eq!(filter.value, "sys-1");
    }

    #[test]
    fn relation_hops_inherit_package() {
        let hops = analyze_expression("wecmdb:app_system.deploy_unit:unit.host:host").unwrap();
        assert_eq!(hops.len(), 3);
        assert_eq!(hops[1].relation.as_deref(), Some("deploy_unit"));
        assert_eq!(hops[1].package, "wecmdb");
        assert_eq!(hops[2].entity, "host");
    }

    #[test]
    fn dot_inside_filter_is_not_a_separator() {
        let hops = analyze_expression("wecmdb:host{ip eq 10.0.0.8}.disk:disk").unwrap();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].filter.as_ref().unwrap().value, "10.0.0.8");
    }

    #[test]
    fn rejects_malformed_segments() {
        assert!(analyze_expression("").is_err());
        assert!(analyze_expression("no_colon_here").is_err());
        assert!(analyze_expression("pkg:entity{broken").is_err());
        assert!(analyze_expression("pkg:entity{id}").is_err());
    }

    #[test]
    fn data_expressions_split_per_line() {
        let routine = "wecmdb:host\n\n  wecmdb:app_system.host:host  \n";
        assert_eq!(
            split_data_expressions(routine),
            vec!["wecmdb:host", "wecmdb:app_system.host:host"]
        );
    }
}
