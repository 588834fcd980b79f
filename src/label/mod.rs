//! The service-definition mini-language carried in container labels.
//!
//! A `consul.service.<name>` label value is a small block-structured
//! document:
//!
//! ```text
//! service {
//!   name = "api"
//!   port = 8080
//!   tags = ["web", "v2"]
//!   connect { sidecar_service { auto = true } }
//! }
//! ```
//!
//! [`parse_service_label`] evaluates the document into a
//! [`serde_json::Map`] so the normalizer can treat user input and registry
//! payload uniformly. The grammar is deliberately a subset: `attribute =
//! value` entries, named blocks with optional string labels, strings,
//! integers, booleans, nulls, tuples, and object expressions. There is no
//! template interpolation; `"${SERVICE_ID}"` is an ordinary string that the
//! normalizer resolves later.
//!
//! Sibling blocks of the same type overwrite each other instead of merging.
//! That is a documented limitation, not an accident.

mod lexer;
mod parser;

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors produced while parsing a service label.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The document is not well-formed.
    #[error("syntax error at {line}:{col}: {message}")]
    Syntax {
        /// 1-based line of the offending token.
        line: usize,
        /// 1-based column of the offending token.
        col: usize,
        /// What the parser expected or found.
        message: String,
    },

    /// No top-level `service` block was found.
    #[error("missing service block")]
    MissingServiceBlock,

    /// More than one top-level `service` block was found.
    #[error("multiple service blocks")]
    MultipleServiceBlocks,
}

/// Parse a label value and return the body of its single `service` block.
///
/// Top-level attributes and non-`service` blocks are ignored; zero or more
/// than one `service` block is an error.
pub fn parse_service_label(input: &str) -> Result<Map<String, Value>, ParseError> {
    parser::Parser::new(input)?.parse_document()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_service() {
        let svc = parse_service_label(r#"service { name = "api" port = 8080 }"#).unwrap();
        assert_eq!(svc.get("name"), Some(&json!("api")));
        assert_eq!(svc.get("port"), Some(&json!(8080)));
    }

    #[test]
    fn test_scalars_and_sequences() {
        let svc = parse_service_label(
            r#"
            service {
              name = "api"
              weight = -3
              enabled = true
              missing = null
              tags = ["web", "v2", 7]
              meta = { team = "core", tier : "gold" }
            }
            "#,
        )
        .unwrap();
        assert_eq!(svc.get("weight"), Some(&json!(-3)));
        assert_eq!(svc.get("enabled"), Some(&json!(true)));
        assert_eq!(svc.get("missing"), Some(&Value::Null));
        assert_eq!(svc.get("tags"), Some(&json!(["web", "v2", 7])));
        assert_eq!(svc.get("meta"), Some(&json!({"team": "core", "tier": "gold"})));
    }

    #[test]
    fn test_nested_blocks() {
        let svc = parse_service_label(
            r#"
            service {
              name = "api"
              connect {
                sidecar_service {
                  auto = true
                  proxy { config { bind_address = "0.0.0.0" } }
                }
              }
            }
            "#,
        )
        .unwrap();
        let auto = svc
            .get("connect")
            .and_then(|c| c.get("sidecar_service"))
            .and_then(|s| s.get("auto"));
        assert_eq!(auto, Some(&json!(true)));
    }

    #[test]
    fn test_block_labels_are_discarded() {
        let svc = parse_service_label(
            r#"
            service {
              name = "api"
              check "primary" { http = "http://api:8080/health" }
            }
            "#,
        )
        .unwrap();
        assert_eq!(
            svc.get("check").and_then(|c| c.get("http")),
            Some(&json!("http://api:8080/health"))
        );
    }

    #[test]
    fn test_sibling_blocks_overwrite() {
        let svc = parse_service_label(
            r#"
            service {
              name = "api"
              check { tcp = "a:1" }
              check { tcp = "b:2" }
            }
            "#,
        )
        .unwrap();
        assert_eq!(svc.get("check"), Some(&json!({"tcp": "b:2"})));
    }

    #[test]
    fn test_missing_service_block() {
        assert!(matches!(
            parse_service_label(r#"other { name = "api" }"#),
            Err(ParseError::MissingServiceBlock)
        ));
    }

    #[test]
    fn test_multiple_service_blocks() {
        assert!(matches!(
            parse_service_label(r#"service { name = "a" } service { name = "b" }"#),
            Err(ParseError::MultipleServiceBlocks)
        ));
    }

    #[test]
    fn test_syntax_error_carries_position() {
        let err = parse_service_label("service { name = }").unwrap_err();
        match err {
            ParseError::Syntax { line, .. } => assert_eq!(line, 1),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn test_comments_are_skipped() {
        let svc = parse_service_label(
            r#"
            # leading comment
            service {
              // mid comment
              name = "api" /* inline */ port = 8080
            }
            "#,
        )
        .unwrap();
        assert_eq!(svc.get("port"), Some(&json!(8080)));
    }

    #[test]
    fn test_placeholder_strings_stay_literal() {
        let svc = parse_service_label(
            r#"service { name = "api" check { alias_service = "${SERVICE_ID}" } }"#,
        )
        .unwrap();
        assert_eq!(
            svc.get("check").and_then(|c| c.get("alias_service")),
            Some(&json!("${SERVICE_ID}"))
        );
    }

    #[test]
    fn test_fractional_number_truncates() {
        let svc = parse_service_label(r#"service { name = "api" port = 8080.9 }"#).unwrap();
        assert_eq!(svc.get("port"), Some(&json!(8080)));
    }

    #[test]
    fn test_string_escapes() {
        let svc = parse_service_label(r#"service { name = "api" note = "a\"b\\c\nd" }"#).unwrap();
        assert_eq!(svc.get("note"), Some(&json!("a\"b\\c\nd")));
    }

    #[test]
    fn test_top_level_attributes_ignored() {
        let svc = parse_service_label(
            r#"
            stray = 1
            service { name = "api" }
            "#,
        )
        .unwrap();
        assert_eq!(svc.get("name"), Some(&json!("api")));
        assert!(!svc.contains_key("stray"));
    }
}
