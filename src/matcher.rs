//! Rule matching.
//!
//! - a disabled rule never matches and its filter is not evaluated
//! - an empty filter matches every event
//! - otherwise the filter is evaluated against `{data, attributes, id}`
//!
//! [`matches`] treats a filter that fails to parse or evaluate as a
//! non-match: the error is logged and `Ok(false)` is returned, so one broken
//! rule cannot stop the others. [`matches_strict`] surfaces the same error to
//! the caller instead; the dispatcher uses it when `strictFilterEvaluation` is
//! enabled.

use crate::config::Rule;
use crate::event::Event;
use crate::expr::ExprError;
use thiserror::Error;
use tracing::{debug, error};

/// Errors surfaced by [`matches_strict`].
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("failed to evaluate the filter of rule '{rule}': {source}")]
    Filter {
        rule: String,
        #[source]
        source: ExprError,
    },
}

/// Signature shared by [`matches`] and [`matches_strict`].
pub type MatchFn = fn(&Rule, &Event) -> Result<bool, MatchError>;

/// Decide whether `rule` applies to `event`, absorbing filter errors.
pub fn matches(rule: &Rule, event: &Event) -> Result<bool, MatchError> {
    match matches_strict(rule, event) {
        Ok(matched) => Ok(matched),
        Err(e) => {
            error!(
                rule = %rule.name,
                filter = %rule.filter_expression,
                error = %e,
                "Filter evaluation failed, treating the event as not matching"
            );
            Ok(false)
        }
    }
}

/// Decide whether `rule` applies to `event`, returning filter errors.
pub fn matches_strict(rule: &Rule, event: &Event) -> Result<bool, MatchError> {
    if rule.disabled {
        debug!(rule = %rule.name, "Rule is disabled");
        return Ok(false);
    }

    let Some(filter) = rule.filter() else {
        return Ok(true);
    };

    let to_error = |source| MatchError::Filter {
        rule: rule.name.clone(),
        source,
    };

    let expression = filter.as_ref().map_err(|e| to_error(e.clone()))?;
    let matched = expression
        .evaluate_bool(event.canonical())
        .map_err(to_error)?;

    debug!(rule = %rule.name, matched, "Evaluated filter");
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Event {
        Event::from_value(json!({"action": "opened", "pr": {"number": 12}}))
            .with_attributes([("eventType", "pull_request")])
            .with_id("m-1")
    }

    #[test]
    fn test_disabled_never_matches() {
        for filter in ["", "true", "data.nope ==", "id == 'm-1'"] {
            let rule = Rule::new("r", "log").with_filter(filter).disabled();
            assert!(!matches(&rule, &event()).unwrap());
            assert!(!matches_strict(&rule, &event()).unwrap());
        }
    }

    #[test]
    fn test_empty_filter_always_matches() {
        for filter in ["", "   "] {
            let rule = Rule::new("r", "log").with_filter(filter);
            assert!(matches(&rule, &event()).unwrap());
            assert!(matches(&rule, &Event::default()).unwrap());
        }
    }

    #[test]
    fn test_filter_evaluation() {
        let hit = Rule::new("r", "log")
            .with_filter("attributes.eventType == 'pull_request' && data.pr.number > 10");
        let miss = Rule::new("r", "log").with_filter("has(data.commits)");

        assert!(matches(&hit, &event()).unwrap());
        assert!(!matches(&miss, &event()).unwrap());
    }

    #[test]
    fn test_eval_error_is_non_match() {
        let rule = Rule::new("r", "log").with_filter("data.missing.field == 1");
        assert!(!matches(&rule, &event()).unwrap());
    }

    #[test]
    fn test_parse_error_is_non_match() {
        let rule = Rule::new("r", "log").with_filter("data.action ==");
        assert!(!matches(&rule, &event()).unwrap());
    }

    #[test]
    fn test_non_bool_result_is_non_match() {
        let rule = Rule::new("r", "log").with_filter("data.action");
        assert!(!matches(&rule, &event()).unwrap());
    }

    #[test]
    fn test_strict_surfaces_errors() {
        let rule = Rule::new("broken", "log").with_filter("data.missing.field == 1");
        let err = matches_strict(&rule, &event()).unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(err.to_string().contains("no such key: missing"));
    }

    #[test]
    fn test_overly_nested_filter_is_rejected() {
        let filter = format!("{}true{}", "(".repeat(100_000), ")".repeat(100_000));
        let rule = Rule::new("nested", "log").with_filter(filter);

        assert!(!matches(&rule, &event()).unwrap());
        let err = matches_strict(&rule, &event()).unwrap_err();
        assert!(err.to_string().contains("nested deeper than"));
    }
}
