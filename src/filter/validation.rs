//! `VALIDATION` filter: per-node parameter checks.

use super::context::{Flow, FilterContext};
use crate::error::GatewayError;
use crate::model::{Operator, Validation};

/// Every validation of the node must hold. Absent optional values skip
/// their rules; an absent required value fails.
pub fn validation_pre(ctx: &FilterContext) -> Result<Flow, GatewayError> {
    let Some(node) = ctx.node() else {
        return Ok(Flow::Continue);
    };

    for validation in &node.validations {
        if !check(ctx, validation) {
            tracing::debug!(
                api = %ctx.api.name,
                param = %validation.parameter.name,
                "Parameter validation failed"
            );
            return Err(GatewayError::ValidationFailed);
        }
    }
    Ok(Flow::Continue)
}

fn check(ctx: &FilterContext, validation: &Validation) -> bool {
    let param = &validation.parameter;
    let value = ctx
        .origin
        .value(param.source, &param.name, &ctx.params)
        .filter(|v| !v.is_empty());

    match value {
        None => !validation.required,
        Some(value) => validation
            .rules
            .iter()
            .all(|rule| ctx.shared.matcher.compare(Operator::Regex, &value, rule)),
    }
}
