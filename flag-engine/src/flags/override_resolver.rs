use crate::flags::flag_models::{EvaluationContext, FlagOverrides, OverrideKind};

/// Resolves a flag decision for a context.
///
/// Overrides are tried in `OverrideKind::PRECEDENCE` order (user, group, region), and only for
/// dimensions the context actually carries. The first matching override decides; with no match
/// the flag's global state is returned.
pub fn resolve(
    global_enabled: bool,
    overrides: &FlagOverrides,
    context: &EvaluationContext,
) -> bool {
    OverrideKind::PRECEDENCE
        .iter()
        .find_map(|kind| {
            let target_id = context.value_for(*kind)?;
            overrides.get(*kind, target_id).map(|o| o.is_enabled)
        })
        .unwrap_or(global_enabled)
}
