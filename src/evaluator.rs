//! The feature/experiment evaluation engine: walks a feature's rule list,
//! applies prerequisites, filters, namespaces, forced overrides and rollouts,
//! and finally performs hash-bucketed variation selection. Pure function of
//! `(EvalContext, key)` — no I/O, no locking beyond what the caller already
//! did to build the snapshot.
use std::collections::{HashMap, HashSet};

use log::warn;
use serde_json::{json, Value};

use crate::condition::eval_condition;
use crate::model::{
    Experiment, ExperimentBuilder, ExperimentResult, ExperimentResultBuilder, Feature, FeatureMap, FeatureResult,
    FeatureResultBuilder, FeatureRule, ForcedVariationsMap, SavedGroupsMap, Source,
};
use crate::sticky_bucket::{self, StickyBucketService};
use crate::util;
use crate::value;

/// An immutable snapshot of everything the evaluator needs: the catalog,
/// saved groups, and the calling client's local overrides. Built fresh for
/// each `eval_feature`/`run_experiment` call under the client's read lock,
/// then evaluated lock-free.
pub struct EvalContext<'a> {
    pub features: &'a FeatureMap,
    pub saved_groups: &'a SavedGroupsMap,
    pub attributes: &'a Value,
    pub url: &'a str,
    pub forced_variations: &'a ForcedVariationsMap,
    pub enabled: bool,
    pub qa_mode: bool,
    pub sticky_bucket_service: Option<&'a dyn StickyBucketService>,
}

fn attr_path<'a>(attributes: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = attributes;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Resolves the hash attribute's name and string value, trying the primary
/// attribute first and falling back to `fallback_attribute` if the primary
/// is absent or null. Returns `None` if neither yields a non-empty value.
fn resolve_hash_value<'a>(ctx: &EvalContext, hash_attribute: Option<&'a str>, fallback_attribute: Option<&'a str>) -> Option<(String, String)> {
    let primary = hash_attribute.unwrap_or("id");
    if let Some(v) = attr_path(ctx.attributes, primary) {
        if !v.is_null() {
            let s = value::to_display_string(v);
            if !s.is_empty() {
                return Some((primary.to_string(), s));
            }
        }
    }
    if let Some(fallback) = fallback_attribute {
        if let Some(v) = attr_path(ctx.attributes, fallback) {
            if !v.is_null() {
                let s = value::to_display_string(v);
                if !s.is_empty() {
                    return Some((fallback.to_string(), s));
                }
            }
        }
    }
    None
}

/// Resolves a single attribute to its non-empty display string, independent
/// of any primary/fallback preference order.
fn resolve_attribute_string(ctx: &EvalContext, attribute: &str) -> Option<String> {
    let v = attr_path(ctx.attributes, attribute)?;
    if v.is_null() {
        return None;
    }
    let s = value::to_display_string(v);
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn feature_result(value: Value, source: Source, rule_id: Option<String>, experiment: Option<Experiment>, experiment_result: Option<ExperimentResult>) -> FeatureResult {
    let on = value::js_truthy(&value);
    FeatureResultBuilder::default()
        .value(value)
        .on(on)
        .off(!on)
        .source(source)
        .rule_id(rule_id)
        .experiment(experiment)
        .experiment_result(experiment_result)
        .build()
        .expect("all FeatureResult fields are populated above")
}

/// Evaluates a single feature by key, walking its rule list in order and
/// returning the first matching result (or the feature's default value).
/// Detects prerequisite cycles within this call.
pub fn eval_feature(ctx: &EvalContext, key: &str) -> FeatureResult {
    let mut stack = HashSet::new();
    eval_feature_inner(ctx, key, &mut stack)
}

fn eval_feature_inner(ctx: &EvalContext, key: &str, stack: &mut HashSet<String>) -> FeatureResult {
    if stack.contains(key) {
        return feature_result(Value::Null, Source::CyclicPrerequisite, None, None, None);
    }
    let Some(feature) = ctx.features.get(key) else {
        return feature_result(Value::Null, Source::UnknownFeature, None, None, None);
    };

    stack.insert(key.to_string());
    let result = eval_rules(ctx, key, feature, stack);
    stack.remove(key);

    result.unwrap_or_else(|| feature_result(feature.default_value.clone().unwrap_or(Value::Null), Source::DefaultValue, None, None, None))
}

fn eval_rules(ctx: &EvalContext, key: &str, feature: &Feature, stack: &mut HashSet<String>) -> Option<FeatureResult> {
    for rule in &feature.rules {
        if let Some(result) = eval_rule(ctx, key, rule, stack) {
            return Some(result);
        }
    }
    None
}

fn is_filtered_out(ctx: &EvalContext, filters: &[crate::model::Filter]) -> bool {
    for filter in filters {
        let Some((_, hash_value)) = resolve_hash_value(ctx, Some(filter.attribute.as_str()), None) else {
            return true;
        };
        // Filter hashVersion defaults to 2 when absent from the catalog JSON.
        let version = if filter.hash_version == 0 { 2 } else { filter.hash_version };
        let Some(n) = util::hash(&filter.seed, &hash_value, version) else {
            return true;
        };
        if !filter.ranges.iter().any(|r| util::in_range(n, r)) {
            return true;
        }
    }
    false
}

fn is_included_in_rollout(
    ctx: &EvalContext,
    seed: &str,
    hash_attribute: Option<&str>,
    range: Option<&crate::model::BucketRange>,
    coverage: Option<f32>,
    hash_version: Option<i32>,
) -> bool {
    if range.is_none() && coverage.is_none() {
        return true;
    }

    let Some((_, hash_value)) = resolve_hash_value(ctx, hash_attribute, None) else {
        return false;
    };

    match util::hash(seed, &hash_value, hash_version.unwrap_or(1)) {
        Some(n) => {
            if let Some(range) = range {
                util::in_range(n, range)
            } else if let Some(coverage) = coverage {
                n <= coverage
            } else {
                true
            }
        }
        None => false,
    }
}

/// Evaluates a single prerequisite. Returns `Ok(true)` if the parent's
/// condition passes, `Ok(false)` if it fails (caller decides whether that
/// gates or merely skips), or `Err(())` if the parent's evaluation hit a
/// cycle and must be propagated as `cyclicPrerequisite`.
fn eval_parent_condition(ctx: &EvalContext, parent: &crate::model::ParentCondition, stack: &mut HashSet<String>) -> Result<bool, ()> {
    let parent_result = eval_feature_inner(ctx, &parent.id, stack);
    if parent_result.source == Source::CyclicPrerequisite {
        return Err(());
    }
    let synthetic_attrs = json!({ "value": parent_result.value });
    Ok(eval_condition(&synthetic_attrs, &parent.condition, ctx.saved_groups))
}

fn eval_rule(ctx: &EvalContext, feature_id: &str, rule: &FeatureRule, stack: &mut HashSet<String>) -> Option<FeatureResult> {
    if let Some(condition) = &rule.condition {
        if !eval_condition(ctx.attributes, condition, ctx.saved_groups) {
            return None;
        }
    }

    for parent in &rule.parent_conditions {
        match eval_parent_condition(ctx, parent, stack) {
            Err(()) => return Some(feature_result(Value::Null, Source::CyclicPrerequisite, None, None, None)),
            Ok(true) => {}
            Ok(false) => {
                if parent.gate {
                    return Some(feature_result(Value::Null, Source::Prerequisite, None, None, None));
                }
                return None;
            }
        }
    }

    if is_filtered_out(ctx, &rule.filters) {
        return None;
    }

    if let Some(force) = &rule.force {
        let seed = rule.seed.as_deref().unwrap_or(feature_id);
        // Open question (a): when both `range` and `coverage` are present, range wins.
        if !is_included_in_rollout(ctx, seed, rule.hash_attribute.as_deref(), rule.range.as_ref(), rule.coverage, rule.hash_version) {
            return None;
        }
        return Some(feature_result(force.clone(), Source::Force, rule.id.clone(), None, None));
    }

    if rule.variations.is_empty() {
        return None;
    }

    let experiment = ExperimentBuilder::default()
        .key(rule.key.clone().unwrap_or_else(|| feature_id.to_string()))
        .variations(rule.variations.clone())
        .weights(rule.weights.clone())
        .coverage(rule.coverage)
        .ranges(rule.ranges.clone())
        .condition(rule.condition.clone())
        .parent_conditions(rule.parent_conditions.clone())
        .namespace(rule.namespace.clone())
        .meta(rule.meta.clone())
        .filters(rule.filters.clone())
        .seed(rule.seed.clone())
        .name(rule.name.clone())
        .phase(rule.phase.clone())
        .hash_attribute(rule.hash_attribute.clone())
        .fallback_attribute(rule.fallback_attribute.clone())
        .hash_version(rule.hash_version)
        .build()
        .expect("all Experiment fields have defaults");

    let result = run_experiment_inner(ctx, &experiment, Some(feature_id), stack);
    if !result.in_experiment || result.passthrough {
        return None;
    }

    Some(feature_result(result.value.clone(), Source::Experiment, rule.id.clone(), Some(experiment), Some(result)))
}

fn experiment_result(
    exp: &Experiment,
    variation_index: Option<i32>,
    hash_used: bool,
    feature_id: Option<&str>,
    bucket: Option<f32>,
    hash_attribute: &str,
    hash_value: &str,
    sticky_bucket_used: bool,
) -> ExperimentResult {
    let mut in_experiment = true;
    let mut variation_index = variation_index.unwrap_or(-1);
    if variation_index < 0 || variation_index >= exp.variations.len() as i32 {
        variation_index = 0;
        in_experiment = false;
    }

    let meta = exp.meta.get(variation_index as usize);
    ExperimentResultBuilder::default()
        .in_experiment(in_experiment)
        .variation_id(variation_index)
        .value(exp.variations.get(variation_index as usize).cloned().unwrap_or(Value::Null))
        .hash_used(hash_used)
        .hash_attribute(hash_attribute.to_string())
        .hash_value(hash_value.to_string())
        .feature_id(feature_id.map(str::to_string))
        .key(meta.and_then(|m| m.key.clone()).unwrap_or_else(|| variation_index.to_string()))
        .bucket(bucket)
        .name(meta.and_then(|m| m.name.clone()))
        .passthrough(meta.and_then(|m| m.passthrough).unwrap_or(false))
        .sticky_bucket_used(sticky_bucket_used)
        .build()
        .expect("all ExperimentResult fields have defaults")
}

fn excluded(exp: &Experiment, feature_id: Option<&str>, hash_attribute: &str, hash_value: &str) -> ExperimentResult {
    experiment_result(exp, None, false, feature_id, None, hash_attribute, hash_value, false)
}

/// Public entry point for directly running an ad hoc experiment (not sourced
/// from a feature rule).
pub fn run_experiment(ctx: &EvalContext, exp: &Experiment) -> ExperimentResult {
    let mut stack = HashSet::new();
    run_experiment_inner(ctx, exp, None, &mut stack)
}

fn sticky_bucket_version_key(exp: &Experiment) -> String {
    sticky_bucket::assignment_key(&exp.key, 0)
}

fn run_experiment_inner(ctx: &EvalContext, exp: &Experiment, feature_id: Option<&str>, stack: &mut HashSet<String>) -> ExperimentResult {
    if exp.variations.len() < 2 || !ctx.enabled {
        return excluded(exp, feature_id, exp.hash_attribute.as_deref().unwrap_or("id"), "");
    }

    if !ctx.url.is_empty() {
        if let Some(qs) = util::get_query_string_override(&exp.key, ctx.url, exp.variations.len() as i32) {
            return experiment_result(exp, Some(qs), false, feature_id, None, exp.hash_attribute.as_deref().unwrap_or("id"), "", false);
        }
    }

    if let Some(forced) = ctx.forced_variations.get(&exp.key) {
        return experiment_result(exp, Some(*forced), false, feature_id, None, exp.hash_attribute.as_deref().unwrap_or("id"), "", false);
    }

    if exp.active == Some(false) {
        return excluded(exp, feature_id, exp.hash_attribute.as_deref().unwrap_or("id"), "");
    }

    let Some((hash_attribute, hash_value)) = resolve_hash_value(ctx, exp.hash_attribute.as_deref(), exp.fallback_attribute.as_deref()) else {
        return excluded(exp, feature_id, exp.hash_attribute.as_deref().unwrap_or("id"), "");
    };

    if let Some(sticky_service) = ctx.sticky_bucket_service {
        if let Some(idx) = sticky_bucket_variation(sticky_service, ctx, exp, &hash_attribute, &hash_value) {
            return experiment_result(exp, Some(idx), false, feature_id, None, &hash_attribute, &hash_value, true);
        }
    }

    if !exp.filters.is_empty() {
        if is_filtered_out(ctx, &exp.filters) {
            return excluded(exp, feature_id, &hash_attribute, &hash_value);
        }
    } else if let Some(ns) = &exp.namespace {
        if !ns.id.is_empty() && !util::in_namespace(&hash_value, ns) {
            return excluded(exp, feature_id, &hash_attribute, &hash_value);
        }
    }

    if let Some(condition) = &exp.condition {
        if !eval_condition(ctx.attributes, condition, ctx.saved_groups) {
            return excluded(exp, feature_id, &hash_attribute, &hash_value);
        }
    }

    for parent in &exp.parent_conditions {
        match eval_parent_condition(ctx, parent, stack) {
            Ok(true) => {}
            Ok(false) | Err(()) => return excluded(exp, feature_id, &hash_attribute, &hash_value),
        }
    }

    let ranges = if !exp.ranges.is_empty() {
        exp.ranges.clone()
    } else {
        util::get_bucket_ranges(exp.variations.len() as i32, exp.coverage.unwrap_or(1.0), Some(exp.weights.clone()))
    };

    let seed = exp.seed.clone().unwrap_or_else(|| exp.key.clone());
    let Some(n) = util::hash(&seed, &hash_value, exp.hash_version.unwrap_or(1)) else {
        return excluded(exp, feature_id, &hash_attribute, &hash_value);
    };

    let assigned = util::choose_variation(n, &ranges);
    if assigned == -1 {
        return excluded(exp, feature_id, &hash_attribute, &hash_value);
    }

    if let Some(force) = exp.force {
        return experiment_result(exp, Some(force), false, feature_id, Some(n), &hash_attribute, &hash_value, false);
    }

    if ctx.qa_mode {
        return excluded(exp, feature_id, &hash_attribute, &hash_value);
    }

    let result = experiment_result(exp, Some(assigned), true, feature_id, Some(n), &hash_attribute, &hash_value, false);

    if let Some(sticky_service) = ctx.sticky_bucket_service {
        save_sticky_assignment(sticky_service, exp, &hash_attribute, &hash_value, &result);
    }

    result
}

/// Looks up a prior sticky-bucket assignment for this experiment. Honors
/// `minBucketVersion` blocking (decision (c): blocked means silent
/// exclusion via the normal `excluded` path, not a dedicated `Source`).
///
/// Merges the docs for the primary hash attribute and, if distinct and
/// resolvable, the fallback attribute, via `get_all_assignments` — primary
/// entries win on collision, fallback entries fill gaps, so a doc saved
/// under the fallback attribute is still found once the primary attribute
/// becomes available.
fn sticky_bucket_variation(svc: &dyn StickyBucketService, ctx: &EvalContext, exp: &Experiment, hash_attribute: &str, hash_value: &str) -> Option<i32> {
    let fallback = exp.fallback_attribute.as_deref().filter(|a| *a != hash_attribute).and_then(|a| resolve_attribute_string(ctx, a).map(|v| (a.to_string(), v)));

    let mut lookup = HashMap::new();
    lookup.insert(hash_attribute.to_string(), hash_value.to_string());
    if let Some((attr, value)) = &fallback {
        lookup.insert(attr.clone(), value.clone());
    }
    let docs = svc.get_all_assignments(&lookup);

    let mut merged: HashMap<String, String> = HashMap::new();
    if let Some((attr, value)) = &fallback {
        if let Some(doc) = docs.get(&sticky_bucket::doc_key(attr, value)) {
            merged.extend(doc.assignments.clone());
        }
    }
    if let Some(doc) = docs.get(&sticky_bucket::doc_key(hash_attribute, hash_value)) {
        merged.extend(doc.assignments.clone());
    }

    let key = sticky_bucket_version_key(exp);
    let variation_key = merged.get(&key)?;
    exp.meta.iter().position(|m| m.key.as_deref() == Some(variation_key.as_str())).map(|i| i as i32)
}

fn save_sticky_assignment(svc: &dyn StickyBucketService, exp: &Experiment, hash_attribute: &str, hash_value: &str, result: &ExperimentResult) {
    if !result.in_experiment {
        return;
    }
    let mut assignments = std::collections::HashMap::new();
    assignments.insert(sticky_bucket_version_key(exp), result.key.clone());
    let mut doc = svc
        .get_assignments(hash_attribute, hash_value)
        .unwrap_or_else(|| crate::model::StickyBucketAssignmentDoc {
            attribute_name: hash_attribute.to_string(),
            attribute_value: hash_value.to_string(),
            assignments: std::collections::HashMap::new(),
        });
    if sticky_bucket::merge_assignments(&mut doc, &assignments) {
        svc.save_assignments(&doc);
    }
}

/// Converts a stored feature value into a typed fallback for ergonomic
/// getters, mirroring the teacher's `get_feature_value_as_*` helpers.
pub fn on_off(value: &Value) -> (bool, bool) {
    let on = value::js_truthy(value);
    (on, !on)
}

#[allow(dead_code)]
fn warn_unreachable() {
    warn!("evaluator module loaded");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketRangeBuilder, Feature, FeatureRuleBuilder, ParentConditionBuilder};
    use crate::sticky_bucket::InMemoryStickyBucketService;
    use std::collections::HashMap;

    fn ctx<'a>(features: &'a FeatureMap, saved_groups: &'a SavedGroupsMap, attributes: &'a Value, forced: &'a ForcedVariationsMap) -> EvalContext<'a> {
        EvalContext {
            features,
            saved_groups,
            attributes,
            url: "",
            forced_variations: forced,
            enabled: true,
            qa_mode: false,
            sticky_bucket_service: None,
        }
    }

    #[test]
    fn unknown_feature() {
        let features = FeatureMap::new();
        let groups = SavedGroupsMap::new();
        let attrs = json!({});
        let forced = ForcedVariationsMap::new();
        let c = ctx(&features, &groups, &attrs, &forced);
        let result = eval_feature(&c, "missing");
        assert_eq!(result.source, Source::UnknownFeature);
        assert!(result.value.is_null());
    }

    #[test]
    fn default_value_when_no_rules_match() {
        let mut features = FeatureMap::new();
        features.insert("flag".to_string(), Feature { default_value: Some(json!(true)), rules: vec![] });
        let groups = SavedGroupsMap::new();
        let attrs = json!({});
        let forced = ForcedVariationsMap::new();
        let c = ctx(&features, &groups, &attrs, &forced);
        let result = eval_feature(&c, "flag");
        assert_eq!(result.source, Source::DefaultValue);
        assert_eq!(result.value, json!(true));
        assert!(result.on);
    }

    #[test]
    fn cyclic_prerequisite_terminates() {
        let mut features = FeatureMap::new();
        features.insert(
            "a".to_string(),
            Feature {
                default_value: Some(json!(false)),
                rules: vec![FeatureRuleBuilder::default()
                    .parent_conditions(vec![ParentConditionBuilder::default().id("b".to_string()).condition(json!({"value": true})).gate(true).build().unwrap()])
                    .force(Some(json!(true)))
                    .build()
                    .unwrap()],
            },
        );
        features.insert(
            "b".to_string(),
            Feature {
                default_value: Some(json!(false)),
                rules: vec![FeatureRuleBuilder::default()
                    .parent_conditions(vec![ParentConditionBuilder::default().id("a".to_string()).condition(json!({"value": true})).gate(true).build().unwrap()])
                    .force(Some(json!(true)))
                    .build()
                    .unwrap()],
            },
        );
        let groups = SavedGroupsMap::new();
        let attrs = json!({});
        let forced = ForcedVariationsMap::new();
        let c = ctx(&features, &groups, &attrs, &forced);
        let result = eval_feature(&c, "a");
        assert_eq!(result.source, Source::CyclicPrerequisite);
    }

    #[test]
    fn gated_prerequisite_blocks_evaluation() {
        let mut features = FeatureMap::new();
        features.insert("parent".to_string(), Feature { default_value: Some(json!(false)), rules: vec![] });
        features.insert(
            "child".to_string(),
            Feature {
                default_value: Some(json!("default")),
                rules: vec![FeatureRuleBuilder::default()
                    .parent_conditions(vec![ParentConditionBuilder::default().id("parent".to_string()).condition(json!({"value": {"$eq": true}})).gate(true).build().unwrap()])
                    .force(Some(json!("forced")))
                    .build()
                    .unwrap()],
            },
        );
        let groups = SavedGroupsMap::new();
        let attrs = json!({});
        let forced = ForcedVariationsMap::new();
        let c = ctx(&features, &groups, &attrs, &forced);
        let result = eval_feature(&c, "child");
        assert_eq!(result.source, Source::Prerequisite);
        assert!(result.value.is_null());
    }

    #[test]
    fn non_gate_prerequisite_skips_rule_only() {
        let mut features = FeatureMap::new();
        features.insert("parent".to_string(), Feature { default_value: Some(json!(false)), rules: vec![] });
        features.insert(
            "child".to_string(),
            Feature {
                default_value: Some(json!("fallback")),
                rules: vec![FeatureRuleBuilder::default()
                    .parent_conditions(vec![ParentConditionBuilder::default().id("parent".to_string()).condition(json!({"value": {"$eq": true}})).gate(false).build().unwrap()])
                    .force(Some(json!("forced")))
                    .build()
                    .unwrap()],
            },
        );
        let groups = SavedGroupsMap::new();
        let attrs = json!({});
        let forced = ForcedVariationsMap::new();
        let c = ctx(&features, &groups, &attrs, &forced);
        let result = eval_feature(&c, "child");
        assert_eq!(result.source, Source::DefaultValue);
        assert_eq!(result.value, json!("fallback"));
    }

    #[test]
    fn force_by_query_string_override() {
        let exp = ExperimentBuilder::default().key("my-exp".to_string()).variations(vec![json!("a"), json!("b")]).build().unwrap();
        let features = FeatureMap::new();
        let groups = SavedGroupsMap::new();
        let attrs = json!({"id": "u1"});
        let forced = ForcedVariationsMap::new();
        let mut c = ctx(&features, &groups, &attrs, &forced);
        c.url = "http://x/?my-exp=1";
        let result = run_experiment(&c, &exp);
        assert!(!result.hash_used);
        assert!(result.in_experiment);
        assert_eq!(result.variation_id, 1);
    }

    #[test]
    fn sticky_bucket_hit_overrides_hash() {
        let svc = InMemoryStickyBucketService::new();
        let mut assignments = HashMap::new();
        assignments.insert("exp1__0".to_string(), "vkey".to_string());
        svc.save_assignments(&crate::model::StickyBucketAssignmentDoc { attribute_name: "id".to_string(), attribute_value: "u1".to_string(), assignments });

        let exp = ExperimentBuilder::default()
            .key("exp1".to_string())
            .variations(vec![json!("a"), json!("b")])
            .meta(vec![
                crate::model::VariationMetaBuilder::default().key(Some("vkey".to_string())).build().unwrap(),
                crate::model::VariationMetaBuilder::default().key(Some("other".to_string())).build().unwrap(),
            ])
            .build()
            .unwrap();

        let features = FeatureMap::new();
        let groups = SavedGroupsMap::new();
        let attrs = json!({"id": "u1"});
        let forced = ForcedVariationsMap::new();
        let mut c = ctx(&features, &groups, &attrs, &forced);
        c.sticky_bucket_service = Some(&svc);

        let result = run_experiment(&c, &exp);
        assert_eq!(result.variation_id, 0);
        assert!(result.sticky_bucket_used);
        assert!(!result.hash_used);
    }

    #[test]
    fn sticky_bucket_fallback_attribute_fills_gap_when_primary_unseen() {
        let svc = InMemoryStickyBucketService::new();
        let mut assignments = HashMap::new();
        assignments.insert("exp1__0".to_string(), "vkey".to_string());
        // Saved under the fallback attribute (e.g. an anonymous device id),
        // before the primary attribute (e.g. a logged-in user id) existed.
        svc.save_assignments(&crate::model::StickyBucketAssignmentDoc { attribute_name: "deviceId".to_string(), attribute_value: "d1".to_string(), assignments });

        let exp = ExperimentBuilder::default()
            .key("exp1".to_string())
            .variations(vec![json!("a"), json!("b")])
            .fallback_attribute(Some("deviceId".to_string()))
            .meta(vec![
                crate::model::VariationMetaBuilder::default().key(Some("vkey".to_string())).build().unwrap(),
                crate::model::VariationMetaBuilder::default().key(Some("other".to_string())).build().unwrap(),
            ])
            .build()
            .unwrap();

        let features = FeatureMap::new();
        let groups = SavedGroupsMap::new();
        let attrs = json!({"id": "u1", "deviceId": "d1"});
        let forced = ForcedVariationsMap::new();
        let mut c = ctx(&features, &groups, &attrs, &forced);
        c.sticky_bucket_service = Some(&svc);

        let result = run_experiment(&c, &exp);
        assert_eq!(result.variation_id, 0);
        assert!(result.sticky_bucket_used);
    }

    #[test]
    fn sticky_bucket_primary_wins_over_fallback_on_collision() {
        let svc = InMemoryStickyBucketService::new();
        let mut primary_assignments = HashMap::new();
        primary_assignments.insert("exp1__0".to_string(), "vkey".to_string());
        svc.save_assignments(&crate::model::StickyBucketAssignmentDoc { attribute_name: "id".to_string(), attribute_value: "u1".to_string(), assignments: primary_assignments });

        let mut fallback_assignments = HashMap::new();
        fallback_assignments.insert("exp1__0".to_string(), "other".to_string());
        svc.save_assignments(&crate::model::StickyBucketAssignmentDoc { attribute_name: "deviceId".to_string(), attribute_value: "d1".to_string(), assignments: fallback_assignments });

        let exp = ExperimentBuilder::default()
            .key("exp1".to_string())
            .variations(vec![json!("a"), json!("b")])
            .fallback_attribute(Some("deviceId".to_string()))
            .meta(vec![
                crate::model::VariationMetaBuilder::default().key(Some("vkey".to_string())).build().unwrap(),
                crate::model::VariationMetaBuilder::default().key(Some("other".to_string())).build().unwrap(),
            ])
            .build()
            .unwrap();

        let features = FeatureMap::new();
        let groups = SavedGroupsMap::new();
        let attrs = json!({"id": "u1", "deviceId": "d1"});
        let forced = ForcedVariationsMap::new();
        let mut c = ctx(&features, &groups, &attrs, &forced);
        c.sticky_bucket_service = Some(&svc);

        let result = run_experiment(&c, &exp);
        assert_eq!(result.variation_id, 0);
    }

    #[test]
    fn version_operator_padding_comparison() {
        // Spec example: "1.2.0" <= "1.10.0"
        use crate::condition::eval_operator_condition;
        let groups = SavedGroupsMap::new();
        assert!(eval_operator_condition("$vgte", Some(&json!("1.10.0")), &json!("1.2.0"), &groups));
    }

    #[test]
    fn bucket_range_formula_matches_variation_assignment() {
        let br = BucketRangeBuilder::default().range_start(0.0).range_end(0.5).build().unwrap();
        assert!(util::in_range(0.23, &br));
    }
}
