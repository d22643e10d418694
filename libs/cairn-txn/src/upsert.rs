//! The Upsert Engine: diffs an incoming resource JSON against the stored
//! entity and emits a minimal mutation set, per the seven-step algorithm —
//! element enumeration, dispatch by shape, stable-identity matching for
//! repeatable composites, reference resolution, contained-resource matching,
//! code interning, and the closing CAS guard.

use std::collections::HashSet;

use cairn_store::{CasGuard, CodeKey, ElementPath, Mutation};
use serde_json::Value;
use tracing::warn;

use crate::schema::{Cardinality, ElementDescriptor, ElementKind, ResourceSchema, SchemaTable};
use crate::tempid::TransactionContext;
use cairn_store::error::{Error, Result};

pub struct UpsertOutcome {
    pub mutations: Vec<Mutation>,
    pub cas_guard: CasGuard,
}

/// Strips the server-managed `meta.versionId` / `meta.lastUpdated` fields
/// before diffing, per the normalization rule the algorithm is specified
/// with.
pub fn normalize_incoming(resource: &Value) -> Value {
    let mut normalized = resource.clone();
    if let Some(meta) = normalized.get_mut("meta").and_then(|m| m.as_object_mut()) {
        meta.remove("versionId");
        meta.remove("lastUpdated");
        if meta.is_empty() {
            normalized.as_object_mut().unwrap().remove("meta");
        }
    }
    normalized
}

pub fn upsert(
    entity: &str,
    resource_type: &str,
    old: Option<&Value>,
    new_raw: &Value,
    expected_version: Option<i64>,
    desired_version: i64,
    ctx: &mut TransactionContext,
) -> Result<UpsertOutcome> {
    let new = normalize_incoming(new_raw);
    let schema = SchemaTable::resolve(resource_type, &new);
    let contained_ids = contained_local_ids(&new);

    let mut mutations = Vec::new();
    seed_identity(entity, resource_type, old, &mut mutations);
    walk_elements(&schema.elements, entity, &ElementPath::new(), old, &new, &contained_ids, ctx, &mut mutations)?;

    let cas_guard = CasGuard {
        entity: entity.to_string(),
        expected: expected_version,
        desired: desired_version,
    };

    Ok(UpsertOutcome { mutations, cas_guard })
}

/// The hand-authored schemas (and `infer_schema`) deliberately omit
/// `resourceType`/`id`/`meta` — they're server-managed housekeeping, not
/// clinical content the walk should diff. But that means the walk itself
/// never emits them, and a fresh create folds onto `{}` with nothing to seed
/// them from. Set both explicitly, skipping the mutation once `old` already
/// agrees so a no-op update stays a no-op.
fn seed_identity(entity: &str, resource_type: &str, old: Option<&Value>, out: &mut Vec<Mutation>) {
    let id = entity.rsplit('/').next().unwrap_or(entity);

    if old.and_then(|o| o.get("resourceType")).and_then(Value::as_str) != Some(resource_type) {
        out.push(Mutation::SetScalar {
            entity: entity.to_string(),
            path: ElementPath::new().field("resourceType"),
            value: Value::String(resource_type.to_string()),
        });
    }
    if old.and_then(|o| o.get("id")).and_then(Value::as_str) != Some(id) {
        out.push(Mutation::SetScalar {
            entity: entity.to_string(),
            path: ElementPath::new().field("id"),
            value: Value::String(id.to_string()),
        });
    }
}

/// Local ids (`Resource.contained[].id`) available at the root of the
/// resource being upserted. Contained references (`#local`) resolve against
/// this set regardless of how deep in the element tree the reference sits.
fn contained_local_ids(new: &Value) -> HashSet<String> {
    new.get("contained")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("id").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}

fn walk_elements(
    elements: &[ElementDescriptor],
    entity: &str,
    base_path: &ElementPath,
    old: Option<&Value>,
    new: &Value,
    contained_ids: &HashSet<String>,
    ctx: &mut TransactionContext,
    out: &mut Vec<Mutation>,
) -> Result<()> {
    for descriptor in elements {
        if descriptor.is_choice() {
            walk_choice(descriptor, entity, base_path, old, new, contained_ids, ctx, out)?;
            continue;
        }
        let old_val = old.and_then(|o| o.get(&descriptor.name));
        let new_val = new.get(&descriptor.name);
        let path = base_path.clone().field(descriptor.name.clone());

        match (descriptor.cardinality, descriptor.kind) {
            (Cardinality::One, ElementKind::Primitive) => {
                dispatch_primitive_one(entity, &path, old_val, new_val, out);
            }
            (Cardinality::Many, ElementKind::Primitive) => {
                dispatch_primitive_many(entity, &path, old_val, new_val, out);
            }
            (Cardinality::One, ElementKind::Composite) => {
                dispatch_composite_one(descriptor, entity, &path, old_val, new_val, contained_ids, ctx, out)?;
            }
            (Cardinality::Many, ElementKind::Composite) => {
                dispatch_composite_many(descriptor, entity, &path, old_val, new_val, contained_ids, ctx, out)?;
            }
            (Cardinality::One, ElementKind::Reference) => {
                dispatch_reference(entity, &path, old_val, new_val, contained_ids, ctx, out)?;
            }
            (Cardinality::Many, ElementKind::Reference) => {
                // Not exercised by the hand-authored schemas; treated like a
                // composite-many of reference objects for completeness.
                dispatch_composite_many(descriptor, entity, &path, old_val, new_val, contained_ids, ctx, out)?;
            }
            (_, ElementKind::ContainedResource) => {
                dispatch_contained(entity, &path, old_val, new_val, contained_ids, ctx, out)?;
            }
        }
    }
    Ok(())
}

fn walk_choice(
    descriptor: &ElementDescriptor,
    entity: &str,
    base_path: &ElementPath,
    old: Option<&Value>,
    new: &Value,
    contained_ids: &HashSet<String>,
    ctx: &mut TransactionContext,
    out: &mut Vec<Mutation>,
) -> Result<()> {
    let old_variant = descriptor
        .choice_variants
        .iter()
        .find(|v| old.and_then(|o| o.get(&v.field_name)).is_some());
    let new_variant = descriptor
        .choice_variants
        .iter()
        .find(|v| new.get(&v.field_name).is_some());

    match (old_variant, new_variant) {
        (Some(old_v), None) => {
            out.push(Mutation::UnsetScalar {
                entity: entity.to_string(),
                path: base_path.clone().field(old_v.field_name.clone()),
            });
        }
        (None, None) => {}
        (Some(old_v), Some(new_v)) if old_v.field_name == new_v.field_name => {
            let path = base_path.clone().field(new_v.field_name.clone());
            let old_val = old.and_then(|o| o.get(&old_v.field_name));
            let new_val = new.get(&new_v.field_name);
            match new_v.kind {
                ElementKind::Composite => {
                    let synthetic = ElementDescriptor::composite(&new_v.field_name, new_v.children.clone());
                    dispatch_composite_one(&synthetic, entity, &path, old_val, new_val, contained_ids, ctx, out)?;
                }
                _ => dispatch_primitive_one(entity, &path, old_val, new_val, out),
            }
        }
        (old_opt, Some(new_v)) => {
            if let Some(old_v) = old_opt {
                out.push(Mutation::UnsetScalar {
                    entity: entity.to_string(),
                    path: base_path.clone().field(old_v.field_name.clone()),
                });
            }
            let path = base_path.clone().field(new_v.field_name.clone());
            let new_val = new.get(&new_v.field_name).expect("variant matched by presence");
            out.push(Mutation::SetScalar {
                entity: entity.to_string(),
                path,
                value: new_val.clone(),
            });
        }
    }
    Ok(())
}

fn dispatch_primitive_one(entity: &str, path: &ElementPath, old_val: Option<&Value>, new_val: Option<&Value>, out: &mut Vec<Mutation>) {
    match (old_val, new_val) {
        (None, Some(new)) => out.push(Mutation::SetScalar { entity: entity.to_string(), path: path.clone(), value: new.clone() }),
        (Some(_), None) => out.push(Mutation::UnsetScalar { entity: entity.to_string(), path: path.clone() }),
        (Some(old), Some(new)) if old != new => {
            out.push(Mutation::SetScalar { entity: entity.to_string(), path: path.clone(), value: new.clone() })
        }
        _ => {}
    }
}

fn dispatch_primitive_many(entity: &str, path: &ElementPath, old_val: Option<&Value>, new_val: Option<&Value>, out: &mut Vec<Mutation>) {
    let old_items = old_val.and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let new_items = new_val.and_then(|v| v.as_array()).cloned().unwrap_or_default();
    for old in &old_items {
        if !new_items.contains(old) {
            out.push(Mutation::RemoveFromSet { entity: entity.to_string(), path: path.clone(), value: old.clone() });
        }
    }
    for new in &new_items {
        if !old_items.contains(new) {
            out.push(Mutation::AddToSet { entity: entity.to_string(), path: path.clone(), value: new.clone() });
        }
    }
}

fn dispatch_composite_one(
    descriptor: &ElementDescriptor,
    entity: &str,
    path: &ElementPath,
    old_val: Option<&Value>,
    new_val: Option<&Value>,
    contained_ids: &HashSet<String>,
    ctx: &mut TransactionContext,
    out: &mut Vec<Mutation>,
) -> Result<()> {
    match new_val {
        None => {
            if old_val.is_some() {
                out.push(Mutation::UnsetScalar { entity: entity.to_string(), path: path.clone() });
            }
        }
        Some(new) => {
            if descriptor.codeable {
                intern_coding(new, ctx, out);
            }
            walk_elements(&descriptor.children, entity, path, old_val, new, contained_ids, ctx, out)?;
        }
    }
    Ok(())
}

/// Shallow, single-level diff cost between two composite instances: the
/// number of top-level keys whose value differs. Used only to rank
/// candidate pairs for stable-identity matching, not as the diff itself.
fn shallow_cost(a: &Value, b: &Value) -> usize {
    let (Some(ao), Some(bo)) = (a.as_object(), b.as_object()) else {
        return if a == b { 0 } else { 1 };
    };
    let mut keys: std::collections::BTreeSet<&String> = ao.keys().collect();
    keys.extend(bo.keys());
    keys.into_iter().filter(|k| ao.get(*k) != bo.get(*k)).count()
}

fn dispatch_composite_many(
    descriptor: &ElementDescriptor,
    entity: &str,
    path: &ElementPath,
    old_val: Option<&Value>,
    new_val: Option<&Value>,
    contained_ids: &HashSet<String>,
    ctx: &mut TransactionContext,
    out: &mut Vec<Mutation>,
) -> Result<()> {
    let old_items: Vec<Value> = old_val.and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let new_items: Vec<Value> = new_val.and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let mut unmatched_old: Vec<usize> = (0..old_items.len()).filter(|i| !new_items.contains(&old_items[*i])).collect();
    let mut unmatched_new: Vec<usize> = (0..new_items.len()).filter(|i| !old_items.contains(&new_items[*i])).collect();

    let mut candidates: Vec<(usize, usize, usize)> = Vec::new();
    for &oi in &unmatched_old {
        for &ni in &unmatched_new {
            candidates.push((shallow_cost(&old_items[oi], &new_items[ni]), oi, ni));
        }
    }
    candidates.sort_by_key(|c| c.0);

    let mut paired_old = std::collections::HashSet::new();
    let mut paired_new = std::collections::HashSet::new();
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for (_, oi, ni) in candidates {
        if paired_old.contains(&oi) || paired_new.contains(&ni) {
            continue;
        }
        paired_old.insert(oi);
        paired_new.insert(ni);
        pairs.push((oi, ni));
    }

    for (oi, ni) in &pairs {
        let item_path = path.clone().index(*oi);
        if descriptor.codeable {
            intern_coding(&new_items[*ni], ctx, out);
        }
        walk_elements(&descriptor.children, entity, &item_path, Some(&old_items[*oi]), &new_items[*ni], contained_ids, ctx, out)?;
    }

    unmatched_old.retain(|i| !paired_old.contains(i));
    unmatched_new.retain(|i| !paired_new.contains(i));

    for oi in unmatched_old {
        out.push(Mutation::RemoveFromSet { entity: entity.to_string(), path: path.clone(), value: old_items[oi].clone() });
    }
    for ni in unmatched_new {
        if descriptor.codeable {
            intern_coding(&new_items[ni], ctx, out);
        }
        out.push(Mutation::AddToSet { entity: entity.to_string(), path: path.clone(), value: new_items[ni].clone() });
    }
    Ok(())
}

fn dispatch_contained(
    entity: &str,
    path: &ElementPath,
    old_val: Option<&Value>,
    new_val: Option<&Value>,
    contained_ids: &HashSet<String>,
    ctx: &mut TransactionContext,
    out: &mut Vec<Mutation>,
) -> Result<()> {
    let old_items: Vec<Value> = old_val.and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let new_items: Vec<Value> = new_val.and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let local_id = |v: &Value| v.get("id").and_then(|i| i.as_str()).map(str::to_string);
    let resource_type = |v: &Value| v.get("resourceType").and_then(|t| t.as_str()).map(str::to_string);

    let mut paired_old = std::collections::HashSet::new();
    let mut paired_new = std::collections::HashSet::new();

    for (oi, old_item) in old_items.iter().enumerate() {
        let Some(oid) = local_id(old_item) else { continue };
        if let Some((ni, new_item)) = new_items.iter().enumerate().find(|(ni, n)| {
            !paired_new.contains(ni) && local_id(n).as_deref() == Some(oid.as_str()) && resource_type(n) == resource_type(old_item)
        }) {
            paired_old.insert(oi);
            paired_new.insert(ni);
            let item_path = path.clone().index(oi);
            upsert_contained_pair(entity, &item_path, old_item, new_item, contained_ids, ctx, out)?;
        }
    }
    for (oi, old_item) in old_items.iter().enumerate() {
        if !paired_old.contains(&oi) {
            out.push(Mutation::RemoveFromSet { entity: entity.to_string(), path: path.clone(), value: old_item.clone() });
        }
    }
    for (ni, new_item) in new_items.iter().enumerate() {
        if !paired_new.contains(&ni) {
            out.push(Mutation::AddToSet { entity: entity.to_string(), path: path.clone(), value: new_item.clone() });
        }
    }
    Ok(())
}

fn upsert_contained_pair(
    entity: &str,
    item_path: &ElementPath,
    old_item: &Value,
    new_item: &Value,
    contained_ids: &HashSet<String>,
    ctx: &mut TransactionContext,
    out: &mut Vec<Mutation>,
) -> Result<()> {
    let resource_type = new_item.get("resourceType").and_then(|t| t.as_str()).unwrap_or("");
    let schema = SchemaTable::resolve(resource_type, new_item);
    walk_elements(&schema.elements, entity, item_path, Some(old_item), new_item, contained_ids, ctx, out)
}

fn dispatch_reference(
    entity: &str,
    path: &ElementPath,
    old_val: Option<&Value>,
    new_val: Option<&Value>,
    contained_ids: &HashSet<String>,
    ctx: &mut TransactionContext,
    out: &mut Vec<Mutation>,
) -> Result<()> {
    let Some(new) = new_val else {
        if old_val.is_some() {
            out.push(Mutation::UnsetScalar { entity: entity.to_string(), path: path.clone() });
        }
        return Ok(());
    };

    let expression = format!("{}.reference", path_to_expression(entity, path));

    if let Some(reference) = new.get("reference").and_then(|r| r.as_str()) {
        if let Some(local_id) = reference.strip_prefix('#') {
            if !contained_ids.contains(local_id) {
                return Err(Error::incorrect_at(
                    format!("Contained reference \"#{local_id}\" does not match any entry in Resource.contained."),
                    expression,
                ));
            }
        } else {
            let (target_type, target_id) = parse_literal_reference(reference)
                .ok_or_else(|| Error::incorrect_at(format!("Malformed reference \"{reference}\"."), expression.clone()))?;
            if !ctx.target_known(&(target_type.clone(), target_id.clone())) {
                return Err(Error::referential_integrity(format!(
                    "Referential integrity violated. Resource \"{target_type}/{target_id}\" doesn't exist."
                )));
            }
        }
    } else if new.get("identifier").is_some() {
        warn!(%expression, "logical reference (Reference.identifier without Reference.reference) is not resolved; skipping");
        return Ok(());
    } else {
        return Err(Error::incorrect_at("Reference must have a reference or identifier.", expression));
    }

    if old_val != Some(new) {
        out.push(Mutation::SetScalar { entity: entity.to_string(), path: path.clone(), value: new.clone() });
    }
    Ok(())
}

fn parse_literal_reference(reference: &str) -> Option<(String, String)> {
    let mut parts = reference.splitn(4, '/');
    let resource_type = parts.next()?.to_string();
    let id = parts.next()?.to_string();
    if resource_type.is_empty() || id.is_empty() {
        return None;
    }
    Some((resource_type, id))
}

fn path_to_expression(entity: &str, path: &ElementPath) -> String {
    let mut expr = entity.replace('/', ".");
    for segment in &path.0 {
        match segment {
            cairn_store::Segment::Field(f) => {
                expr.push('.');
                expr.push_str(f);
            }
            cairn_store::Segment::Index(i) => {
                expr.push_str(&format!("[{i}]"));
            }
        }
    }
    expr
}

fn intern_coding(coding_or_concept: &Value, ctx: &mut TransactionContext, out: &mut Vec<Mutation>) {
    let codings: Vec<&Value> = if let Some(arr) = coding_or_concept.get("coding").and_then(|c| c.as_array()) {
        arr.iter().collect()
    } else if coding_or_concept.get("code").is_some() {
        vec![coding_or_concept]
    } else {
        Vec::new()
    };

    for coding in codings {
        let (Some(system), Some(code)) = (
            coding.get("system").and_then(|s| s.as_str()),
            coding.get("code").and_then(|c| c.as_str()),
        ) else {
            continue;
        };
        let version = coding.get("version").and_then(|v| v.as_str()).map(str::to_string);
        let key = CodeKey::new(system, version, code);
        let interned = ctx.interner.intern(key.clone());
        if interned.newly_created {
            out.push(Mutation::SetScalar {
                entity: interned.entity_id,
                path: ElementPath::new(),
                value: serde_json::json!({
                    "system": key.system,
                    "version": key.version,
                    "code": key.code,
                }),
            });
        }
    }
}

#[allow(dead_code)]
pub fn referenced_schema(resource_type: &str, value: &Value) -> ResourceSchema {
    SchemaTable::resolve(resource_type, value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with_known(targets: &[(&str, &str)]) -> TransactionContext {
        let mut ctx = TransactionContext::new();
        for (t, id) in targets {
            ctx.register_existing((t.to_string(), id.to_string()));
        }
        ctx
    }

    #[test]
    fn create_emits_set_scalar_for_every_present_primitive() {
        let mut ctx = TransactionContext::new();
        let new = json!({"resourceType": "Patient", "gender": "female", "birthDate": "1990-01-01"});
        let outcome = upsert("Patient/0", "Patient", None, &new, None, -3, &mut ctx).unwrap();
        assert!(outcome.mutations.iter().any(|m| matches!(m, Mutation::SetScalar { path, .. } if path == &ElementPath::new().field("gender"))));
    }

    #[test]
    fn update_emits_empty_mutation_set_for_byte_identical_resource() {
        let mut ctx = TransactionContext::new();
        let resource = json!({"resourceType": "Patient", "id": "0", "gender": "female"});
        let outcome = upsert("Patient/0", "Patient", Some(&resource), &resource, Some(-3), -7, &mut ctx).unwrap();
        assert!(outcome.mutations.is_empty());
    }

    #[test]
    fn update_only_emits_mutation_for_the_changed_field() {
        let mut ctx = TransactionContext::new();
        let old = json!({"resourceType": "Patient", "id": "0", "gender": "female", "birthDate": "1990-01-01"});
        let new = json!({"resourceType": "Patient", "id": "0", "gender": "male", "birthDate": "1990-01-01"});
        let outcome = upsert("Patient/0", "Patient", Some(&old), &new, Some(-3), -7, &mut ctx).unwrap();
        assert_eq!(outcome.mutations.len(), 1);
    }

    #[test]
    fn unchanged_identifier_is_left_untouched_and_only_the_differing_one_mutates() {
        // Old and new each have two identifiers; one is byte-identical across
        // both, the other differs. The unchanged one must not appear in any
        // mutation; the changed one is reused in place (recursive upsert)
        // rather than torn down and rebuilt, per stable-identity matching.
        let mut ctx = TransactionContext::new();
        let old = json!({"resourceType": "Patient", "identifier": [{"system": "a", "value": "1"}, {"system": "b", "value": "2"}]});
        let new = json!({"resourceType": "Patient", "identifier": [{"system": "a", "value": "1"}, {"system": "c", "value": "3"}]});
        let outcome = upsert("Patient/0", "Patient", Some(&old), &new, Some(-3), -7, &mut ctx).unwrap();
        assert!(outcome.mutations.iter().all(|m| !matches!(m, Mutation::RemoveFromSet { value, .. } | Mutation::AddToSet { value, .. } if value["system"] == "a")));
        assert!(!outcome.mutations.is_empty());
    }

    #[test]
    fn fully_disjoint_repeatable_composites_retract_and_add_wholesale() {
        let mut ctx = TransactionContext::new();
        let old = json!({"resourceType": "Patient", "identifier": [{"system": "a", "value": "1"}]});
        let new = json!({"resourceType": "Patient", "identifier": []});
        let outcome = upsert("Patient/0", "Patient", Some(&old), &new, Some(-3), -7, &mut ctx).unwrap();
        assert!(outcome.mutations.iter().any(|m| matches!(m, Mutation::RemoveFromSet { .. })));
    }

    #[test]
    fn literal_reference_to_known_target_resolves() {
        let mut ctx = ctx_with_known(&[("Patient", "0")]);
        let new = json!({"resourceType": "Observation", "status": "final", "subject": {"reference": "Patient/0"}});
        let outcome = upsert("Observation/1", "Observation", None, &new, None, -3, &mut ctx).unwrap();
        assert!(outcome.mutations.iter().any(|m| matches!(m, Mutation::SetScalar { path, .. } if path == &ElementPath::new().field("subject"))));
    }

    #[test]
    fn literal_reference_to_unknown_target_is_referential_integrity_conflict() {
        let mut ctx = TransactionContext::new();
        let new = json!({"resourceType": "Observation", "subject": {"reference": "Patient/0"}});
        let err = upsert("Observation/1", "Observation", None, &new, None, -3, &mut ctx).unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn logical_only_reference_is_skipped_without_error() {
        let mut ctx = TransactionContext::new();
        let new = json!({"resourceType": "Observation", "subject": {"identifier": {"system": "mrn", "value": "1"}}});
        let outcome = upsert("Observation/1", "Observation", None, &new, None, -3, &mut ctx).unwrap();
        assert!(!outcome.mutations.iter().any(|m| matches!(m, Mutation::SetScalar { path, .. } if path == &ElementPath::new().field("subject"))));
    }

    #[test]
    fn contained_reference_to_a_declared_local_id_resolves() {
        let mut ctx = TransactionContext::new();
        let new = json!({
            "resourceType": "Observation",
            "contained": [{"resourceType": "Patient", "id": "p1"}],
            "subject": {"reference": "#p1"}
        });
        let outcome = upsert("Observation/1", "Observation", None, &new, None, -3, &mut ctx).unwrap();
        assert!(outcome.mutations.iter().any(|m| matches!(m, Mutation::SetScalar { path, .. } if path == &ElementPath::new().field("subject"))));
    }

    #[test]
    fn contained_reference_to_an_undeclared_local_id_is_incorrect() {
        let mut ctx = TransactionContext::new();
        let new = json!({
            "resourceType": "Observation",
            "subject": {"reference": "#missing"}
        });
        let err = upsert("Observation/1", "Observation", None, &new, None, -3, &mut ctx).unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert!(err.to_string().contains("#missing"));
    }

    #[test]
    fn coding_inside_code_is_interned_once() {
        let mut ctx = TransactionContext::new();
        let new = json!({
            "resourceType": "Observation",
            "code": {"coding": [{"system": "http://loinc.org", "code": "29463-7"}]}
        });
        let outcome = upsert("Observation/1", "Observation", None, &new, None, -3, &mut ctx).unwrap();
        let code_mutations = outcome.mutations.iter().filter(|m| m.entity().contains("loinc.org")).count();
        assert_eq!(code_mutations, 1);
    }

    #[test]
    fn value_choice_switching_variant_unsets_the_old_field() {
        let mut ctx = TransactionContext::new();
        let old = json!({"resourceType": "Observation", "valueString": "n/a"});
        let new = json!({"resourceType": "Observation", "valueBoolean": true});
        let outcome = upsert("Observation/1", "Observation", Some(&old), &new, Some(-3), -7, &mut ctx).unwrap();
        assert!(outcome.mutations.iter().any(|m| matches!(m, Mutation::UnsetScalar { path, .. } if path == &ElementPath::new().field("valueString"))));
        assert!(outcome.mutations.iter().any(|m| matches!(m, Mutation::SetScalar { path, .. } if path == &ElementPath::new().field("valueBoolean"))));
    }

    #[test]
    fn contained_resource_matched_by_local_id_recurses_instead_of_replacing() {
        let mut ctx = TransactionContext::new();
        let old = json!({
            "resourceType": "Patient",
            "contained": [{"resourceType": "Organization", "id": "org1", "active": true}]
        });
        let new = json!({
            "resourceType": "Patient",
            "contained": [{"resourceType": "Organization", "id": "org1", "active": false}]
        });
        let outcome = upsert("Patient/0", "Patient", Some(&old), &new, Some(-3), -7, &mut ctx).unwrap();
        assert!(!outcome.mutations.iter().any(|m| matches!(m, Mutation::RemoveFromSet { .. } | Mutation::AddToSet { .. })));
        assert!(outcome.mutations.iter().any(|m| matches!(m, Mutation::SetScalar { path, .. } if path == &ElementPath::new().field("contained").index(0).field("active"))));
    }
}
