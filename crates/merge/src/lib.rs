//! Keel merge: strategic merge of configuration documents plus small diff helpers.
//!
//! Documents are plain `serde_json::Value` trees. Maps merge key by key, lists whose
//! elements carry a declared merge key merge element-wise, everything else is replaced
//! by the higher-precedence side. Structural type disagreements are reported instead
//! of being coerced.

#![forbid(unsafe_code)]

use keel_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use smallvec::SmallVec;
use tracing::debug;

/// Field names that identify list elements, tried in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    pub merge_keys: SmallVec<[String; 2]>,
}

impl Default for MergeOptions {
    fn default() -> Self { Self { merge_keys: smallvec::smallvec!["name".to_string()] } }
}

impl MergeOptions {
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { merge_keys: keys.into_iter().map(Into::into).collect() }
    }
}

fn max_doc_bytes() -> usize {
    std::env::var("KEEL_MAX_DOC_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_doc_nodes() -> usize {
    std::env::var("KEEL_MAX_DOC_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn node_count_exceeds(v: &Json, max: usize) -> bool {
    let mut stack = vec![v];
    let mut seen = 0usize;
    while let Some(n) = stack.pop() {
        seen += 1;
        if seen > max { return true; }
        match n {
            Json::Object(m) => stack.extend(m.values()),
            Json::Array(a) => stack.extend(a.iter()),
            _ => {}
        }
    }
    false
}

/// Parse a YAML (or JSON) payload into a document, enforcing size and node budgets.
/// An empty payload yields `Null`.
pub fn parse_document(bytes: &[u8]) -> Result<Json> {
    if bytes.len() > max_doc_bytes() {
        return Err(Error::configuration("document", format!("payload too large (>{} bytes)", max_doc_bytes())));
    }
    let yaml: serde_yaml::Value = serde_yaml::from_slice(bytes)
        .map_err(|e| Error::configuration("document", format!("parsing YAML: {}", e)))?;
    let json = serde_json::to_value(yaml)
        .map_err(|e| Error::configuration("document", format!("converting YAML to JSON: {}", e)))?;
    if node_count_exceeds(&json, max_doc_nodes()) {
        return Err(Error::configuration("document", format!("document too complex (>{} nodes)", max_doc_nodes())));
    }
    Ok(json)
}

/// Structural category of a node, as named in conflict errors.
pub fn kind_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Object(_) => "map",
        Json::Array(_) => "list",
        Json::Bool(_) | Json::Number(_) | Json::String(_) => "scalar",
    }
}

fn is_scalar(v: &Json) -> bool { matches!(v, Json::Bool(_) | Json::Number(_) | Json::String(_)) }

fn display_path(path: &str) -> String {
    if path.is_empty() { "<root>".to_string() } else { path.to_string() }
}

/// Merge key shared by every overlay element, provided all base elements are maps too.
fn merge_key_for<'o>(base: &[Json], overlay: &[Json], opts: &'o MergeOptions) -> Option<&'o str> {
    if overlay.is_empty() || !base.iter().all(Json::is_object) { return None; }
    opts.merge_keys
        .iter()
        .map(String::as_str)
        .find(|key| overlay.iter().all(|el| el.get(*key).map(|k| !k.is_null()).unwrap_or(false)))
}

fn merge_into(base: &mut Json, overlay: &Json, path: &mut String, opts: &MergeOptions) -> Result<()> {
    match (base, overlay) {
        (_, Json::Null) => Ok(()),
        (b @ Json::Null, o) => { *b = o.clone(); Ok(()) }
        (Json::Object(bm), Json::Object(om)) => {
            for (k, ov) in om {
                if ov.is_null() {
                    bm.remove(k);
                    continue;
                }
                match bm.get_mut(k) {
                    Some(bv) => {
                        let mark = path.len();
                        path.push('.');
                        path.push_str(k);
                        merge_into(bv, ov, path, opts)?;
                        path.truncate(mark);
                    }
                    None => { bm.insert(k.clone(), ov.clone()); }
                }
            }
            Ok(())
        }
        (Json::Array(bl), Json::Array(ol)) => {
            let Some(key) = merge_key_for(bl, ol, opts) else {
                debug!(path = %display_path(path), "list replaced wholesale (no merge key)");
                *bl = ol.clone();
                return Ok(());
            };
            for el in ol {
                let id = &el[key];
                match bl.iter_mut().find(|b| b.get(key) == Some(id)) {
                    Some(existing) => {
                        let mark = path.len();
                        path.push_str(&format!("[{}={}]", key, id));
                        merge_into(existing, el, path, opts)?;
                        path.truncate(mark);
                    }
                    None => bl.push(el.clone()),
                }
            }
            Ok(())
        }
        (b, o) if is_scalar(&*b) && is_scalar(o) => { *b = o.clone(); Ok(()) }
        (b, o) => Err(Error::MergeConflict { path: display_path(path), base: kind_name(&*b), overlay: kind_name(o) }),
    }
}

/// Merge `overlay` on top of `base`, returning a new document. Inputs are untouched.
///
/// A `null` value in a map deletes that key from the result.
pub fn strategic_merge(base: &Json, overlay: &Json, opts: &MergeOptions) -> Result<Json> {
    let mut out = base.clone();
    merge_into(&mut out, overlay, &mut String::new(), opts)?;
    Ok(out)
}

/// Fold documents low-to-high precedence.
pub fn merge_all<'a, I>(docs: I, opts: &MergeOptions) -> Result<Json>
where
    I: IntoIterator<Item = &'a Json>,
{
    let mut out = Json::Null;
    for d in docs {
        merge_into(&mut out, d, &mut String::new(), opts)?;
    }
    Ok(out)
}

/// Compute the authoritative settings for a component:
/// baseline < live configuration < overrides (in list order, later wins).
pub fn merge_overrides(baseline: &Json, live: Option<&Json>, overrides: &[Json], opts: &MergeOptions) -> Result<Json> {
    let mut out = baseline.clone();
    let mut path = String::new();
    if let Some(live) = live {
        merge_into(&mut out, live, &mut path, opts)?;
    }
    for o in overrides {
        merge_into(&mut out, o, &mut path, opts)?;
    }
    Ok(out)
}

/// Drop the server/engine owned `status` sub-tree.
pub fn strip_status(mut v: Json) -> Json {
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// Count leaf-level differences going from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn count(t: &Json, b: &Json, out: &mut DiffSummary) {
        if t == b { return; }
        match (t, b) {
            (Json::Object(tm), Json::Object(bm)) => {
                for (k, tv) in tm {
                    match bm.get(k) {
                        Some(bv) => count(tv, bv, out),
                        None => out.adds += 1,
                    }
                }
                out.removes += bm.keys().filter(|k| !tm.contains_key(*k)).count();
            }
            (Json::Array(ta), Json::Array(ba)) => {
                out.updates += ta.iter().zip(ba.iter()).filter(|(x, y)| x != y).count();
                out.adds += ta.len().saturating_sub(ba.len());
                out.removes += ba.len().saturating_sub(ta.len());
            }
            _ => out.updates += 1,
        }
    }
    let mut out = DiffSummary::default();
    count(target, base, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn precedence_each_layer_overrides_only_its_keys() {
        let merged = merge_overrides(
            &json!({"a": 1, "b": 1}),
            Some(&json!({"b": 2, "c": 1})),
            &[json!({"c": 2})],
            &MergeOptions::default(),
        )
        .unwrap();
        assert_eq!(merged, json!({"a": 1, "b": 2, "c": 2}));
    }

    #[test]
    fn keyed_lists_merge_element_wise() {
        let base = json!({"pools": [{"name": "x", "v": 1}, {"name": "y", "v": 1}]});
        let over = json!({"pools": [{"name": "x", "v": 2}]});
        let merged = strategic_merge(&base, &over, &MergeOptions::default()).unwrap();
        assert_eq!(merged, json!({"pools": [{"name": "x", "v": 2}, {"name": "y", "v": 1}]}));
    }

    #[test]
    fn keyed_list_appends_unknown_elements() {
        let base = json!([{"name": "x", "v": 1}]);
        let over = json!([{"name": "z", "v": 3}]);
        let merged = strategic_merge(&base, &over, &MergeOptions::default()).unwrap();
        assert_eq!(merged, json!([{"name": "x", "v": 1}, {"name": "z", "v": 3}]));
    }

    #[test]
    fn element_without_key_replaces_list() {
        let base = json!({"args": [{"name": "x", "v": 1}]});
        let over = json!({"args": [{"v": 9}]});
        let merged = strategic_merge(&base, &over, &MergeOptions::default()).unwrap();
        assert_eq!(merged, json!({"args": [{"v": 9}]}));

        let scalars = strategic_merge(&json!([1, 2, 3]), &json!([4]), &MergeOptions::default()).unwrap();
        assert_eq!(scalars, json!([4]));
    }

    #[test]
    fn alternate_merge_key() {
        let opts = MergeOptions::with_keys(["id", "name"]);
        let merged = strategic_merge(&json!([{"id": 1, "v": "a"}]), &json!([{"id": 1, "v": "b"}]), &opts).unwrap();
        assert_eq!(merged, json!([{"id": 1, "v": "b"}]));
    }

    #[test]
    fn type_conflict_is_reported_with_path() {
        let err = strategic_merge(
            &json!({"spec": {"nodes": [{"name": "a"}]}}),
            &json!({"spec": {"nodes": "three"}}),
            &MergeOptions::default(),
        )
        .unwrap_err();
        match err {
            Error::MergeConflict { path, base, overlay } => {
                assert_eq!(path, ".spec.nodes");
                assert_eq!(base, "list");
                assert_eq!(overlay, "scalar");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn conflict_inside_keyed_element_names_the_element() {
        let err = strategic_merge(
            &json!({"pools": [{"name": "x", "cfg": {"a": 1}}]}),
            &json!({"pools": [{"name": "x", "cfg": [1]}]}),
            &MergeOptions::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains(".pools[name=\"x\"].cfg"), "{err}");
    }

    #[test]
    fn null_deletes_key_and_null_document_is_noop() {
        let merged = strategic_merge(&json!({"a": 1, "b": 2}), &json!({"b": null}), &MergeOptions::default()).unwrap();
        assert_eq!(merged, json!({"a": 1}));
        let same = strategic_merge(&json!({"a": 1}), &Json::Null, &MergeOptions::default()).unwrap();
        assert_eq!(same, json!({"a": 1}));
    }

    #[test]
    fn merge_does_not_mutate_inputs() {
        let base = json!({"a": {"b": 1}});
        let over = json!({"a": {"c": 2}});
        let _ = strategic_merge(&base, &over, &MergeOptions::default()).unwrap();
        assert_eq!(base, json!({"a": {"b": 1}}));
    }

    #[test]
    fn parse_document_accepts_yaml_and_empty() {
        assert_eq!(parse_document(b"a: 1\nb: [x]\n").unwrap(), json!({"a": 1, "b": ["x"]}));
        assert_eq!(parse_document(b"").unwrap(), Json::Null);
        assert!(matches!(parse_document(b"a: [").unwrap_err(), Error::Configuration { .. }));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert!(diff_summary(&base, &base).is_empty());
    }

    #[test]
    fn strip_status_removes_only_status() {
        let v = strip_status(json!({"spec": {"a": 1}, "status": {"version": "1.0.0"}}));
        assert_eq!(v, json!({"spec": {"a": 1}}));
    }
}
