//! A direct (non-SQL) interpreter for condition trees, used only by
//! [`super::InMemoryStore`] as a ground-truth oracle in place of an actual
//! store running the compiler's SQL fragment. Production stores execute
//! the compiled fragment; this module exists so the crate's own tests can
//! exercise the full pipeline without a live Postgres + PostGIS instance.

use crate::dsl::{Condition, Operator, Source, Value};
use crate::model::{AttributeMap, Resource};
use crate::resolve;
use geo::{Contains, EuclideanDistance, HaversineDistance, Intersects};
use geo_types::Geometry;
use serde_json::Value as JsonValue;
use std::str::FromStr;

pub fn evaluate(node: &Condition, resource: &Resource, bindings: &AttributeMap) -> bool {
    match node {
        Condition::And { conditions } => conditions.iter().all(|c| evaluate(c, resource, bindings)),
        Condition::Or { conditions } => conditions.iter().any(|c| evaluate(c, resource, bindings)),
        Condition::Not { conditions } => !evaluate(&conditions[0], resource, bindings),
        leaf_node => evaluate_leaf(leaf_node, resource, bindings),
    }
}

fn evaluate_leaf(node: &Condition, resource: &Resource, bindings: &AttributeMap) -> bool {
    let op = node.operator().expect("evaluate_leaf called on a non-leaf node");
    let leaf = node.leaf().expect("evaluate_leaf called on a non-leaf node");

    if op.is_spatial() {
        return evaluate_spatial(op, leaf, resource, bindings);
    }

    let actual = match leaf.source {
        // `resource.id` addresses the row's real primary key, mirroring
        // the compiler's special-cased `resource.id` column (see
        // `compiler::json_path`), not a JSONB attribute lookup.
        Source::Resource if leaf.attr == "id" => JsonValue::from(resource.id),
        Source::Resource => {
            let path: Vec<String> = leaf.attr.split('.').map(str::to_string).collect();
            match resolve::navigate(&resource.attributes, &path) {
                Some(v) => v.clone(),
                None => return false,
            }
        }
        Source::Principal | Source::Context => {
            let path: Vec<String> = leaf.attr.split('.').map(str::to_string).collect();
            match resolve::lookup(bindings, &leaf.source.to_string(), &path) {
                Some(v) => v.clone(),
                None => return false,
            }
        }
    };

    let expected: JsonValue = match leaf.val.as_reference() {
        Some(Ok(reference)) => {
            match resolve::lookup(bindings, &reference.source.to_string(), &reference.path) {
                Some(v) => v.clone(),
                None => return false,
            }
        }
        Some(Err(_)) => return false,
        None => leaf.val.to_json(),
    };

    resolve::compare_json(op, &actual, &expected)
}

fn evaluate_spatial(op: Operator, leaf: &crate::dsl::Leaf, resource: &Resource, bindings: &AttributeMap) -> bool {
    let resource_geom = match resource.geometry.as_ref().and_then(geometry_from_stored) {
        Some(g) => g,
        None => return false,
    };

    let other_geom = match leaf.val.as_reference() {
        Some(Ok(reference)) => {
            let raw = match resolve::lookup(bindings, &reference.source.to_string(), &reference.path) {
                Some(JsonValue::String(s)) => s.clone(),
                _ => return false,
            };
            match parse_wkt(&raw) {
                Some(g) => g,
                None => return false,
            }
        }
        Some(Err(_)) => return false,
        None => match geometry_from_value(&leaf.val) {
            Some(g) => g,
            None => return false,
        },
    };

    match op {
        Operator::StDwithin => {
            let distance = match leaf.args {
                Some(d) => d,
                None => return false,
            };
            geometry_distance(&resource_geom, &other_geom) <= distance
        }
        Operator::StContains => resource_geom.contains(&other_geom),
        Operator::StWithin => other_geom.contains(&resource_geom),
        Operator::StIntersects => resource_geom.intersects(&other_geom),
        // geo's `Contains` excludes boundary touches that PostGIS's
        // ST_Covers would accept; approximated here as plain containment.
        Operator::StCovers => resource_geom.contains(&other_geom) || resource_geom.intersects(&other_geom),
        _ => unreachable!("evaluate_spatial called with a non-spatial operator"),
    }
}

fn geometry_distance(a: &Geometry<f64>, b: &Geometry<f64>) -> f64 {
    if let (Geometry::Point(p1), Geometry::Point(p2)) = (a, b) {
        return p1.haversine_distance(p2);
    }
    a.euclidean_distance(b)
}

/// The in-memory store keeps resource geometry as UTF-8 WKT bytes rather
/// than real WKB — there's no live PostGIS here to produce WKB, and this
/// type exists purely so the crate's own tests can drive the pipeline
/// end-to-end.
fn geometry_from_stored(geom: &crate::model::Geometry) -> Option<Geometry<f64>> {
    let text = std::str::from_utf8(&geom.wkb).ok()?;
    parse_wkt(text)
}

fn parse_wkt(text: &str) -> Option<Geometry<f64>> {
    let stripped = text
        .strip_prefix("SRID=")
        .and_then(|rest| rest.split_once(';'))
        .map(|(_, wkt)| wkt)
        .unwrap_or(text);
    wkt::Wkt::from_str(stripped).ok().map(|w| w.item.into())
}

fn geometry_from_value(val: &Value) -> Option<Geometry<f64>> {
    match val {
        Value::Text(s) => parse_wkt(s),
        Value::Object(map) => {
            let json = JsonValue::Object(map.clone());
            let geo_json: geojson::GeoJson = json.try_into().ok()?;
            match geo_json {
                geojson::GeoJson::Geometry(g) => geo_types::Geometry::try_from(g).ok(),
                _ => None,
            }
        }
        _ => None,
    }
}
