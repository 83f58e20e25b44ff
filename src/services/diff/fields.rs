use serde_json::{Map, Value};

const CONTAINERS: &str = "/spec/template/spec/containers";
const POD_ANNOTATIONS: &str = "/spec/template/metadata/annotations";

/// Pod template fields only ever produced by the composer.
const OWNED_POD_FIELDS: &[&str] = &["/spec/template/spec/volumes", "/spec/template/spec/imagePullSecrets"];

/// Server managed or immutable workload fields never compared.
pub const WORKLOAD_IGNORED_FIELDS: &[&str] = &[
    "/status",
    "/metadata/uid",
    "/metadata/resourceVersion",
    "/metadata/generation",
    "/metadata/creationTimestamp",
    "/metadata/managedFields",
    "/metadata/selfLink",
    "/metadata/annotations",
    "/spec/selector",
    "/spec/serviceName",
    "/spec/podManagementPolicy",
    "/spec/revisionHistoryLimit",
    "/spec/persistentVolumeClaimRetentionPolicy",
    "/spec/template/metadata/creationTimestamp",
    "/spec/template/metadata/annotations/gateway.operator.io~1restartedAt",
    "/spec/template/metadata/annotations/kubectl.kubernetes.io~1restartedAt",
];

pub const SERVICE_IGNORED_FIELDS: &[&str] = &[
    "/status",
    "/metadata/uid",
    "/metadata/resourceVersion",
    "/metadata/generation",
    "/metadata/creationTimestamp",
    "/metadata/managedFields",
    "/metadata/selfLink",
    "/metadata/annotations",
    "/spec/clusterIP",
    "/spec/clusterIPs",
    "/spec/ipFamilies",
    "/spec/ipFamilyPolicy",
    "/spec/sessionAffinity",
    "/spec/internalTrafficPolicy",
];

/// Copies every ignored field present in `observed` into `desired`.
///
/// A field absent from `desired` is only inserted when its parent exists there.
pub fn forward_ignored_fields(desired: &mut Value, observed: &Value, fields: &[&str]) {
    for pointer in fields {
        let Some(observed_value) = observed.pointer(pointer) else {
            continue;
        };
        if let Some(desired_value) = desired.pointer_mut(pointer) {
            desired_value.clone_from(observed_value);
            continue;
        }
        insert_at(desired, pointer, observed_value.clone());
    }
}

fn insert_at(object: &mut Value, pointer: &str, value: Value) {
    let Some((parent, token)) = split_pointer(pointer) else {
        return;
    };
    let parent_value = if parent.is_empty() { Some(object) } else { object.pointer_mut(parent) };
    if let Some(Value::Object(map)) = parent_value {
        map.insert(token, value);
    }
}

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn observed_container<'a>(observed: &'a Value, name: Option<&Value>) -> Option<&'a Value> {
    observed.pointer(CONTAINERS)?.as_array()?.iter().find(|c| c.get("name") == name)
}

/// Marks with `null` what the composer produced earlier and no longer produces.
///
/// Covers the owned pod fields, container volume mounts and every pod annotation
/// not listed in `ignored`.
pub fn clear_owned_fields(desired: &mut Value, observed: &Value, ignored: &[&str]) {
    for pointer in OWNED_POD_FIELDS {
        if observed.pointer(pointer).is_some_and(|v| !v.is_null()) && desired.pointer(pointer).is_none() {
            insert_at(desired, pointer, Value::Null);
        }
    }

    if let Some(Value::Object(observed_annotations)) = observed.pointer(POD_ANNOTATIONS) {
        let stale: Vec<String> = observed_annotations
            .keys()
            .filter(|key| !ignored.contains(&format!("{POD_ANNOTATIONS}/{}", escape_token(key)).as_str()))
            .filter(|key| desired.pointer(POD_ANNOTATIONS).and_then(|a| a.get(key.as_str())).is_none())
            .cloned()
            .collect();
        if !stale.is_empty() {
            if let Some(Value::Object(metadata)) = desired.pointer_mut("/spec/template/metadata") {
                if let Value::Object(annotations) = metadata.entry("annotations").or_insert_with(|| Value::Object(Map::new())) {
                    annotations.extend(stale.into_iter().map(|key| (key, Value::Null)));
                }
            }
        }
    }

    if let Some(Value::Array(containers)) = desired.pointer_mut(CONTAINERS) {
        for container in containers.iter_mut().filter_map(Value::as_object_mut) {
            let mounted = observed_container(observed, container.get("name")).and_then(|c| c.get("volumeMounts")).is_some_and(|m| !m.is_null());
            if mounted && !container.contains_key("volumeMounts") {
                container.insert("volumeMounts".to_owned(), Value::Null);
            }
        }
    }
}

/// Exact value of a resource quantity as `mantissa * 10^exponent` with trailing zeros folded
/// into the exponent, so `1000m`, `1` and `1e0` parse to the same pair.
fn parse_quantity(quantity: &str) -> Option<(i128, i32)> {
    let quantity = quantity.trim();
    let split = quantity.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-')).unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let (mut exponent, binary_power): (i32, u32) = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 1),
        "Mi" => (0, 2),
        "Gi" => (0, 3),
        "Ti" => (0, 4),
        "Pi" => (0, 5),
        "Ei" => (0, 6),
        s if s.starts_with(['e', 'E']) => (s[1..].parse().ok()?, 0),
        _ => return None,
    };

    let (negative, number) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    let digits = format!("{whole}{fraction}");
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut mantissa = digits.parse::<i128>().ok()?.checked_mul(1024_i128.checked_pow(binary_power)?)?;
    exponent -= i32::try_from(fraction.len()).ok()?;
    if mantissa == 0 {
        return Some((0, 0));
    }
    while mantissa % 10 == 0 {
        mantissa /= 10;
        exponent += 1;
    }
    Some((if negative { -mantissa } else { mantissa }, exponent))
}

/// Replaces desired resource quantities by the observed spelling when both denote the same amount.
///
/// The control plane stores quantities in canonical form, `1000m` comes back as `1`.
pub fn forward_equivalent_quantities(desired: &mut Value, observed: &Value) {
    let Some(Value::Array(containers)) = desired.pointer_mut(CONTAINERS) else {
        return;
    };
    for container in containers.iter_mut() {
        let Some(observed_resources) = observed_container(observed, container.get("name")).and_then(|c| c.get("resources")) else {
            continue;
        };
        for section in ["requests", "limits"] {
            let Some(Value::Object(quantities)) = container.get_mut("resources").and_then(|r| r.get_mut(section)) else {
                continue;
            };
            for (resource, quantity) in quantities.iter_mut() {
                let Some(Value::String(observed_quantity)) = observed_resources.get(section).and_then(|s| s.get(resource)) else {
                    continue;
                };
                let equivalent = quantity.as_str().is_some_and(|q| q != observed_quantity.as_str() && parse_quantity(q).is_some_and(|v| parse_quantity(observed_quantity) == Some(v)));
                if equivalent {
                    *quantity = Value::String(observed_quantity.clone());
                }
            }
        }
    }
}

fn split_pointer(pointer: &str) -> Option<(&str, String)> {
    let index = pointer.rfind('/')?;
    let token = pointer[index + 1..].replace("~1", "/").replace("~0", "~");
    Some((&pointer[..index], token))
}

/// Sorts every container env list by name.
pub fn normalize_env(object: &mut Value) {
    for containers in [CONTAINERS, "/spec/template/spec/initContainers"] {
        let Some(Value::Array(containers)) = object.pointer_mut(containers) else {
            continue;
        };
        for container in containers {
            if let Some(Value::Array(env)) = container.get_mut("env") {
                env.sort_by(|a, b| env_name(a).cmp(env_name(b)));
            }
        }
    }
}

fn env_name(value: &Value) -> &str {
    value.get("name").and_then(Value::as_str).unwrap_or_default()
}

/// Volume claim templates are immutable after creation, the observed ones always win.
pub fn forward_volume_claim_templates(desired: &mut Value, observed: &Value) {
    let observed_templates = observed.pointer("/spec/volumeClaimTemplates").cloned();
    if let Some(Value::Object(spec)) = desired.pointer_mut("/spec") {
        match observed_templates {
            Some(templates) => {
                spec.insert("volumeClaimTemplates".to_owned(), templates);
            },
            None => {
                spec.remove("volumeClaimTemplates");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_forward_overwrites_and_inserts() {
        let mut desired = json!({"metadata": {"name": "gw", "resourceVersion": "1"}, "spec": {"clusterIP": "None"}});
        let observed = json!({
            "metadata": {"name": "gw", "resourceVersion": "42", "uid": "abc"},
            "spec": {"clusterIP": "10.0.0.1"},
            "status": {"loadBalancer": {}}
        });
        forward_ignored_fields(&mut desired, &observed, SERVICE_IGNORED_FIELDS);
        assert_eq!(desired.pointer("/metadata/resourceVersion"), Some(&json!("42")));
        assert_eq!(desired.pointer("/metadata/uid"), Some(&json!("abc")));
        assert_eq!(desired.pointer("/spec/clusterIP"), Some(&json!("10.0.0.1")));
        assert_eq!(desired.pointer("/status"), Some(&json!({"loadBalancer": {}})));
    }

    #[test]
    fn test_forward_needs_parent() {
        let mut desired = json!({"spec": {"template": {"metadata": {}}}});
        let observed = json!({"spec": {"template": {"metadata": {"annotations": {"gateway.operator.io/restartedAt": "2024-01-01T00:00:00Z"}}}}});
        forward_ignored_fields(&mut desired, &observed, WORKLOAD_IGNORED_FIELDS);
        assert_eq!(desired, json!({"spec": {"template": {"metadata": {}}}}));
    }

    #[test]
    fn test_forward_escaped_token() {
        let mut desired = json!({"spec": {"template": {"metadata": {"annotations": {"a": "b"}}}}});
        let observed = json!({"spec": {"template": {"metadata": {"annotations": {"gateway.operator.io/restartedAt": "t"}}}}});
        forward_ignored_fields(&mut desired, &observed, WORKLOAD_IGNORED_FIELDS);
        assert_eq!(desired.pointer("/spec/template/metadata/annotations/gateway.operator.io~1restartedAt"), Some(&json!("t")));
    }

    #[test]
    fn test_quantities() {
        assert_eq!(parse_quantity("1000m"), parse_quantity("1"));
        assert_eq!(parse_quantity("0.5"), parse_quantity("500m"));
        assert_eq!(parse_quantity("1Ki"), parse_quantity("1024"));
        assert_eq!(parse_quantity("1e3"), parse_quantity("1k"));
        assert_eq!(parse_quantity("1Gi"), Some((1_073_741_824, 0)));
        assert_ne!(parse_quantity("1G"), parse_quantity("1Gi"));
        assert_eq!(parse_quantity("lots"), None);
    }

    #[test]
    fn test_equivalent_quantities_take_observed_form() {
        let mut desired = json!({"spec": {"template": {"spec": {"containers": [
            {"name": "gateway", "resources": {"limits": {"cpu": "1000m", "memory": "1Gi"}, "requests": {"cpu": "250m"}}}
        ]}}}});
        let observed = json!({"spec": {"template": {"spec": {"containers": [
            {"name": "gateway", "resources": {"limits": {"cpu": "1", "memory": "1Gi"}, "requests": {"cpu": "500m"}}}
        ]}}}});
        forward_equivalent_quantities(&mut desired, &observed);
        assert_eq!(desired.pointer("/spec/template/spec/containers/0/resources/limits/cpu"), Some(&json!("1")));
        assert_eq!(desired.pointer("/spec/template/spec/containers/0/resources/requests/cpu"), Some(&json!("250m")));
    }

    #[test]
    fn test_clear_owned_fields() {
        let mut desired = json!({"spec": {"template": {
            "metadata": {"labels": {"app": "gw"}},
            "spec": {"containers": [{"name": "gateway"}]}
        }}});
        let observed = json!({"spec": {"template": {
            "metadata": {"labels": {"app": "gw"}, "annotations": {"vault.hashicorp.com/role": "gateway", "gateway.operator.io/restartedAt": "t"}},
            "spec": {
                "containers": [{"name": "gateway", "volumeMounts": [{"name": "tls-0", "mountPath": "/etc/gateway/tls/0"}]}],
                "volumes": [{"name": "tls-0", "secret": {"secretName": "cert"}}],
                "imagePullSecrets": [{"name": "registry"}]
            }
        }}});
        clear_owned_fields(&mut desired, &observed, WORKLOAD_IGNORED_FIELDS);
        assert_eq!(
            desired,
            json!({"spec": {"template": {
                "metadata": {"labels": {"app": "gw"}, "annotations": {"vault.hashicorp.com/role": null}},
                "spec": {"containers": [{"name": "gateway", "volumeMounts": null}], "volumes": null, "imagePullSecrets": null}
            }}})
        );
    }

    #[test]
    fn test_normalize_env() {
        let mut object = json!({"spec": {"template": {"spec": {"containers": [{"env": [{"name": "B"}, {"name": "A"}]}]}}}});
        normalize_env(&mut object);
        assert_eq!(object.pointer("/spec/template/spec/containers/0/env/0/name"), Some(&json!("A")));
    }
}
