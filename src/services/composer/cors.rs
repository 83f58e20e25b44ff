use kube::ResourceExt;
use tracing::warn;

use super::{Contribution, FeatureWarning};
use crate::{
    common::EnvBucket,
    crds::{CorsPolicy, Gateway, GatewaySpec},
};

const GLOBAL_PATH: &str = "/**";

fn has_per_route(spec: &GatewaySpec) -> bool {
    spec.cors.as_ref().and_then(|c| c.per_route.as_ref()).is_some_and(|r| !r.is_empty())
}

pub fn applies(spec: &GatewaySpec) -> bool {
    spec.cors.as_ref().is_some_and(|c| c.global.is_some()) || has_per_route(spec)
}

fn policy_env(env: &mut EnvBucket, path: &str, policy: &CorsPolicy) {
    let prefix = format!("SPRING_CLOUD_GATEWAY_GLOBALCORS_CORSCONFIGURATIONS_[{path}]_");
    let lists = [
        ("ALLOWEDORIGINS", &policy.allowed_origins),
        ("ALLOWEDORIGINPATTERNS", &policy.allowed_origin_patterns),
        ("ALLOWEDMETHODS", &policy.allowed_methods),
        ("ALLOWEDHEADERS", &policy.allowed_headers),
        ("EXPOSEDHEADERS", &policy.exposed_headers),
    ];
    for (field, values) in lists {
        if let Some(values) = values.as_ref().filter(|v| !v.is_empty()) {
            env.insert_value(&format!("{prefix}{field}"), values.join(","));
        }
    }
    if let Some(allow_credentials) = policy.allow_credentials {
        env.insert_value(&format!("{prefix}ALLOWCREDENTIALS"), allow_credentials.to_string());
    }
    if let Some(max_age) = policy.max_age {
        env.insert_value(&format!("{prefix}MAXAGE"), max_age.to_string());
    }
}

/// Global and per-route policies are mutually exclusive, global wins.
pub fn apply(gateway: &Gateway) -> Contribution {
    let mut contribution = Contribution::default();
    let Some(cors) = &gateway.spec.cors else {
        return contribution;
    };

    if let Some(global) = &cors.global {
        policy_env(&mut contribution.env, GLOBAL_PATH, global);
        if has_per_route(&gateway.spec) {
            warn!("Both global and per route CORS configured for {}.{}, ignoring per route", gateway.namespace().unwrap_or_default(), gateway.name_any());
            contribution
                .warnings
                .push(FeatureWarning::new("CorsConflict", "global and per route CORS policies are mutually exclusive, per route policies are ignored"));
        }
    } else {
        for (path, policy) in cors.per_route.iter().flatten() {
            policy_env(&mut contribution.env, path, policy);
        }
    }
    contribution
}
