use kube::ResourceExt;
use reqwest::Url;

use super::{CompositionContext, Contribution, FeatureError, secret_value};
use crate::crds::{Gateway, GatewaySpec};

const CLIENT_ID: &str = "client-id";
const CLIENT_SECRET: &str = "client-secret";
const ISSUER_URI: &str = "issuer-uri";
const SCOPE: &str = "scope";
const REQUIRED_KEYS: [&str; 4] = [CLIENT_ID, CLIENT_SECRET, ISSUER_URI, SCOPE];

pub fn applies(spec: &GatewaySpec) -> bool {
    spec.sso.is_some()
}

fn validate_issuer(issuer: &str) -> Result<(), FeatureError> {
    let invalid = || FeatureError::InvalidIssuer { issuer: issuer.to_owned() };
    let url = Url::parse(issuer.trim()).map_err(|_| invalid())?;
    if matches!(url.scheme(), "http" | "https") && url.host_str().is_some_and(|h| !h.is_empty()) { Ok(()) } else { Err(invalid()) }
}

pub fn apply(context: &CompositionContext, gateway: &Gateway) -> Result<Contribution, FeatureError> {
    let mut contribution = Contribution::default();
    let Some(sso) = &gateway.spec.sso else {
        return Ok(contribution);
    };

    let namespace = gateway.namespace().unwrap_or_default();
    let credential = context.credential(&namespace, &sso.secret, &REQUIRED_KEYS)?;
    validate_issuer(&secret_value(&credential, ISSUER_URI).unwrap_or_default())?;

    let env = &mut contribution.env;
    env.insert_value("SPRING_PROFILES_INCLUDE", "sso");
    env.insert_secret_ref("SSO_CLIENT_ID", &sso.secret, CLIENT_ID);
    env.insert_secret_ref("SSO_CLIENT_SECRET", &sso.secret, CLIENT_SECRET);
    env.insert_secret_ref("SSO_SCOPE", &sso.secret, SCOPE);
    env.insert_secret_ref("SSO_ISSUER_URI", &sso.secret, ISSUER_URI);
    if let Some(roles_attribute_name) = &sso.roles_attribute_name {
        env.insert_value("SSO_ROLES_ATTRIBUTE_NAME", roles_attribute_name.clone());
    }
    if let Some(expiration) = sso.inactive_session_expiration_in_minutes {
        env.insert_value("SSO_INACTIVE_SESSION_EXPIRATION_IN_MINUTES", expiration.to_string());
    }
    Ok(contribution)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        common::test::{gateway_from_yaml, secret},
        services::composer::test::context_with_secrets,
    };

    fn gateway(optional: &str) -> Gateway {
        gateway_from_yaml(&format!(
            r#"
apiVersion: gateway.operator.io/v1
kind: Gateway
metadata:
  name: edge
  namespace: apps
spec:
  sso:
    secret: sso-credentials
{optional}
"#
        ))
    }

    fn credentials(issuer: &str, skip: &str) -> k8s_openapi::api::core::v1::Secret {
        let data: Vec<(&str, &str)> =
            [(CLIENT_ID, "edge"), (CLIENT_SECRET, "s3cr3t"), (ISSUER_URI, issuer), (SCOPE, "openid,profile")].into_iter().filter(|(k, _)| *k != skip).collect();
        secret("apps", "sso-credentials", &data)
    }

    fn names(contribution: &Contribution) -> Vec<String> {
        contribution.env.names().cloned().collect()
    }

    #[test]
    fn test_missing_client_secret() {
        let context = context_with_secrets(vec![credentials("https://login.example.com", CLIENT_SECRET)]);
        assert_eq!(
            apply(&context, &gateway("")),
            Err(FeatureError::MissingCredentialKeys { name: "sso-credentials".to_owned(), keys: vec![CLIENT_SECRET.to_owned()] })
        );
    }

    #[test]
    fn test_valid_credentials_emit_five_vars() {
        let context = context_with_secrets(vec![credentials("https://login.example.com/realms/edge", "")]);
        let contribution = apply(&context, &gateway("")).unwrap();
        assert_eq!(names(&contribution), vec!["SPRING_PROFILES_INCLUDE", "SSO_CLIENT_ID", "SSO_CLIENT_SECRET", "SSO_ISSUER_URI", "SSO_SCOPE"]);
        assert_eq!(contribution.env.value_of("SPRING_PROFILES_INCLUDE"), Some("sso"));
        let client_secret = contribution.env.get("SSO_CLIENT_SECRET").and_then(|e| e.value_from.clone()).and_then(|v| v.secret_key_ref);
        assert_eq!(client_secret.map(|s| (s.name, s.key)), Some(("sso-credentials".to_owned(), CLIENT_SECRET.to_owned())));
    }

    #[test]
    fn test_optional_fields() {
        let context = context_with_secrets(vec![credentials("http://keycloak.auth.svc:8080/realms/edge", "")]);
        let gateway = gateway("    rolesAttributeName: groups\n    inactiveSessionExpirationInMinutes: 30");
        let contribution = apply(&context, &gateway).unwrap();
        assert_eq!(contribution.env.len(), 7);
        assert_eq!(contribution.env.value_of("SSO_ROLES_ATTRIBUTE_NAME"), Some("groups"));
        assert_eq!(contribution.env.value_of("SSO_INACTIVE_SESSION_EXPIRATION_IN_MINUTES"), Some("30"));
    }

    #[test]
    fn test_malformed_issuer() {
        for issuer in ["login.example.com", "ftp://login.example.com", "https://"] {
            let context = context_with_secrets(vec![credentials(issuer, "")]);
            assert_eq!(apply(&context, &gateway("")), Err(FeatureError::InvalidIssuer { issuer: issuer.to_owned() }), "{issuer}");
        }
    }

    #[test]
    fn test_missing_credential() {
        let context = context_with_secrets(vec![]);
        assert_eq!(apply(&context, &gateway("")), Err(FeatureError::MissingCredential { name: "sso-credentials".to_owned() }));
        assert!(!applies(&GatewaySpec::default()));
    }
}
