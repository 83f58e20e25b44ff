use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use reqwest::header::HOST;
use tracing::debug;

use super::route_resolver::RouteDefinition;
use crate::common::MANAGEMENT_PORT;

#[derive(thiserror::Error, Debug)]
pub enum AdminError {
    #[error("admin request failed {0}")]
    Request(#[from] reqwest::Error),
    #[error("admin endpoint {url} answered {status}")]
    Status { url: String, status: u16 },
}

/// Address of the live admin endpoint of one gateway instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdminTarget {
    pub pod_ip: String,
    pub host: String,
}

impl AdminTarget {
    pub fn new(pod_ip: &str, pod_name: &str, headless_service: &str, namespace: &str) -> Self {
        Self { pod_ip: pod_ip.to_owned(), host: format!("{pod_name}.{headless_service}.{namespace}.svc.cluster.local") }
    }

    pub fn url(&self, path: &str) -> String {
        match self.pod_ip.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("http://[{ip}]:{MANAGEMENT_PORT}/actuator/gateway{path}"),
            _ => format!("http://{}:{MANAGEMENT_PORT}/actuator/gateway{path}", self.pod_ip),
        }
    }
}

#[async_trait]
pub trait AdminClient: Send + Sync {
    async fn push_routes(&self, target: &AdminTarget, routes: &[RouteDefinition]) -> Result<(), AdminError>;
}

pub struct HttpAdminClient {
    client: reqwest::Client,
}

impl HttpAdminClient {
    pub fn new(timeout: Duration) -> Result<Self, AdminError> {
        Ok(Self { client: reqwest::Client::builder().timeout(timeout).build()? })
    }

    async fn post(&self, target: &AdminTarget, path: &str, body: Option<&RouteDefinition>) -> Result<(), AdminError> {
        let url = target.url(path);
        let request = self.client.post(&url).header(HOST, &target.host);
        let request = match body {
            Some(route) => request.json(route),
            None => request,
        };
        let response = request.send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AdminError::Status { url, status: response.status().as_u16() })
        }
    }
}

#[async_trait]
impl AdminClient for HttpAdminClient {
    async fn push_routes(&self, target: &AdminTarget, routes: &[RouteDefinition]) -> Result<(), AdminError> {
        for route in routes {
            debug!("Pushing route {} to {}", route.id, target.host);
            self.post(target, &format!("/routes/{}", route.id), Some(route)).await?;
        }
        self.post(target, "/refresh", None).await
    }
}
