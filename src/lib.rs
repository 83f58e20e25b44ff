use std::{fmt::Debug, sync::Arc, time::Duration};

use common::{EventPublisher, KubeApi, KubeEventPublisher, OWNERSHIP_LABEL, State, spawn_reflector, wait_until_synced};
use configuration::Configuration;
use controllers::{
    config_map::{ConfigMapController, ConfigMapControllerContext},
    gateway::{GatewayApis, GatewayController, GatewayControllerContext, GatewayListers},
    readiness_gate::{ReadinessGateController, ReadinessGateControllerContext},
};
use crds::{GatewayMapping, GatewayRouteConfig};
use futures::FutureExt;
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service, ServiceAccount},
    rbac::v1::{Role, RoleBinding},
};
use kube::{Api, Client, Resource, core::NamespaceResourceScope, runtime::watcher};
use serde::{Serialize, de::DeserializeOwned};
use services::{Composer, CompositionContext, HttpAdminClient, LeaderElector, RouteConfigResolver};
use tracing::{info, warn};

pub mod common;
pub mod configuration;
pub mod controllers;
pub mod crds;
pub mod services;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

fn kube_api<K>(client: &Client, field_manager: &str) -> Arc<KubeApi<K>>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    Arc::new(KubeApi::new(client.clone(), field_manager))
}

#[allow(clippy::too_many_lines)]
pub async fn start(configuration: Configuration) -> Result<()> {
    info!("Gateway operator started");
    let client = Client::try_default().await?;
    let controller_name = configuration.controller_name.clone();
    let state = State::new();

    let owned = || watcher::Config::default().labels(OWNERSHIP_LABEL);
    let secrets = spawn_reflector(Api::<Secret>::all(client.clone()), watcher::Config::default());
    let services = spawn_reflector(Api::<Service>::all(client.clone()), owned());
    let stateful_sets = spawn_reflector(Api::<StatefulSet>::all(client.clone()), owned());
    let claims = spawn_reflector(Api::<PersistentVolumeClaim>::all(client.clone()), watcher::Config::default());
    let mappings = spawn_reflector(Api::<GatewayMapping>::all(client.clone()), watcher::Config::default());
    let route_configs = spawn_reflector(Api::<GatewayRouteConfig>::all(client.clone()), watcher::Config::default());
    let extension_config_maps = spawn_reflector(Api::<ConfigMap>::all(client.clone()), watcher::Config::default());
    let gateway_pods = spawn_reflector(Api::<Pod>::all(client.clone()), owned());

    let elector = LeaderElector::new(
        client.clone(),
        &configuration.install_namespace,
        &configuration.leader_election.lease_name,
        &configuration.leader_election.identity(),
    );
    let leadership_lost = elector.acquire().await;

    futures::try_join!(
        wait_until_synced("Secret", &secrets),
        wait_until_synced("Service", &services),
        wait_until_synced("StatefulSet", &stateful_sets),
        wait_until_synced("PersistentVolumeClaim", &claims),
        wait_until_synced("GatewayMapping", &mappings),
        wait_until_synced("GatewayRouteConfig", &route_configs),
        wait_until_synced("ConfigMap", &extension_config_maps),
        wait_until_synced("Pod", &gateway_pods),
    )?;

    let gateway_controller = GatewayController::builder().client(client.clone()).workers(configuration.workers.gateway).build().controller();
    let readiness_gate_controller = ReadinessGateController::builder().client(client.clone()).workers(configuration.workers.pod).build().controller();
    let config_map_controller = ConfigMapController::builder().client(client.clone()).workers(configuration.workers.config_map).build().controller();
    let gateways = gateway_controller.store();
    let pods = readiness_gate_controller.store();
    let config_maps = config_map_controller.store();

    let events: Arc<dyn EventPublisher> = Arc::new(KubeEventPublisher::new(client.clone(), &controller_name));

    let composer = Composer::builder()
        .context(
            CompositionContext::builder()
                .secrets(Arc::new(secrets.clone()))
                .config_maps(Arc::new(extension_config_maps))
                .claims(Arc::new(claims))
                .build(),
        )
        .image(configuration.gateway_image.clone())
        .image_pull_secret(configuration.image_pull_secret.clone())
        .default_resources(configuration.default_resources())
        .build();

    let gateway_context = GatewayControllerContext::builder()
        .controller_name(controller_name.clone())
        .install_namespace(configuration.install_namespace.clone())
        .image_pull_secret(configuration.image_pull_secret.clone())
        .composer(composer)
        .listers(
            GatewayListers::builder()
                .gateways(Arc::new(gateways.clone()))
                .secrets(Arc::new(secrets))
                .services(Arc::new(services))
                .stateful_sets(Arc::new(stateful_sets))
                .pods(Arc::new(gateway_pods))
                .build(),
        )
        .apis(
            GatewayApis::builder()
                .gateways(kube_api::<crds::Gateway>(&client, &controller_name))
                .secrets(kube_api::<Secret>(&client, &controller_name))
                .services(kube_api::<Service>(&client, &controller_name))
                .stateful_sets(kube_api::<StatefulSet>(&client, &controller_name))
                .service_accounts(kube_api::<ServiceAccount>(&client, &controller_name))
                .roles(kube_api::<Role>(&client, &controller_name))
                .role_bindings(kube_api::<RoleBinding>(&client, &controller_name))
                .service_monitors(kube_api::<crds::ServiceMonitor>(&client, &controller_name))
                .build(),
        )
        .events(Arc::clone(&events))
        .requeue(configuration.requeue.clone())
        .build();

    let readiness_gate_context = ReadinessGateControllerContext::builder()
        .controller_name(controller_name.clone())
        .state(state.clone())
        .pods(Arc::new(pods))
        .pod_api(kube_api::<Pod>(&client, &controller_name))
        .resolver(Arc::new(RouteConfigResolver::new(Arc::new(mappings), Arc::new(route_configs))))
        .admin(Arc::new(HttpAdminClient::new(Duration::from_secs(configuration.admin.timeout_seconds))?))
        .events(Arc::clone(&events))
        .requeue(configuration.requeue.clone())
        .build();

    let config_map_context = ConfigMapControllerContext::builder()
        .controller_name(controller_name.clone())
        .state(state)
        .config_maps(Arc::new(config_maps))
        .gateways(Arc::new(gateways))
        .stateful_sets(kube_api::<StatefulSet>(&client, &controller_name))
        .events(events)
        .requeue(configuration.requeue.clone())
        .build();

    let gateway_controller_task = async move {
        info!("Gateway controller...started");
        GatewayController::get_controller(gateway_controller, gateway_context).await;
        info!("Gateway controller...stopped");
        crate::Result::<()>::Ok(())
    };
    let readiness_gate_controller_task = async move {
        info!("Readiness gate controller...started");
        ReadinessGateController::get_controller(readiness_gate_controller, readiness_gate_context).await;
        info!("Readiness gate controller...stopped");
        crate::Result::<()>::Ok(())
    };
    let config_map_controller_task = async move {
        info!("ConfigMap controller...started");
        ConfigMapController::get_controller(config_map_controller, config_map_context).await;
        info!("ConfigMap controller...stopped");
        crate::Result::<()>::Ok(())
    };
    let leadership_task = async move {
        let _ = leadership_lost.await;
        warn!("Leadership lost, stopping controllers");
        crate::Result::<()>::Err("leadership lost".into())
    };

    let (result, _, _) = futures::future::select_all(vec![
        gateway_controller_task.boxed(),
        readiness_gate_controller_task.boxed(),
        config_map_controller_task.boxed(),
        leadership_task.boxed(),
    ])
    .await;
    result
}
