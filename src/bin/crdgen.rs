use gateway_operator::crds::{Gateway, GatewayMapping, GatewayRouteConfig};
use kube::core::CustomResourceExt;

#[allow(clippy::print_stdout)]
fn main() -> Result<(), serde_yaml::Error> {
    for crd in [Gateway::crd(), GatewayMapping::crd(), GatewayRouteConfig::crd()] {
        println!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
