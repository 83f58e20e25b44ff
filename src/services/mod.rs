pub mod admin_client;
pub mod composer;
pub mod diff;
pub mod image_pull_secret;
pub mod leader_election;
pub mod monitoring;
pub mod network;
pub mod rbac;
pub mod route_resolver;

pub use admin_client::{AdminClient, AdminError, AdminTarget, HttpAdminClient};
pub use composer::{ComposedWorkload, Composer, CompositionContext, FeatureContributor, FeatureError, FeatureWarning};
pub use leader_election::LeaderElector;
pub use route_resolver::{RouteConfigResolver, RouteDefinition, RouteError, RouteResolver};
