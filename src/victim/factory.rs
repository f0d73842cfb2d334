//! Discovers eligible victims across the configured namespaces: every opted-in
//! Deployment, StatefulSet and DaemonSet that isn't blacklisted.
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::api::{Api, ListParams, Meta};
use thiserror::Error;
use tracing::warn;

use crate::config::Config;

use super::{ControllerKind, Victim};

/// Errors surfaced while discovering victims. Individual listing failures for a single
/// namespace/kind pair are logged and skipped rather than returned here, so that one
/// misbehaving namespace doesn't prevent scheduling everywhere else.
#[derive(Error, Debug)]
pub enum VictimFactoryError {
    /// Every namespace/kind pairing failed; there is nothing to schedule and something
    /// is likely wrong with cluster connectivity.
    #[error("failed to list any eligible victims: {0}")]
    Exhausted(#[source] kube::Error),
}

/// Lists every opted-in, non-blacklisted controller across the namespaces named by
/// [`Config::search_namespaces`] (or all namespaces, if none are whitelisted).
/// Construction failures for a single controller (missing/invalid labels) are logged
/// and skipped rather than aborting the whole scan.
pub async fn eligible_victims(
    client: kube::Client,
    config: &Config,
) -> Result<Vec<Victim>, VictimFactoryError> {
    let namespaces = config.search_namespaces();
    let lp = ListParams::default().labels(&super::enrollment_label_selector());

    let mut victims = Vec::new();
    let mut any_success = false;
    let mut last_error = None;

    if namespaces.is_empty() {
        match list_all_namespaces(client.clone(), &lp, config).await {
            Ok(mut v) => {
                any_success = true;
                victims.append(&mut v);
            }
            Err(e) => last_error = Some(e),
        }
    } else {
        for namespace in namespaces {
            match list_namespace(client.clone(), &namespace, &lp, config).await {
                Ok(mut v) => {
                    any_success = true;
                    victims.append(&mut v);
                }
                Err(e) => {
                    warn!(%namespace, error = %e, "failed to list eligible victims for namespace");
                    last_error = Some(e);
                }
            }
        }
    }

    if !any_success {
        if let Some(e) = last_error {
            return Err(VictimFactoryError::Exhausted(e));
        }
    }

    Ok(victims
        .into_iter()
        .filter(|v| !v.is_blacklisted(config))
        .collect())
}

async fn list_all_namespaces(
    client: kube::Client,
    lp: &ListParams,
    config: &Config,
) -> Result<Vec<Victim>, kube::Error> {
    let mut victims =
        list_namespace_scoped(Api::all(client.clone()), lp, ControllerKind::Deployment, config).await?;
    victims.extend(
        list_namespace_scoped(Api::all(client.clone()), lp, ControllerKind::StatefulSet, config).await?,
    );
    victims.extend(
        list_namespace_scoped(Api::all(client), lp, ControllerKind::DaemonSet, config).await?,
    );
    Ok(victims)
}

async fn list_namespace(
    client: kube::Client,
    namespace: &str,
    lp: &ListParams,
    config: &Config,
) -> Result<Vec<Victim>, kube::Error> {
    let deployments = {
        let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
        construct_victims(api.list(lp).await?.items, ControllerKind::Deployment, config)
    };
    let statefulsets = {
        let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
        construct_victims(api.list(lp).await?.items, ControllerKind::StatefulSet, config)
    };
    let daemonsets = {
        let api: Api<DaemonSet> = Api::namespaced(client, namespace);
        construct_victims(api.list(lp).await?.items, ControllerKind::DaemonSet, config)
    };

    let mut all = deployments;
    all.extend(statefulsets);
    all.extend(daemonsets);
    Ok(all)
}

async fn list_namespace_scoped<K>(
    api: Api<K>,
    lp: &ListParams,
    kind: ControllerKind,
    config: &Config,
) -> Result<Vec<Victim>, kube::Error>
where
    K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Meta,
{
    let list = api.list(lp).await?;
    Ok(construct_victims(list.items, kind, config))
}

fn construct_victims<K: Meta>(items: Vec<K>, kind: ControllerKind, _config: &Config) -> Vec<Victim> {
    items
        .into_iter()
        .filter_map(|item| {
            let meta = Meta::meta(&item);
            let name = meta.name.clone().unwrap_or_default();
            let namespace = meta.namespace.clone().unwrap_or_default();
            let labels = meta.labels.clone().unwrap_or_default();
            match Victim::from_labels(kind, name.clone(), namespace, &labels) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(%name, error = %e, "skipping victim with invalid labels");
                    None
                }
            }
        })
        .collect()
}
