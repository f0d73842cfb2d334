//! The uniform victim contract: wraps a single opted-in workload controller
//! (Deployment, StatefulSet or DaemonSet) and exposes the pod-selection and
//! termination operations chaos execution needs, independent of which kind
//! of controller it came from.
mod factory;

pub use factory::{eligible_victims, VictimFactoryError};

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::policy::v1beta1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, Meta};
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::config::{Config, ENABLED_LABEL_VALUE, ENABLED_LABEL_KEY, IDENT_LABEL_KEY, KILL_TYPE_LABEL_KEY, KILL_VALUE_LABEL_KEY, MTBF_LABEL_KEY};

/// Which kind of workload controller a [`Victim`] was built from. Pods always carry the
/// same opt-in labels regardless of kind, but re-checking enrollment at execution time
/// requires talking to the right API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControllerKind {
    /// `apps/v1` Deployment.
    Deployment,
    /// `apps/v1` StatefulSet.
    StatefulSet,
    /// `apps/v1` DaemonSet.
    DaemonSet,
}

impl ControllerKind {
    /// The string used in log output and the `Result` report, matching the Go type name
    /// convention this was ported from (`"v1.Deployment"` and friends).
    pub fn label(&self) -> &'static str {
        match self {
            ControllerKind::Deployment => "Deployment",
            ControllerKind::StatefulSet => "StatefulSet",
            ControllerKind::DaemonSet => "DaemonSet",
        }
    }
}

/// The kill mode a victim was labeled with, and any numeric parameter it carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillMode {
    /// Always delete exactly this many pods.
    Fixed(i64),
    /// Delete this percentage of currently running pods (floored).
    FixedPercentage(i64),
    /// Delete up to this percentage of currently running pods, chosen at random.
    RandomMaxPercentage(i64),
    /// Delete every currently running pod.
    KillAll,
    /// Delete as many pods as the controller's PodDisruptionBudget currently allows.
    PodDisruptionBudget,
    /// No kill-mode label was present; falls back to terminating a single running pod.
    SingleRandomPod,
}

/// Errors raised while constructing a [`Victim`] from a labeled controller object.
#[derive(Error, Debug)]
pub enum VictimConstructionError {
    /// The controller is missing a required opt-in label.
    #[error("{kind} {name} is missing required label {label}")]
    MissingLabel {
        /// Controller kind.
        kind: &'static str,
        /// Controller name.
        name: String,
        /// Missing label key.
        label: &'static str,
    },
    /// The mtbf label value could not be parsed.
    #[error("{kind} {name} has an invalid mtbf label: {source}")]
    InvalidMtbf {
        /// Controller kind.
        kind: &'static str,
        /// Controller name.
        name: String,
        /// Underlying parse error.
        #[source]
        source: crate::calendar::MtbfError,
    },
}

/// Errors raised while re-verifying or terminating a previously scheduled victim.
#[derive(Error, Debug)]
pub enum VictimApiError {
    /// The Kubernetes API call itself failed.
    #[error("kubernetes API error: {0}")]
    Api(#[from] kube::Error),
    /// The victim's kill-mode/value labels were missing or invalid at execution time.
    #[error("{0}")]
    InvalidKillLabels(String),
    /// There were no running pods to act on.
    #[error("{kind} {name} has no running pods at the moment")]
    NoRunningPods {
        /// Controller kind.
        kind: &'static str,
        /// Controller name.
        name: String,
    },
    /// A negative kill count was requested. Zero is a valid no-op, not an error.
    #[error("invalid number of pods to terminate: {0}")]
    InvalidKillCount(i64),
    /// The controller does not carry a usable pod selector (needed for PDB lookups).
    #[error("{kind} {name} has no pod selector")]
    NoSelector {
        /// Controller kind.
        kind: &'static str,
        /// Controller name.
        name: String,
    },
    /// No PodDisruptionBudget matches the controller's selector.
    #[error("{kind} {name} has no matching PodDisruptionBudget")]
    NoPodDisruptionBudget {
        /// Controller kind.
        kind: &'static str,
        /// Controller name.
        name: String,
    },
    /// The matching PodDisruptionBudget already permits no further disruption.
    #[error("{kind} {name}'s PodDisruptionBudget is already fully satisfied")]
    PdbAlreadySatisfied {
        /// Controller kind.
        kind: &'static str,
        /// Controller name.
        name: String,
    },
}

/// An opted-in workload controller, as resolved at schedule-build time. Cheap to clone;
/// holds only the handful of fields termination logic needs.
#[derive(Clone, Debug)]
pub struct Victim {
    kind: ControllerKind,
    name: String,
    namespace: String,
    identifier: String,
    mtbf: std::time::Duration,
}

impl Victim {
    /// Builds a victim from a controller's labels, failing if the identifier or mtbf
    /// labels are absent or malformed. Mirrors the per-kind `New` constructors that read
    /// the same two labels regardless of controller type.
    pub fn from_labels(
        kind: ControllerKind,
        name: String,
        namespace: String,
        labels: &BTreeMap<String, String>,
    ) -> Result<Self, VictimConstructionError> {
        let identifier = labels
            .get(IDENT_LABEL_KEY)
            .ok_or_else(|| VictimConstructionError::MissingLabel {
                kind: kind.label(),
                name: name.clone(),
                label: IDENT_LABEL_KEY,
            })?
            .clone();

        let mtbf_raw = labels
            .get(MTBF_LABEL_KEY)
            .ok_or_else(|| VictimConstructionError::MissingLabel {
                kind: kind.label(),
                name: name.clone(),
                label: MTBF_LABEL_KEY,
            })?;

        let mtbf = crate::calendar::parse_mtbf(mtbf_raw).map_err(|source| {
            VictimConstructionError::InvalidMtbf {
                kind: kind.label(),
                name: name.clone(),
                source,
            }
        })?;

        Ok(Self {
            kind,
            name,
            namespace,
            identifier,
            mtbf,
        })
    }

    /// Controller kind this victim was built from.
    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    /// Controller name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controller namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The unique identifier label shared by the controller and its pods.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Mean time between failures, as configured on the controller.
    pub fn mtbf(&self) -> std::time::Duration {
        self.mtbf
    }

    /// True if `namespace` appears in the configured blacklist.
    pub fn is_blacklisted(&self, config: &Config) -> bool {
        config.blacklisted_namespaces.contains(&self.namespace)
    }

    /// True if the namespace is whitelisted, or no whitelist is configured at all.
    pub fn is_whitelisted(&self, config: &Config) -> bool {
        !config.whitelist_enabled() || config.whitelisted_namespaces.contains(&self.namespace)
    }

    /// Lists every pod carrying this victim's identifier label.
    pub async fn pods(&self, client: kube::Client) -> Result<Vec<Pod>, VictimApiError> {
        let api: Api<Pod> = Api::namespaced(client, &self.namespace);
        let lp = ListParams::default().labels(&format!("{}={}", IDENT_LABEL_KEY, self.identifier));
        let list = api.list(&lp).await?;
        Ok(list.items)
    }

    /// Lists only the currently running pods for this victim.
    pub async fn running_pods(&self, client: kube::Client) -> Result<Vec<Pod>, VictimApiError> {
        let pods = self.pods(client).await?;
        Ok(pods
            .into_iter()
            .filter(|p| {
                p.status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .map(|phase| phase == "Running")
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Deletes a single named pod with the given grace period (the caller is
    /// responsible for combining the configured floor with the pod's own
    /// `terminationGracePeriodSeconds`). In dry-run mode, no API call is made and
    /// success is returned unconditionally.
    pub async fn delete_pod(
        &self,
        client: kube::Client,
        pod_name: &str,
        grace_period_sec: i64,
        dry_run: bool,
    ) -> Result<(), VictimApiError> {
        if dry_run {
            tracing::info!(
                kind = self.kind.label(),
                name = %self.name,
                pod = pod_name,
                "dry-run: would delete pod"
            );
            return Ok(());
        }
        let api: Api<Pod> = Api::namespaced(client, &self.namespace);
        let dp = DeleteParams {
            grace_period_seconds: Some(grace_period_sec.max(0) as u32),
            ..Default::default()
        };
        api.delete(pod_name, &dp).await?;
        Ok(())
    }

    /// Deletes `kill_num` running pods, chosen at random. Errors if `kill_num` is
    /// negative or if there are no running pods to choose from; a `kill_num` of zero is
    /// a no-op that still returns success. If `kill_num` exceeds the number of running
    /// pods, all of them are deleted and a warning is logged.
    pub async fn delete_random_pods(
        &self,
        client: kube::Client,
        kill_num: i64,
        grace_period_sec: i64,
        dry_run: bool,
        rng: &mut impl Rng,
    ) -> Result<(), VictimApiError> {
        if kill_num < 0 {
            return Err(VictimApiError::InvalidKillCount(kill_num));
        } else if kill_num == 0 {
            return Ok(());
        }

        let mut running = self.running_pods(client.clone()).await?;
        if running.is_empty() {
            return Err(VictimApiError::NoRunningPods {
                kind: self.kind.label(),
                name: self.name.clone(),
            });
        }

        if (kill_num as usize) > running.len() {
            tracing::warn!(
                kind = self.kind.label(),
                name = %self.name,
                requested = kill_num,
                running = running.len(),
                "kill count exceeds running pods, deleting all of them"
            );
        }

        running.shuffle(rng);
        let n = (kill_num as usize).min(running.len());
        for pod in &running[..n] {
            let name = Meta::name(pod);
            let pod_grace = pod
                .spec
                .as_ref()
                .and_then(|s| s.termination_grace_period_seconds)
                .unwrap_or(0);
            let grace = grace_period_sec.max(pod_grace);
            self.delete_pod(client.clone(), &name, grace, dry_run).await?;
        }
        Ok(())
    }

    /// Computes the number of pods to kill for [`KillMode::FixedPercentage`]: a floor of
    /// `running_count * percentage / 100`.
    pub fn kill_number_for_fixed_percentage(running_count: usize, percentage: i64) -> i64 {
        (running_count as i64 * percentage) / 100
    }

    /// Computes a random kill count between `0` and `running_count * max_percentage / 100`,
    /// inclusive, for [`KillMode::RandomMaxPercentage`].
    pub fn kill_number_for_max_percentage(
        running_count: usize,
        max_percentage: i64,
        rng: &mut impl Rng,
    ) -> i64 {
        let ceiling = (running_count as i64 * max_percentage) / 100;
        if ceiling <= 0 {
            0
        } else {
            rng.gen_range(0..=ceiling)
        }
    }

    /// The number of pods to kill for a PodDisruptionBudget-governed victim: however many
    /// more than the minimum desired are currently healthy. Fails with
    /// [`VictimApiError::PdbAlreadySatisfied`] if the budget permits no disruption.
    pub fn kill_number_for_pod_disruption_budget(
        &self,
        desired: i32,
        healthy: i32,
    ) -> Result<i64, VictimApiError> {
        let kill_num = (healthy - desired) as i64;
        if kill_num <= 0 {
            return Err(VictimApiError::PdbAlreadySatisfied {
                kind: self.kind.label(),
                name: self.name.clone(),
            });
        }
        Ok(kill_num)
    }

    /// Fetches the PodDisruptionBudget matching `selector`, returning the desired healthy
    /// pod count and the currently-observed healthy pod count.
    pub async fn pod_disruption_budget(
        &self,
        client: kube::Client,
        selector: &LabelSelector,
    ) -> Result<(i32, i32), VictimApiError> {
        let api: Api<PodDisruptionBudget> = Api::namespaced(client, &self.namespace);
        let list = api.list(&ListParams::default()).await?;
        let matching = list
            .items
            .into_iter()
            .find(|pdb| selector_matches(pdb, selector))
            .ok_or_else(|| VictimApiError::NoPodDisruptionBudget {
                kind: self.kind.label(),
                name: self.name.clone(),
            })?;

        let status = matching.status.ok_or_else(|| VictimApiError::NoPodDisruptionBudget {
            kind: self.kind.label(),
            name: self.name.clone(),
        })?;

        let desired = status.desired_healthy;
        let healthy = status.current_healthy;
        Ok((desired, healthy))
    }

    /// Re-fetches the controller and returns true if it is still opted in.
    pub async fn is_enrolled(&self, client: kube::Client) -> Result<bool, VictimApiError> {
        let labels = self.fetch_controller_labels(client).await?;
        Ok(labels
            .get(ENABLED_LABEL_KEY)
            .map(|v| v == ENABLED_LABEL_VALUE)
            .unwrap_or(false))
    }

    /// Re-fetches the controller's kill-mode label. Defaults to
    /// [`KillMode::SingleRandomPod`] with a warning when the label is absent, matching the
    /// later Go revision's behavior over the earlier one that treated a missing label as a
    /// fatal error.
    pub async fn kill_type(&self, client: kube::Client) -> Result<KillMode, VictimApiError> {
        let labels = self.fetch_controller_labels(client.clone()).await?;
        let mode = match labels.get(KILL_TYPE_LABEL_KEY) {
            Some(mode) => mode,
            None => {
                tracing::warn!(
                    kind = self.kind.label(),
                    name = %self.name,
                    "missing {} label, defaulting to single random pod",
                    KILL_TYPE_LABEL_KEY
                );
                return Ok(KillMode::SingleRandomPod);
            }
        };

        match mode.as_str() {
            "kill-all" => Ok(KillMode::KillAll),
            "pod-disruption-budget" => Ok(KillMode::PodDisruptionBudget),
            "fixed" => Ok(KillMode::Fixed(self.kill_value(client).await?)),
            "fixed-percent" => Ok(KillMode::FixedPercentage(self.kill_value(client).await?)),
            "random-max-percent" => {
                Ok(KillMode::RandomMaxPercentage(self.kill_value(client).await?))
            }
            other => Err(VictimApiError::InvalidKillLabels(format!(
                "{} {} has unrecognized kill-mode {:?}",
                self.kind.label(),
                self.name,
                other
            ))),
        }
    }

    /// Re-fetches the controller's kill-value label as an integer.
    pub async fn kill_value(&self, client: kube::Client) -> Result<i64, VictimApiError> {
        let labels = self.fetch_controller_labels(client).await?;
        let raw = labels.get(KILL_VALUE_LABEL_KEY).ok_or_else(|| {
            VictimApiError::InvalidKillLabels(format!(
                "{} {} is missing {} label",
                self.kind.label(),
                self.name,
                KILL_VALUE_LABEL_KEY
            ))
        })?;
        raw.parse::<i64>().map_err(|_| {
            VictimApiError::InvalidKillLabels(format!(
                "{} {} has non-numeric {} label: {:?}",
                self.kind.label(),
                self.name,
                KILL_VALUE_LABEL_KEY,
                raw
            ))
        })
    }

    /// Re-fetches the controller's pod-template label selector, used for PDB lookups.
    pub async fn selector(&self, client: kube::Client) -> Result<LabelSelector, VictimApiError> {
        match self.kind {
            ControllerKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(client, &self.namespace);
                let obj = api.get(&self.name).await?;
                obj.spec
                    .map(|s| s.selector)
                    .ok_or_else(|| self.no_selector_err())
            }
            ControllerKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(client, &self.namespace);
                let obj = api.get(&self.name).await?;
                obj.spec
                    .map(|s| s.selector)
                    .ok_or_else(|| self.no_selector_err())
            }
            ControllerKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::namespaced(client, &self.namespace);
                let obj = api.get(&self.name).await?;
                obj.spec
                    .map(|s| s.selector)
                    .ok_or_else(|| self.no_selector_err())
            }
        }
    }

    fn no_selector_err(&self) -> VictimApiError {
        VictimApiError::NoSelector {
            kind: self.kind.label(),
            name: self.name.clone(),
        }
    }

    async fn fetch_controller_labels(
        &self,
        client: kube::Client,
    ) -> Result<BTreeMap<String, String>, VictimApiError> {
        let labels = match self.kind {
            ControllerKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(client, &self.namespace);
                Meta::meta(&api.get(&self.name).await?).labels.clone()
            }
            ControllerKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(client, &self.namespace);
                Meta::meta(&api.get(&self.name).await?).labels.clone()
            }
            ControllerKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::namespaced(client, &self.namespace);
                Meta::meta(&api.get(&self.name).await?).labels.clone()
            }
        };
        Ok(labels.unwrap_or_default().into_iter().collect())
    }
}

fn selector_matches(pdb: &PodDisruptionBudget, selector: &LabelSelector) -> bool {
    pdb.spec
        .as_ref()
        .and_then(|s| s.selector.as_ref())
        .map(|pdb_selector| pdb_selector.match_labels == selector.match_labels)
        .unwrap_or(false)
}

/// Label selector string used to list opted-in controllers: `key=value` for the enabled
/// label, handed straight to [`ListParams::labels`].
pub fn enrollment_label_selector() -> String {
    format!("{}={}", ENABLED_LABEL_KEY, ENABLED_LABEL_VALUE)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn victim(namespace: &str) -> Victim {
        Victim {
            kind: ControllerKind::Deployment,
            name: "web".to_string(),
            namespace: namespace.to_string(),
            identifier: "abc123".to_string(),
            mtbf: std::time::Duration::from_secs(86400),
        }
    }

    #[test]
    fn from_labels_requires_identifier() {
        let mut labels = BTreeMap::new();
        labels.insert(MTBF_LABEL_KEY.to_string(), "2".to_string());
        let err = Victim::from_labels(
            ControllerKind::Deployment,
            "web".to_string(),
            "default".to_string(),
            &labels,
        )
        .unwrap_err();
        assert!(matches!(err, VictimConstructionError::MissingLabel { .. }));
    }

    #[test]
    fn from_labels_requires_valid_mtbf() {
        let mut labels = BTreeMap::new();
        labels.insert(IDENT_LABEL_KEY.to_string(), "abc".to_string());
        labels.insert(MTBF_LABEL_KEY.to_string(), "not-a-duration".to_string());
        let err = Victim::from_labels(
            ControllerKind::Deployment,
            "web".to_string(),
            "default".to_string(),
            &labels,
        )
        .unwrap_err();
        assert!(matches!(err, VictimConstructionError::InvalidMtbf { .. }));
    }

    #[test]
    fn from_labels_succeeds() {
        let mut labels = BTreeMap::new();
        labels.insert(IDENT_LABEL_KEY.to_string(), "abc".to_string());
        labels.insert(MTBF_LABEL_KEY.to_string(), "2".to_string());
        let v = Victim::from_labels(
            ControllerKind::Deployment,
            "web".to_string(),
            "default".to_string(),
            &labels,
        )
        .unwrap();
        assert_eq!(v.identifier(), "abc");
        assert_eq!(v.mtbf(), std::time::Duration::from_secs(2 * 86400));
    }

    #[test]
    fn blacklist_and_whitelist() {
        let mut config = Config::default();
        config.blacklisted_namespaces.insert("kube-system".to_string());
        config.whitelisted_namespaces.clear();

        let v = victim("default");
        assert!(!v.is_blacklisted(&config));
        assert!(v.is_whitelisted(&config));

        let system_victim = victim("kube-system");
        assert!(system_victim.is_blacklisted(&config));
    }

    #[test]
    fn whitelist_restricts_when_set() {
        let mut config = Config::default();
        config.whitelisted_namespaces.insert("prod".to_string());
        let v = victim("default");
        assert!(!v.is_whitelisted(&config));
        let prod_victim = victim("prod");
        assert!(prod_victim.is_whitelisted(&config));
    }

    #[test]
    fn kill_number_for_fixed_percentage_floors() {
        assert_eq!(Victim::kill_number_for_fixed_percentage(10, 33), 3);
        assert_eq!(Victim::kill_number_for_fixed_percentage(10, 50), 5);
        assert_eq!(Victim::kill_number_for_fixed_percentage(1, 80), 0);
    }

    #[test]
    fn kill_number_for_max_percentage_bounds() {
        let mut rng = StepRng::new(0, 1);
        let n = Victim::kill_number_for_max_percentage(100, 50, &mut rng);
        assert!((0..=50).contains(&n));

        let zero = Victim::kill_number_for_max_percentage(100, 0, &mut rng);
        assert_eq!(zero, 0);
    }

    #[test]
    fn kill_number_for_pod_disruption_budget_counts_excess_healthy() {
        let v = victim("default");
        assert_eq!(v.kill_number_for_pod_disruption_budget(2, 5).unwrap(), 3);
    }

    #[test]
    fn kill_number_for_pod_disruption_budget_errors_when_already_satisfied() {
        let v = victim("default");
        assert!(matches!(
            v.kill_number_for_pod_disruption_budget(3, 3),
            Err(VictimApiError::PdbAlreadySatisfied { .. })
        ));
        assert!(matches!(
            v.kill_number_for_pod_disruption_budget(5, 2),
            Err(VictimApiError::PdbAlreadySatisfied { .. })
        ));
    }

}
