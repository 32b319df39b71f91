use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;
use crate::error::ControlError;
use crate::rmd::RebalanceMd;
use crate::smap::ClusterMap;

/// Closed set of metadata kinds distributable via metasync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionKind {
    /// Cluster map.
    Smap,
    /// Bucket metadata (external collaborator; batched only).
    Bmd,
    /// Rebalance metadata.
    Rmd,
    /// Cluster configuration.
    Config,
    /// Revoked-token list.
    Tokens,
    /// ETL metadata (external collaborator; batched only).
    EtlMd,
}

/// Versioned, UUID-scoped metadata that the metasyncer can disseminate.
///
/// For a given (kind, uuid) lineage, versions observed at any peer are
/// non-decreasing over time.
pub trait Revision: Send + Sync {
    /// Which of the closed kinds this is.
    fn kind(&self) -> RevisionKind;
    /// Monotonic version within the kind.
    fn version(&self) -> u64;
    /// Lineage identifier fixed at first creation.
    fn uuid(&self) -> &str;
}

/// Action tags carried in wire envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Proxy auto-registering at startup.
    SelfJoinProxy,
    /// Target auto-registering at startup.
    SelfJoinTarget,
    /// Operator-driven proxy registration.
    AdminJoinProxy,
    /// Operator-driven target registration.
    AdminJoinTarget,
    /// Keepalive that turned into a map update.
    KeepaliveUpdate,
    /// Eviction of unresponsive nodes by the primary sweep.
    KeepaliveEvict,
    /// Put a node into maintenance.
    StartMaintenance,
    /// Bring a node back from maintenance.
    StopMaintenance,
    /// Permanently remove a node.
    DecommissionNode,
    /// Shut a node down (it may rejoin later).
    ShutdownNode,
    /// Administrative primary change.
    SetPrimary,
    /// Cluster configuration update.
    SetConfig,
    /// Reset configuration to defaults.
    ResetConfig,
    /// Explicit or derived rebalance.
    Rebalance,
    /// Node removed itself from the map.
    SelfRemoval,
}

/// Message accompanying a revision on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMsg {
    /// What happened.
    pub action: Action,
    /// Subject node, when the action concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Action-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl ActionMsg {
    /// Message with only an action tag.
    #[must_use]
    pub const fn new(action: Action) -> Self {
        Self {
            action,
            name: None,
            value: None,
        }
    }

    /// Message naming the subject node.
    #[must_use]
    pub fn named(action: Action, name: impl Into<String>) -> Self {
        Self {
            action,
            name: Some(name.into()),
            value: None,
        }
    }
}

/// Bucket metadata shell. The data path owns its contents; the control core
/// only tracks version and lineage for batching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketMd {
    /// Monotonic version.
    pub version: u64,
    /// Lineage identifier.
    pub uuid: String,
}

impl Revision for BucketMd {
    fn kind(&self) -> RevisionKind {
        RevisionKind::Bmd
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// Revoked-token list replicated so every gateway rejects the same tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenList {
    /// Monotonic version.
    pub version: u64,
    /// Lineage identifier.
    pub uuid: String,
    /// Opaque revoked tokens.
    pub revoked: Vec<String>,
}

impl Revision for TokenList {
    fn kind(&self) -> RevisionKind {
        RevisionKind::Tokens
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// ETL metadata shell; batched only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EtlMd {
    /// Monotonic version.
    pub version: u64,
    /// Lineage identifier.
    pub uuid: String,
}

impl Revision for EtlMd {
    fn kind(&self) -> RevisionKind {
        RevisionKind::EtlMd
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// Versioned wrapper that turns [`ClusterConfig`] into a distributable
/// revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigRev {
    /// Monotonic version.
    pub version: u64,
    /// Lineage identifier.
    pub uuid: String,
    /// The configuration proper.
    pub config: ClusterConfig,
}

impl Revision for ConfigRev {
    fn kind(&self) -> RevisionKind {
        RevisionKind::Config
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// Concrete revision payload moving through the metasyncer.
#[derive(Debug, Clone)]
pub enum RevisionPayload {
    /// Cluster map snapshot.
    Smap(Arc<ClusterMap>),
    /// Bucket metadata snapshot.
    Bmd(Arc<BucketMd>),
    /// Rebalance metadata snapshot.
    Rmd(Arc<RebalanceMd>),
    /// Configuration snapshot.
    Config(Arc<ConfigRev>),
    /// Token list snapshot.
    Tokens(Arc<TokenList>),
    /// ETL metadata snapshot.
    EtlMd(Arc<EtlMd>),
}

impl RevisionPayload {
    /// Kind of the wrapped revision.
    #[must_use]
    pub fn kind(&self) -> RevisionKind {
        match self {
            Self::Smap(r) => r.kind(),
            Self::Bmd(r) => r.kind(),
            Self::Rmd(r) => r.kind(),
            Self::Config(r) => r.kind(),
            Self::Tokens(r) => r.kind(),
            Self::EtlMd(r) => r.kind(),
        }
    }

    /// Version of the wrapped revision.
    #[must_use]
    pub fn version(&self) -> u64 {
        match self {
            Self::Smap(r) => r.version(),
            Self::Bmd(r) => r.version(),
            Self::Rmd(r) => r.version(),
            Self::Config(r) => r.version(),
            Self::Tokens(r) => r.version(),
            Self::EtlMd(r) => r.version(),
        }
    }

    /// Lineage uuid of the wrapped revision.
    #[must_use]
    pub fn uuid(&self) -> &str {
        match self {
            Self::Smap(r) => r.uuid(),
            Self::Bmd(r) => r.uuid(),
            Self::Rmd(r) => r.uuid(),
            Self::Config(r) => r.uuid(),
            Self::Tokens(r) => r.uuid(),
            Self::EtlMd(r) => r.uuid(),
        }
    }

    /// Serializes into a wire envelope paired with `msg`.
    pub fn to_envelope(&self, msg: &ActionMsg) -> Result<RevisionEnvelope, ControlError> {
        let payload = match self {
            Self::Smap(r) => serde_json::to_value(r.as_ref())?,
            Self::Bmd(r) => serde_json::to_value(r.as_ref())?,
            Self::Rmd(r) => serde_json::to_value(r.as_ref())?,
            Self::Config(r) => serde_json::to_value(r.as_ref())?,
            Self::Tokens(r) => serde_json::to_value(r.as_ref())?,
            Self::EtlMd(r) => serde_json::to_value(r.as_ref())?,
        };
        Ok(RevisionEnvelope {
            kind: self.kind(),
            version: self.version(),
            uuid: self.uuid().to_string(),
            msg: msg.clone(),
            payload,
        })
    }
}

/// JSON wire form of one revision within a metasync batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionEnvelope {
    /// Revision kind.
    pub kind: RevisionKind,
    /// Revision version.
    pub version: u64,
    /// Lineage identifier.
    pub uuid: String,
    /// Why this revision was published.
    pub msg: ActionMsg,
    /// Kind-specific body.
    pub payload: serde_json::Value,
}

/// Outcome of checking an incoming revision against the installed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Install the incoming revision.
    Install,
    /// Version is not newer; drop silently (idempotent re-delivery).
    Skip,
}

/// Monotonicity and lineage check for one incoming revision.
///
/// `installed` is `(version, uuid)` of the currently installed revision of
/// the same kind, or `None` when nothing is installed yet. An empty
/// installed uuid means the lineage is not pinned yet and adopts the
/// incoming one.
pub fn admit(
    kind: RevisionKind,
    installed: Option<(u64, &str)>,
    incoming_version: u64,
    incoming_uuid: &str,
) -> Result<Admission, ControlError> {
    let Some((cur_version, cur_uuid)) = installed else {
        return Ok(Admission::Install);
    };
    if !cur_uuid.is_empty() && !incoming_uuid.is_empty() && cur_uuid != incoming_uuid {
        return Err(ControlError::ClusterIntegrity {
            kind,
            expected: cur_uuid.to_string(),
            got: incoming_uuid.to_string(),
        });
    }
    if incoming_version <= cur_version {
        return Ok(Admission::Skip);
    }
    Ok(Admission::Install)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_installs_newer_and_skips_stale() {
        let res = admit(RevisionKind::Bmd, Some((5, "abc")), 6, "abc").unwrap();
        assert_eq!(res, Admission::Install);
        let res = admit(RevisionKind::Bmd, Some((5, "abc")), 5, "abc").unwrap();
        assert_eq!(res, Admission::Skip);
        let res = admit(RevisionKind::Bmd, Some((5, "abc")), 3, "abc").unwrap();
        assert_eq!(res, Admission::Skip);
    }

    #[test]
    fn admit_flags_lineage_mismatch() {
        let err = admit(RevisionKind::Smap, Some((5, "abc")), 6, "zzz").unwrap_err();
        assert!(matches!(err, ControlError::ClusterIntegrity { .. }));
    }

    #[test]
    fn admit_adopts_unpinned_lineage() {
        let res = admit(RevisionKind::Rmd, Some((0, "")), 1, "abc").unwrap();
        assert_eq!(res, Admission::Install);
    }

    #[test]
    fn envelope_round_trip() {
        let rmd = Arc::new(RebalanceMd {
            version: 7,
            uuid: "lineage".to_string(),
            target_ids: vec![],
        });
        let env = RevisionPayload::Rmd(rmd)
            .to_envelope(&ActionMsg::new(Action::Rebalance))
            .unwrap();
        assert_eq!(env.kind, RevisionKind::Rmd);
        assert_eq!(env.version, 7);
        let back: RebalanceMd = serde_json::from_value(env.payload).unwrap();
        assert_eq!(back.version, 7);
    }
}
