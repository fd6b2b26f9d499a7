//! MeshRootCertificate resource schema.
//!
//! Field names serialize in camelCase to stay wire-compatible with the
//! `MeshRootCertificate` custom resource.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::certificate::IssuerRole;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Optimistic-concurrency version, bumped by the store on every write
    #[serde(default)]
    pub resource_version: u64,
}

/// One root certificate generation and its rotation lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshRootCertificate {
    pub metadata: ObjectMeta,
    pub spec: MeshRootCertificateSpec,
    #[serde(default)]
    pub status: MeshRootCertificateStatus,
}

impl MeshRootCertificate {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: MeshRootCertificateSpec) -> Self {
        Self {
            metadata: ObjectMeta { name: name.into(), namespace: namespace.into(), resource_version: 0 },
            spec,
            status: MeshRootCertificateStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshRootCertificateSpec {
    pub provider: ProviderSpec,
    pub trust_domain: String,
    pub intent: MrcIntent,
    #[serde(default)]
    pub spiffe_enabled: bool,
}

/// Certificate provider backing an MRC; exactly one variant is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderSpec {
    CertManager(CertManagerProviderSpec),
    Vault(VaultProviderSpec),
    Tresor(TresorProviderSpec),
}

impl ProviderSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CertManager(_) => "certManager",
            Self::Vault(_) => "vault",
            Self::Tresor(_) => "tresor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertManagerProviderSpec {
    pub issuer_name: String,
    pub issuer_kind: String,
    pub issuer_group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultProviderSpec {
    pub host: String,
    pub port: u16,
    pub role: String,
    pub protocol: String,
    #[serde(default)]
    pub token: VaultTokenSpec,
}

impl VaultProviderSpec {
    /// e.g. `http://vault.default.svc.cluster.local:8200`
    pub fn address(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VaultTokenSpec {
    pub secret_key_ref: SecretKeyReferenceSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReferenceSpec {
    pub name: String,
    pub key: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TresorProviderSpec {
    pub ca: TresorCaSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TresorCaSpec {
    pub secret_ref: SecretReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// Whether an MRC is being promoted to, or demoted from, the active root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MrcIntent {
    Active,
    Passive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum MrcState {
    #[default]
    Pending,
    ValidatingRollout,
    IssuingRollout,
    Active,
    IssuingRollback,
    ValidatingRollback,
    /// Rollback complete; the root is no longer used
    Inactive,
    Error,
}

impl MrcState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ValidatingRollout => "validatingRollout",
            Self::IssuingRollout => "issuingRollout",
            Self::Active => "active",
            Self::IssuingRollback => "issuingRollback",
            Self::ValidatingRollback => "validatingRollback",
            Self::Inactive => "inactive",
            Self::Error => "error",
        }
    }

    /// Next stage for the given intent, `None` when there is nowhere to go.
    pub fn successor(&self, intent: MrcIntent) -> Option<MrcState> {
        match (self, intent) {
            (Self::Pending, MrcIntent::Active) => Some(Self::ValidatingRollout),
            (Self::ValidatingRollout, _) => Some(Self::IssuingRollout),
            (Self::IssuingRollout, _) => Some(Self::Active),
            (Self::Active, MrcIntent::Passive) => Some(Self::IssuingRollback),
            (Self::IssuingRollback, _) => Some(Self::ValidatingRollback),
            (Self::ValidatingRollback, _) => Some(Self::Inactive),
            _ => None,
        }
    }

    /// A state with no successor under any intent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Inactive | Self::Error)
    }

    /// Component status every component reports once it has caught up with this state.
    pub fn target_component_status(&self) -> Option<ComponentStatus> {
        match self {
            Self::ValidatingRollout | Self::IssuingRollback => Some(ComponentStatus::Validating),
            Self::IssuingRollout => Some(ComponentStatus::Issuing),
            Self::Active => Some(ComponentStatus::Active),
            Self::ValidatingRollback | Self::Inactive => Some(ComponentStatus::Unused),
            Self::Pending | Self::Error => None,
        }
    }

    /// Issuer slots an MRC in this state occupies on the Manager.
    pub fn issuer_role(&self) -> IssuerRole {
        match self {
            Self::Active => IssuerRole::Both,
            Self::IssuingRollout | Self::IssuingRollback => IssuerRole::Signing,
            Self::ValidatingRollout | Self::ValidatingRollback => IssuerRole::Validating,
            _ => IssuerRole::Both,
        }
    }

    /// Condition that records this state as a rotation stage.
    pub fn stage_condition(&self) -> Option<MrcConditionType> {
        match self {
            Self::ValidatingRollout => Some(MrcConditionType::ValidatingRollout),
            Self::IssuingRollout => Some(MrcConditionType::IssuingRollout),
            Self::Active => Some(MrcConditionType::Ready),
            Self::IssuingRollback => Some(MrcConditionType::IssuingRollback),
            Self::ValidatingRollback => Some(MrcConditionType::ValidatingRollback),
            Self::Pending | Self::Inactive | Self::Error => None,
        }
    }
}

impl fmt::Display for MrcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialized with capitalized names ("Validating", "Unused", ...), unlike the MRC state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ComponentStatus {
    /// Not yet reported
    #[default]
    Unknown,
    Validating,
    Issuing,
    Active,
    Unused,
    Error,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Validating => "validating",
            Self::Issuing => "issuing",
            Self::Active => "active",
            Self::Unused => "unused",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named component status fields of an MRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Webhooks,
    XdsControlPlane,
    Sidecar,
    Bootstrap,
    Gateway,
}

impl Component {
    pub const ALL: [Component; 5] =
        [Component::Webhooks, Component::XdsControlPlane, Component::Sidecar, Component::Bootstrap, Component::Gateway];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatuses {
    #[serde(default)]
    pub webhooks: ComponentStatus,
    #[serde(default)]
    pub xds_control_plane: ComponentStatus,
    #[serde(default)]
    pub sidecar: ComponentStatus,
    #[serde(default)]
    pub bootstrap: ComponentStatus,
    #[serde(default)]
    pub gateway: ComponentStatus,
}

impl ComponentStatuses {
    pub fn all(status: ComponentStatus) -> Self {
        Self { webhooks: status, xds_control_plane: status, sidecar: status, bootstrap: status, gateway: status }
    }

    pub fn get(&self, component: Component) -> ComponentStatus {
        match component {
            Component::Webhooks => self.webhooks,
            Component::XdsControlPlane => self.xds_control_plane,
            Component::Sidecar => self.sidecar,
            Component::Bootstrap => self.bootstrap,
            Component::Gateway => self.gateway,
        }
    }

    /// Set `component` to `status`; returns whether the value changed.
    pub fn set(&mut self, component: Component, status: ComponentStatus) -> bool {
        let field = match component {
            Component::Webhooks => &mut self.webhooks,
            Component::XdsControlPlane => &mut self.xds_control_plane,
            Component::Sidecar => &mut self.sidecar,
            Component::Bootstrap => &mut self.bootstrap,
            Component::Gateway => &mut self.gateway,
        };
        if *field == status {
            return false;
        }
        *field = status;
        true
    }

    pub fn all_equal(&self, status: ComponentStatus) -> bool {
        Component::ALL.iter().all(|component| self.get(*component) == status)
    }
}

/// How a certificate is used. Each use case reports its own progress through a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UseCase {
    ValidatingWebhook,
    MutatingWebhook,
    XdsControlPlane,
    Sidecar,
    Bootstrap,
    Gateway,
}

impl UseCase {
    pub const ALL: [UseCase; 6] = [
        UseCase::ValidatingWebhook,
        UseCase::MutatingWebhook,
        UseCase::XdsControlPlane,
        UseCase::Sidecar,
        UseCase::Bootstrap,
        UseCase::Gateway,
    ];

    /// Status field this use case reports into. Both webhooks share one field.
    pub fn component(&self) -> Component {
        match self {
            Self::ValidatingWebhook | Self::MutatingWebhook => Component::Webhooks,
            Self::XdsControlPlane => Component::XdsControlPlane,
            Self::Sidecar => Component::Sidecar,
            Self::Bootstrap => Component::Bootstrap,
            Self::Gateway => Component::Gateway,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidatingWebhook => "validatingWebhook",
            Self::MutatingWebhook => "mutatingWebhook",
            Self::XdsControlPlane => "xdsControlPlane",
            Self::Sidecar => "sidecar",
            Self::Bootstrap => "bootstrap",
            Self::Gateway => "gateway",
        }
    }
}

impl fmt::Display for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MrcConditionType {
    Ready,
    Accepted,
    ValidatingRollout,
    IssuingRollout,
    ValidatingRollback,
    IssuingRollback,
}

impl MrcConditionType {
    /// The stage a `True` condition of this type declares.
    pub fn stage(&self) -> Option<MrcState> {
        match self {
            Self::Ready => Some(MrcState::Active),
            Self::ValidatingRollout => Some(MrcState::ValidatingRollout),
            Self::IssuingRollout => Some(MrcState::IssuingRollout),
            Self::ValidatingRollback => Some(MrcState::ValidatingRollback),
            Self::IssuingRollback => Some(MrcState::IssuingRollback),
            Self::Accepted => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MrcCondition {
    #[serde(rename = "type")]
    pub condition_type: MrcConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MeshRootCertificateStatus {
    #[serde(default)]
    pub state: MrcState,
    #[serde(default)]
    pub component_statuses: ComponentStatuses,
    #[serde(default)]
    pub conditions: Vec<MrcCondition>,
    /// The next state change may not happen before this time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_after: Option<DateTime<Utc>>,
}
