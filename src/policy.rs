//! Key policy attached to the enclave's KMS key at creation
//!
//! The policy is fixed once and never edited afterwards, so it must already be
//! minimal when the key is created:
//!
//! 1. the enclave role may fetch the public key;
//! 2. the enclave role may run `DeriveSharedSecret`, but only for a recipient
//!    attestation whose PCR0 equals the measurement pinned here;
//! 3. the account root may inspect and schedule deletion of the key.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const POLICY_VERSION: &str = "2012-10-17";

pub const ACTION_GET_PUBLIC_KEY: &str = "kms:GetPublicKey";
pub const ACTION_DERIVE_SHARED_SECRET: &str = "kms:DeriveSharedSecret";
pub const ACTION_DESCRIBE_KEY: &str = "kms:DescribeKey";
pub const ACTION_GET_KEY_POLICY: &str = "kms:GetKeyPolicy";
pub const ACTION_SCHEDULE_KEY_DELETION: &str = "kms:ScheduleKeyDeletion";

/// Condition key KMS fills from the PCR0 of a recipient attestation
pub const RECIPIENT_PCR0: &str = "kms:RecipientAttestation:PCR0";

/// IAM role the enclave's parent instance runs as
pub fn enclave_role_arn(account_id: &str, role: &str) -> String {
    format!("arn:aws:iam::{}:role/{}", account_id, role)
}

/// Administrative principal of the account
pub fn account_root_arn(account_id: &str) -> String {
    format!("arn:aws:iam::{}:root", account_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Allow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "AWS")]
    pub aws: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(
        rename = "StringEqualsIgnoreCase",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub string_equals_ignore_case: BTreeMap<String, String>,
}

impl Condition {
    /// Every constrained attribute must be present in `context` and equal, ignoring ASCII case
    pub fn holds(&self, context: &BTreeMap<String, String>) -> bool {
        self.string_equals_ignore_case.iter().all(|(key, expected)| {
            context
                .get(key)
                .map(|actual| actual.eq_ignore_ascii_case(expected))
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    pub effect: Effect,
    pub principal: Principal,
    pub action: Vec<String>,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Statement {
    fn allow(principal: &str, actions: &[&str]) -> Self {
        Self {
            effect: Effect::Allow,
            principal: Principal {
                aws: principal.to_string(),
            },
            action: actions.iter().map(|a| a.to_string()).collect(),
            resource: "*".to_string(),
            condition: None,
        }
    }

    fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Whether this statement grants `action` to `principal` under `context`
    pub fn grants(&self, principal: &str, action: &str, context: &BTreeMap<String, String>) -> bool {
        self.effect == Effect::Allow
            && self.principal.aws == principal
            && self.action.iter().any(|a| a == action)
            && self
                .condition
                .as_ref()
                .map(|condition| condition.holds(context))
                .unwrap_or(true)
    }
}

/// A KMS key policy document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeyPolicy {
    pub version: String,
    #[serde(rename = "Statement")]
    pub statements: Vec<Statement>,
}

impl KeyPolicy {
    /// Builds the three-statement policy pinning key agreement to `pcr0`
    pub fn for_enclave(enclave_principal: &str, admin_principal: &str, pcr0: &[u8]) -> Self {
        let mut pinned = BTreeMap::new();
        pinned.insert(RECIPIENT_PCR0.to_string(), hex::encode(pcr0));

        Self {
            version: POLICY_VERSION.to_string(),
            statements: vec![
                Statement::allow(enclave_principal, &[ACTION_GET_PUBLIC_KEY]),
                Statement::allow(enclave_principal, &[ACTION_DERIVE_SHARED_SECRET]).when(
                    Condition {
                        string_equals_ignore_case: pinned,
                    },
                ),
                Statement::allow(
                    admin_principal,
                    &[
                        ACTION_DESCRIBE_KEY,
                        ACTION_GET_KEY_POLICY,
                        ACTION_SCHEDULE_KEY_DELETION,
                    ],
                ),
            ],
        }
    }

    /// Policy document as KMS expects it in `CreateKey`
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether any statement grants `action` to `principal` under `context`
    pub fn allows(&self, principal: &str, action: &str, context: &BTreeMap<String, String>) -> bool {
        self.statements
            .iter()
            .any(|statement| statement.grants(principal, action, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACCOUNT: &str = "123456789012";
    const ROLE: &str = "nitro-test-iam-role";

    fn policy() -> KeyPolicy {
        KeyPolicy::for_enclave(
            &enclave_role_arn(ACCOUNT, ROLE),
            &account_root_arn(ACCOUNT),
            &[0xab; 48],
        )
    }

    fn pcr0_context(value: &str) -> BTreeMap<String, String> {
        let mut context = BTreeMap::new();
        context.insert(RECIPIENT_PCR0.to_string(), value.to_string());
        context
    }

    #[test]
    fn test_principals() {
        assert_eq!(
            enclave_role_arn(ACCOUNT, ROLE),
            "arn:aws:iam::123456789012:role/nitro-test-iam-role"
        );
        assert_eq!(account_root_arn(ACCOUNT), "arn:aws:iam::123456789012:root");
    }

    #[test]
    fn test_policy_json_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&policy().to_json().unwrap()).unwrap();
        assert_eq!(json["Version"], "2012-10-17");

        let statements = json["Statement"].as_array().unwrap();
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0]["Effect"], "Allow");
        assert_eq!(
            statements[0]["Principal"]["AWS"],
            "arn:aws:iam::123456789012:role/nitro-test-iam-role"
        );
        assert_eq!(statements[0]["Action"], serde_json::json!(["kms:GetPublicKey"]));
        assert_eq!(statements[0]["Resource"], "*");
        assert!(statements[0].get("Condition").is_none());
        assert_eq!(
            statements[1]["Condition"]["StringEqualsIgnoreCase"][RECIPIENT_PCR0],
            "ab".repeat(48)
        );
        assert_eq!(
            statements[2]["Action"],
            serde_json::json!([
                "kms:DescribeKey",
                "kms:GetKeyPolicy",
                "kms:ScheduleKeyDeletion"
            ])
        );
    }

    #[test]
    fn test_measurement_only_in_key_agreement_statement() {
        let pcr0_hex = "ab".repeat(48);
        let policy = policy();
        for (index, statement) in policy.statements.iter().enumerate() {
            let json = serde_json::to_string(statement).unwrap();
            assert_eq!(json.contains(&pcr0_hex), index == 1, "statement {}", index);
        }
    }

    #[test]
    fn test_policy_round_trips_through_json() {
        let policy = policy();
        assert_eq!(KeyPolicy::from_json(&policy.to_json().unwrap()).unwrap(), policy);
    }

    #[test]
    fn test_allows_key_agreement_only_with_pinned_measurement() {
        let policy = policy();
        let enclave = enclave_role_arn(ACCOUNT, ROLE);

        assert!(policy.allows(
            &enclave,
            ACTION_DERIVE_SHARED_SECRET,
            &pcr0_context(&"AB".repeat(48))
        ));
        assert!(!policy.allows(
            &enclave,
            ACTION_DERIVE_SHARED_SECRET,
            &pcr0_context(&"00".repeat(48))
        ));
        assert!(!policy.allows(&enclave, ACTION_DERIVE_SHARED_SECRET, &BTreeMap::new()));
    }

    #[test]
    fn test_allows_by_principal_and_action() {
        let policy = policy();
        let enclave = enclave_role_arn(ACCOUNT, ROLE);
        let root = account_root_arn(ACCOUNT);
        let none = BTreeMap::new();

        assert!(policy.allows(&enclave, ACTION_GET_PUBLIC_KEY, &none));
        assert!(!policy.allows(&enclave, ACTION_SCHEDULE_KEY_DELETION, &none));
        assert!(policy.allows(&root, ACTION_SCHEDULE_KEY_DELETION, &none));
        assert!(!policy.allows(&root, ACTION_DERIVE_SHARED_SECRET, &pcr0_context(&"ab".repeat(48))));
        assert!(!policy.allows("arn:aws:iam::999999999999:root", ACTION_DESCRIBE_KEY, &none));
    }
}
