// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Policy engine — per-operation allow/deny evaluation against a requesting
// principal. Rule shape follows the original scheduler's `policy_t`/
// `policyop_t`/`policyname_t` (operation, order type, authenticate flag,
// allow/deny principal-pattern list).

use std::collections::HashMap;

use presswerk_core::types::{AllowDeny, Policy, PolicyEntry, PolicyOp, PolicyOrder, PrincipalPattern};
use tracing::instrument;

/// Outcome of evaluating a policy for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    AuthRequired,
}

/// Holds every named policy the scheduler knows about, plus the configured
/// system group membership used to resolve `@SYSTEM`.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    policies: HashMap<String, Policy>,
    system_group: Vec<String>,
}

impl PolicyEngine {
    pub fn new(system_group: Vec<String>) -> Self {
        Self {
            policies: HashMap::new(),
            system_group,
        }
    }

    pub fn add_policy(&mut self, policy: Policy) {
        self.policies.insert(policy.name.clone(), policy);
    }

    pub fn find_policy(&self, name: &str) -> Option<&Policy> {
        self.policies.get(name)
    }

    /// Evaluate `policy_name` for `operation`, given the requesting
    /// `principal` (`None` if unauthenticated) and the `owner` of the
    /// resource being acted on (substituted for `@OWNER`).
    ///
    /// Pure in its inputs: the same four arguments always produce the same
    /// decision.
    #[instrument(skip(self), fields(%policy_name, %operation))]
    pub fn evaluate(
        &self,
        policy_name: &str,
        operation: &str,
        principal: Option<&str>,
        owner: &str,
    ) -> Decision {
        let Some(policy) = self.policies.get(policy_name) else {
            // No such policy: fail closed.
            return Decision::Deny;
        };

        let op = policy
            .ops
            .iter()
            .find(|o| o.operation.as_deref() == Some(operation))
            .or_else(|| policy.ops.iter().find(|o| o.operation.is_none()));

        let Some(op) = op else {
            return Decision::Deny;
        };

        if op.requires_authentication && principal.is_none() {
            return Decision::AuthRequired;
        }

        let matches = |entry: &PolicyEntry| self.pattern_matches(&entry.pattern, principal, owner);

        let (first, second) = match op.order {
            PolicyOrder::AllowDeny => (AllowDeny::Allow, AllowDeny::Deny),
            PolicyOrder::DenyAllow => (AllowDeny::Deny, AllowDeny::Allow),
        };

        // Evaluate both lists exactly once; default final action depends on
        // the order (allow-then-deny defaults to deny if nothing matched;
        // deny-then-allow defaults to allow).
        let first_hit = op
            .entries
            .iter()
            .filter(|e| e.action == first)
            .any(matches);
        let second_hit = op
            .entries
            .iter()
            .filter(|e| e.action == second)
            .any(matches);

        let allowed = match op.order {
            PolicyOrder::AllowDeny => {
                if second_hit {
                    false
                } else {
                    first_hit || op.entries.iter().all(|e| e.action != AllowDeny::Allow)
                }
            }
            PolicyOrder::DenyAllow => {
                if first_hit {
                    second_hit
                } else {
                    true
                }
            }
        };

        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    /// The scheduler's built-in `default` policy, seeded automatically so a
    /// freshly created (or restored) scheduler can dispatch operations
    /// without an operator first writing a policy file. Shape follows the
    /// stock `<Policy default>` block: read/info operations are open,
    /// job-mutating operations require the job's owner or a `@SYSTEM`
    /// member, and printer/class administration requires `@SYSTEM`.
    pub fn bootstrap_default_policy() -> Policy {
        const OWNER_OR_SYSTEM: &[&str] = &[
            "cancel-job",
            "send-document",
            "hold-job",
            "release-job",
            "restart-job",
            "set-job-attributes",
            "purge-jobs",
            "cups-move-job",
            "cups-authenticate-job",
            "create-printer-subscription",
            "create-job-subscription",
            "cancel-subscription",
            "get-subscription-attributes",
            "renew-subscription",
            "get-notifications",
        ];
        const SYSTEM_ONLY: &[&str] = &[
            "pause-printer",
            "resume-printer",
            "set-printer-attributes",
            "cups-add-modify-printer",
            "cups-delete-printer",
            "cups-add-modify-class",
            "cups-delete-class",
        ];

        let mut ops: Vec<PolicyOp> = OWNER_OR_SYSTEM
            .iter()
            .map(|name| PolicyOp {
                operation: Some((*name).to_string()),
                order: PolicyOrder::AllowDeny,
                requires_authentication: false,
                entries: vec![
                    PolicyEntry {
                        action: AllowDeny::Allow,
                        pattern: PrincipalPattern::Owner,
                    },
                    PolicyEntry {
                        action: AllowDeny::Allow,
                        pattern: PrincipalPattern::System,
                    },
                ],
            })
            .collect();
        ops.extend(SYSTEM_ONLY.iter().map(|name| PolicyOp {
            operation: Some((*name).to_string()),
            order: PolicyOrder::AllowDeny,
            requires_authentication: false,
            entries: vec![PolicyEntry {
                action: AllowDeny::Allow,
                pattern: PrincipalPattern::System,
            }],
        }));
        ops.push(PolicyOp {
            operation: None,
            order: PolicyOrder::AllowDeny,
            requires_authentication: false,
            entries: vec![PolicyEntry {
                action: AllowDeny::Allow,
                pattern: PrincipalPattern::Any,
            }],
        });

        Policy {
            name: "default".into(),
            ops,
        }
    }

    fn pattern_matches(&self, pattern: &PrincipalPattern, principal: Option<&str>, owner: &str) -> bool {
        match pattern {
            PrincipalPattern::Any => true,
            PrincipalPattern::Literal(name) => principal == Some(name.as_str()),
            PrincipalPattern::Owner => principal.is_some() && principal == Some(owner),
            PrincipalPattern::System => principal
                .map(|p| self.system_group.iter().any(|g| g == p))
                .unwrap_or(false),
            PrincipalPattern::Group(_group) => {
                // Group membership resolution is an external collaborator
                // (user/group resolution is an explicit non-goal); treat
                // named groups other than @SYSTEM as never-matching.
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_policy() -> Policy {
        Policy {
            name: "default".into(),
            ops: vec![
                PolicyOp {
                    operation: Some("cancel-job".into()),
                    order: PolicyOrder::AllowDeny,
                    requires_authentication: false,
                    entries: vec![
                        PolicyEntry {
                            action: AllowDeny::Allow,
                            pattern: PrincipalPattern::Owner,
                        },
                        PolicyEntry {
                            action: AllowDeny::Allow,
                            pattern: PrincipalPattern::System,
                        },
                    ],
                },
                PolicyOp {
                    operation: None,
                    order: PolicyOrder::AllowDeny,
                    requires_authentication: false,
                    entries: vec![PolicyEntry {
                        action: AllowDeny::Allow,
                        pattern: PrincipalPattern::Any,
                    }],
                },
            ],
        }
    }

    fn engine() -> PolicyEngine {
        let mut engine = PolicyEngine::new(vec!["root".into(), "lp".into()]);
        engine.add_policy(default_policy());
        engine
    }

    #[test]
    fn owner_can_cancel_own_job() {
        let engine = engine();
        let decision = engine.evaluate("default", "cancel-job", Some("alice"), "alice");
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn stranger_cannot_cancel_job() {
        let engine = engine();
        let decision = engine.evaluate("default", "cancel-job", Some("mallory"), "alice");
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn system_group_member_can_cancel_any_job() {
        let engine = engine();
        let decision = engine.evaluate("default", "cancel-job", Some("root"), "alice");
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn wildcard_operation_falls_back() {
        let engine = engine();
        let decision = engine.evaluate("default", "get-printer-attributes", Some("anyone"), "alice");
        assert_eq!(decision, Decision::Allow);
    }

    #[test]
    fn unknown_policy_fails_closed() {
        let engine = engine();
        let decision = engine.evaluate("nonexistent", "cancel-job", Some("alice"), "alice");
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn requires_authentication_rejects_anonymous() {
        let mut engine = PolicyEngine::new(vec![]);
        engine.add_policy(Policy {
            name: "secure".into(),
            ops: vec![PolicyOp {
                operation: Some("set-printer-attributes".into()),
                order: PolicyOrder::AllowDeny,
                requires_authentication: true,
                entries: vec![PolicyEntry {
                    action: AllowDeny::Allow,
                    pattern: PrincipalPattern::System,
                }],
            }],
        });
        let decision = engine.evaluate("secure", "set-printer-attributes", None, "alice");
        assert_eq!(decision, Decision::AuthRequired);
    }

    #[test]
    fn bootstrap_policy_allows_the_happy_path_without_any_authoring() {
        let mut engine = PolicyEngine::new(vec!["root".into()]);
        engine.add_policy(PolicyEngine::bootstrap_default_policy());
        assert_eq!(
            engine.evaluate("default", "print-job", Some("alice"), "alice"),
            Decision::Allow
        );
        assert_eq!(
            engine.evaluate("default", "get-printer-attributes", None, ""),
            Decision::Allow
        );
    }

    #[test]
    fn bootstrap_policy_restricts_job_mutation_to_owner_or_system() {
        let mut engine = PolicyEngine::new(vec!["root".into()]);
        engine.add_policy(PolicyEngine::bootstrap_default_policy());
        assert_eq!(
            engine.evaluate("default", "cancel-job", Some("alice"), "alice"),
            Decision::Allow
        );
        assert_eq!(
            engine.evaluate("default", "cancel-job", Some("root"), "alice"),
            Decision::Allow
        );
        assert_eq!(
            engine.evaluate("default", "cancel-job", Some("mallory"), "alice"),
            Decision::Deny
        );
    }

    #[test]
    fn bootstrap_policy_restricts_printer_administration_to_system() {
        let mut engine = PolicyEngine::new(vec!["root".into()]);
        engine.add_policy(PolicyEngine::bootstrap_default_policy());
        assert_eq!(
            engine.evaluate("default", "cups-add-modify-printer", Some("root"), ""),
            Decision::Allow
        );
        assert_eq!(
            engine.evaluate("default", "cups-add-modify-printer", Some("alice"), ""),
            Decision::Deny
        );
    }
}
