// SPDX-License-Identifier: MIT OR Apache-2.0
//! Gateway orchestration: ties manifest resolution, the decision pipeline,
//! approvals, connectors, and the audit chain together.

use apg_approval::ApprovalService;
use apg_audit::{AuditChain, ChainReport, ExportBundle, RecordDraft};
use apg_connector::{ConnectorFactory, Invocation};
use apg_core::{
    Approval, ApprovalStatus, DecisionKind, DecisionResponse, ExecuteResponse, ExecutionResult,
    GatewayRequest, Reason, ReasonCode,
};
use apg_manifest::{ManifestError, ManifestResolver, ResolvedManifest};
use apg_policy::{Evaluation, PeekGate, PolicyContext, PolicyEngine, ReservingGate};
use apg_store::{CounterStore, RecordFilter, Store};
use apg_vault::Vault;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Gateway-side faults, mapped to HTTP 500 by the API layer.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A store, audit, or policy subsystem failed.
    #[error("gateway internal fault: {0}")]
    Internal(String),
}

impl From<apg_store::StoreError> for GatewayError {
    fn from(e: apg_store::StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<apg_audit::AuditError> for GatewayError {
    fn from(e: apg_audit::AuditError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<apg_policy::PolicyError> for GatewayError {
    fn from(e: apg_policy::PolicyError) -> Self {
        Self::Internal(e.to_string())
    }
}

/// The assembled gateway service.
pub struct Gateway {
    resolver: ManifestResolver,
    engine: PolicyEngine,
    approvals: ApprovalService,
    audit: AuditChain,
    connectors: ConnectorFactory,
    vault: Vault,
    counters: Arc<dyn CounterStore>,
    store: Arc<dyn Store>,
    request_deadline: Duration,
}

impl Gateway {
    /// Assemble the service over one store implementation.
    #[allow(clippy::too_many_arguments)]
    pub fn new<S>(
        store: Arc<S>,
        resolver: ManifestResolver,
        engine: PolicyEngine,
        approvals: ApprovalService,
        audit: AuditChain,
        connectors: ConnectorFactory,
        vault: Vault,
        request_deadline: Duration,
    ) -> Self
    where
        S: Store + 'static,
    {
        Self {
            resolver,
            engine,
            approvals,
            audit,
            connectors,
            vault,
            counters: Arc::clone(&store) as Arc<dyn CounterStore>,
            store,
            request_deadline,
        }
    }

    /// Direct store access for fixtures and admin tooling.
    #[must_use]
    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// The approval service, used by the operator endpoints.
    #[must_use]
    pub fn approvals(&self) -> &ApprovalService {
        &self.approvals
    }

    /// Drop cached manifest resolutions (after activations).
    pub async fn invalidate_manifests(&self) {
        self.resolver.invalidate().await;
    }

    async fn resolve_manifest(
        &self,
        org_id: &str,
        uapk_id: &str,
    ) -> Result<Option<Arc<ResolvedManifest>>, GatewayError> {
        match self.resolver.get_active(org_id, uapk_id).await {
            Ok(resolved) => Ok(Some(resolved)),
            Err(ManifestError::NotFound { .. }) => Ok(None),
            Err(ManifestError::Store(e)) => Err(e.into()),
        }
    }

    /// Dry run: the full pipeline with a read-only budget gate. No tool
    /// call, no approval consumption, no budget change; the decision is
    /// still appended to the audit chain.
    ///
    /// # Errors
    ///
    /// [`GatewayError`] on subsystem faults only.
    pub async fn evaluate(
        &self,
        org_id: &str,
        request: &GatewayRequest,
    ) -> Result<DecisionResponse, GatewayError> {
        let now = Utc::now();
        let manifest = self.resolve_manifest(org_id, &request.uapk_id).await?;
        let gate = PeekGate::new(Arc::clone(&self.counters));
        let evaluation = self
            .engine
            .evaluate(
                &context(org_id, request, manifest.as_deref()),
                &gate,
                now,
            )
            .await?;

        // A dry run creates nothing, but an escalation that already has a
        // live pending approval reports it for convenience.
        let approval_id = if evaluation.decision.kind == DecisionKind::Escalate {
            self.store
                .find_reusable_pending(
                    org_id,
                    &request.uapk_id,
                    &request.agent_id,
                    &evaluation.action_hash,
                    now,
                )
                .await?
                .map(|a| a.approval_id)
        } else {
            None
        };

        let record = self
            .audit
            .append(draft(
                Uuid::new_v4(),
                org_id,
                request,
                &evaluation,
                false,
                None,
                approval_id,
                now,
            ))
            .await?;

        Ok(decision_response(
            record.record_id,
            &evaluation,
            approval_id,
            manifest.as_deref(),
            now,
        ))
    }

    /// Full run: pipeline, atomic consumption, connector call, audit append.
    ///
    /// # Errors
    ///
    /// [`GatewayError`] on subsystem faults only; policy and tool outcomes
    /// are reported in the response.
    pub async fn execute(
        &self,
        org_id: &str,
        request: &GatewayRequest,
    ) -> Result<ExecuteResponse, GatewayError> {
        let now = Utc::now();
        let manifest = self.resolve_manifest(org_id, &request.uapk_id).await?;
        let gate = ReservingGate::new(Arc::clone(&self.counters));
        let mut evaluation = self
            .engine
            .evaluate(
                &context(org_id, request, manifest.as_deref()),
                &gate,
                now,
            )
            .await?;

        match evaluation.decision.kind {
            DecisionKind::Deny => {
                self.release_budget(org_id, request, &evaluation).await;
                let record = self
                    .audit
                    .append(draft(
                        Uuid::new_v4(),
                        org_id,
                        request,
                        &evaluation,
                        false,
                        None,
                        None,
                        now,
                    ))
                    .await?;
                Ok(execute_response(
                    record.record_id,
                    &evaluation,
                    None,
                    manifest.as_deref(),
                    false,
                    None,
                    now,
                ))
            }
            DecisionKind::Escalate => {
                self.release_budget(org_id, request, &evaluation).await;
                let approval = self
                    .approvals
                    .create_or_reuse(org_id, &request.uapk_id, &request.agent_id, &request.action, now)
                    .await
                    .map_err(|e| GatewayError::Internal(e.to_string()))?;
                let record = self
                    .audit
                    .append(draft(
                        Uuid::new_v4(),
                        org_id,
                        request,
                        &evaluation,
                        false,
                        None,
                        Some(approval.approval_id),
                        now,
                    ))
                    .await?;
                info!(
                    approval_id = %approval.approval_id,
                    org_id,
                    "action escalated for approval"
                );
                Ok(execute_response(
                    record.record_id,
                    &evaluation,
                    Some(approval.approval_id),
                    manifest.as_deref(),
                    false,
                    None,
                    now,
                ))
            }
            DecisionKind::Allow => {
                let record_id = Uuid::new_v4();

                // An override-driven allow must win the one-time consumption
                // before anything executes.
                if evaluation.decision.override_accepted {
                    if let Some(approval_id) = evaluation.override_approval_id {
                        let consumed = self
                            .approvals
                            .consume_if_valid(approval_id, record_id, now)
                            .await
                            .map_err(|e| GatewayError::Internal(e.to_string()))?;
                        if !consumed {
                            warn!(%approval_id, "override consumption lost the race");
                            rewrite_to_deny(&mut evaluation);
                            self.release_budget(org_id, request, &evaluation).await;
                            let record = self
                                .audit
                                .append(draft(
                                    record_id,
                                    org_id,
                                    request,
                                    &evaluation,
                                    false,
                                    None,
                                    Some(approval_id),
                                    now,
                                ))
                                .await?;
                            return Ok(execute_response(
                                record.record_id,
                                &evaluation,
                                Some(approval_id),
                                manifest.as_deref(),
                                false,
                                None,
                                now,
                            ));
                        }
                    }
                }

                let result = self.run_connector(org_id, request, manifest.as_deref()).await;
                let record = self
                    .audit
                    .append(draft(
                        record_id,
                        org_id,
                        request,
                        &evaluation,
                        true,
                        Some(result.clone()),
                        evaluation.override_approval_id,
                        now,
                    ))
                    .await?;
                Ok(execute_response(
                    record.record_id,
                    &evaluation,
                    evaluation.override_approval_id,
                    manifest.as_deref(),
                    true,
                    Some(result),
                    now,
                ))
            }
        }
    }

    /// Execute the configured connector under the request deadline.
    async fn run_connector(
        &self,
        org_id: &str,
        request: &GatewayRequest,
        manifest: Option<&ResolvedManifest>,
    ) -> ExecutionResult {
        let Some(config) = manifest
            .and_then(|m| m.manifest.content.tools.get(&request.action.tool))
        else {
            // Unreachable past stage 7; reported as a connector fault.
            return ExecutionResult::failure("CONNECTOR_FAILED", "tool configuration vanished", 0);
        };

        let secrets = match self.vault.resolve_refs(org_id, &config.secret_refs).await {
            Ok(secrets) => secrets,
            Err(e) => {
                error!(tool = %request.action.tool, "secret resolution failed: {e}");
                return ExecutionResult::failure(
                    "CONNECTOR_FAILED",
                    "secret resolution failed",
                    0,
                );
            }
        };

        let connector = self.connectors.connector(config);
        let invocation = Invocation {
            params: request.action.params.clone(),
            secrets,
        };
        match tokio::time::timeout(self.request_deadline, connector.execute(invocation)).await {
            Ok(result) => result,
            Err(_) => ExecutionResult::failure(
                "CLIENT_CANCELLED",
                "request deadline elapsed during tool call",
                u64::try_from(self.request_deadline.as_millis()).unwrap_or(u64::MAX),
            ),
        }
    }

    async fn release_budget(
        &self,
        org_id: &str,
        request: &GatewayRequest,
        evaluation: &Evaluation,
    ) {
        if !evaluation.budget_reserved {
            return;
        }
        if let Err(e) = self
            .counters
            .release_slot(org_id, &request.uapk_id, evaluation.budget_date)
            .await
        {
            error!(org_id, uapk_id = %request.uapk_id, "budget release failed: {e}");
        }
    }

    // -- read-side operations used by the API layer --

    /// List approvals for an organisation.
    ///
    /// # Errors
    ///
    /// Propagates subsystem faults.
    pub async fn list_approvals(
        &self,
        org_id: &str,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<Approval>, GatewayError> {
        self.approvals
            .list(org_id, status, Utc::now())
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    /// List interaction records with filters.
    ///
    /// # Errors
    ///
    /// Propagates subsystem faults.
    pub async fn list_records(
        &self,
        org_id: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<apg_core::InteractionRecord>, GatewayError> {
        Ok(self.store.list_records(org_id, filter).await?)
    }

    /// Verify every audit chain of an organisation.
    ///
    /// # Errors
    ///
    /// Propagates subsystem faults.
    pub async fn verify_chains(&self, org_id: &str) -> Result<Vec<ChainReport>, GatewayError> {
        Ok(self.audit.verify_all(org_id).await?)
    }

    /// Export audit records as a tar.gz bundle.
    ///
    /// # Errors
    ///
    /// Propagates subsystem faults.
    pub async fn export_audit(
        &self,
        org_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ExportBundle, GatewayError> {
        Ok(self.audit.export(org_id, from, to).await?)
    }

    /// Cheap readiness probe: one store read.
    pub async fn ready(&self) -> bool {
        self.counters
            .counter_value("readyz", "probe", Utc::now().date_naive())
            .await
            .is_ok()
    }
}

fn context<'a>(
    org_id: &'a str,
    request: &'a GatewayRequest,
    manifest: Option<&'a ResolvedManifest>,
) -> PolicyContext<'a> {
    PolicyContext {
        org_id,
        uapk_id: &request.uapk_id,
        agent_id: &request.agent_id,
        action: &request.action,
        counterparty: request.counterparty.as_ref(),
        capability_token: request.capability_token.as_deref(),
        override_token: request.override_token.as_deref(),
        manifest,
    }
}

fn rewrite_to_deny(evaluation: &mut Evaluation) {
    evaluation.decision.kind = DecisionKind::Deny;
    evaluation.decision.reasons.push(Reason::new(
        ReasonCode::OverrideTokenAlreadyUsed,
        "approval was consumed by a concurrent execution",
    ));
    evaluation.decision.override_accepted = false;
}

#[allow(clippy::too_many_arguments)]
fn draft(
    record_id: Uuid,
    org_id: &str,
    request: &GatewayRequest,
    evaluation: &Evaluation,
    executed: bool,
    result: Option<ExecutionResult>,
    approval_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> RecordDraft {
    RecordDraft {
        record_id,
        org_id: org_id.to_string(),
        uapk_id: request.uapk_id.clone(),
        agent_id: request.agent_id.clone(),
        action: request.action.clone(),
        request_hash: evaluation.action_hash.clone(),
        decision: evaluation.decision.kind,
        reasons: evaluation.decision.reasons.clone(),
        policy_trace: evaluation.decision.policy_trace.clone(),
        executed,
        result,
        approval_id,
        context: request.context.clone(),
        created_at: now,
    }
}

fn decision_response(
    interaction_id: Uuid,
    evaluation: &Evaluation,
    approval_id: Option<Uuid>,
    manifest: Option<&ResolvedManifest>,
    now: DateTime<Utc>,
) -> DecisionResponse {
    DecisionResponse {
        interaction_id,
        decision: evaluation.decision.kind,
        reasons: evaluation.decision.reasons.clone(),
        approval_id,
        policy_version: manifest.map(|m| m.content_hash.clone()).unwrap_or_default(),
        timestamp: now,
    }
}

#[allow(clippy::too_many_arguments)]
fn execute_response(
    interaction_id: Uuid,
    evaluation: &Evaluation,
    approval_id: Option<Uuid>,
    manifest: Option<&ResolvedManifest>,
    executed: bool,
    result: Option<ExecutionResult>,
    now: DateTime<Utc>,
) -> ExecuteResponse {
    ExecuteResponse {
        decision: decision_response(interaction_id, evaluation, approval_id, manifest, now),
        executed,
        result,
    }
}
