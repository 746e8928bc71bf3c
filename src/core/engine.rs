use crate::config::toml_config::{LayoutConfig, SyncConfig};
use crate::core::apply::Executor;
use crate::core::diff::{PlanPolicy, Planner};
use crate::core::mapping::{ContainerStyle, Mapper};
use crate::core::scope::ScopeRules;
use crate::domain::model::{Conflict, Person, StoreOutcome, StoreReport, SyncReport};
use crate::domain::ports::{IdentityStore, RosterSource, Storage};
use crate::utils::error::{Result, SyncError};
use crate::utils::retry::RetryPolicy;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// One downstream store plus how the roster maps into it.
pub struct StoreTarget {
    pub store: Arc<dyn IdentityStore>,
    pub layout: LayoutConfig,
    pub base: String,
    pub style: ContainerStyle,
    pub scope: ScopeRules,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub dry_run: bool,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub policy: PlanPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            concurrency: 4,
            retry: RetryPolicy::default(),
            policy: PlanPolicy::default(),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            dry_run: config.dry_run(),
            concurrency: config.concurrency(),
            retry: config.retry_policy(),
            policy: config.plan_policy(),
        }
    }
}

pub struct SyncEngine<R: RosterSource, S: Storage> {
    roster: R,
    mapper: Mapper,
    targets: Vec<StoreTarget>,
    options: EngineOptions,
    reports: S,
}

impl<R: RosterSource, S: Storage> SyncEngine<R, S> {
    pub fn new(
        roster: R,
        mapper: Mapper,
        targets: Vec<StoreTarget>,
        options: EngineOptions,
        reports: S,
    ) -> Self {
        Self {
            roster,
            mapper,
            targets,
            options,
            reports,
        }
    }

    /// Loads the roster once and reconciles every store against it.
    ///
    /// A store that fails is recorded in the report; the others still run.
    pub async fn run_once(&self) -> Result<SyncReport> {
        let started_at = Utc::now();
        tracing::info!(
            "Starting sync of {} store(s){}",
            self.targets.len(),
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        let roster = self.roster.load().await?;
        let people = roster.people;
        if people.is_empty() {
            return Err(SyncError::roster(
                "SIS roster is empty; refusing to reconcile against it",
            ));
        }
        let roster_ids: HashSet<String> = people.iter().map(|p| p.external_id.clone()).collect();

        let mut stores = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let mut report = self.sync_store(target, &people, &roster_ids).await;
            report.conflicts.extend(roster.conflicts.iter().cloned());
            tracing::info!(
                "{}: {:?}, {} planned, {} applied, {} failed, {} conflicts",
                report.store,
                report.outcome,
                report.planned.values().sum::<usize>(),
                report.applied.values().sum::<usize>(),
                report.failures.len(),
                report.conflicts.len()
            );
            stores.push(report);
        }

        let report = SyncReport {
            started_at,
            finished_at: Utc::now(),
            dry_run: self.options.dry_run,
            roster_size: people.len(),
            stores,
        };
        self.write_report(&report).await?;
        Ok(report)
    }

    async fn sync_store(
        &self,
        target: &StoreTarget,
        people: &[Person],
        roster_ids: &HashSet<String>,
    ) -> StoreReport {
        let name = target.store.name().to_string();
        let (desired, mapping_conflicts) =
            self.mapper
                .desired_accounts(people, &target.layout, &target.base, target.style);

        let actual = match self
            .options
            .retry
            .run(&format!("{}: list accounts", name), || target.store.list_accounts())
            .await
        {
            Ok(accounts) => accounts,
            Err(e) => {
                tracing::error!("{}: could not list accounts: {}", name, e);
                return StoreReport::failed(&name, e.to_string());
            }
        };
        tracing::debug!("{}: {} accounts listed, {} desired", name, actual.len(), desired.len());

        let mut planner = Planner::new(&target.scope, &self.options.policy);
        if self.options.policy.manage_groups {
            match self
                .options
                .retry
                .run(&format!("{}: list groups", name), || target.store.list_groups())
                .await
            {
                Ok(groups) => planner = planner.with_groups(&groups),
                Err(e) => {
                    tracing::error!("{}: could not list groups: {}", name, e);
                    return StoreReport::failed(&name, e.to_string());
                }
            }
        }

        let mut set = planner.plan(&name, &desired, roster_ids, actual);
        let mut conflicts: Vec<Conflict> = mapping_conflicts;
        conflicts.append(&mut set.conflicts);
        for conflict in &conflicts {
            tracing::warn!(
                "{}: conflict for {}: {}",
                name,
                conflict.external_id.as_deref().unwrap_or("-"),
                conflict.reason
            );
        }

        let mut report = StoreReport {
            store: name.clone(),
            outcome: StoreOutcome::InSync,
            planned: set.counts(),
            applied: BTreeMap::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
            conflicts,
            unmanaged: set.unmanaged.len(),
            error: None,
        };

        if let Some(reason) = &set.aborted {
            report.outcome = StoreOutcome::Aborted;
            report.error = Some(
                SyncError::SafetyAbortError {
                    store: name.clone(),
                    reason: reason.clone(),
                }
                .to_string(),
            );
            return report;
        }

        if set.is_empty() {
            return report;
        }

        if self.options.dry_run {
            for change in &set.changes {
                tracing::info!("{}: would {}", name, change);
            }
            report.outcome = StoreOutcome::Planned;
            return report;
        }

        let executor = Executor::new(
            Arc::clone(&target.store),
            self.options.retry,
            self.options.concurrency,
        );
        let outcome = executor.apply(&set).await;

        for change in &outcome.applied {
            *report.applied.entry(change.kind()).or_insert(0) += 1;
        }
        report.outcome = if outcome.failures.is_empty() {
            StoreOutcome::Applied
        } else {
            StoreOutcome::PartialFailure
        };
        report.skipped = outcome.skipped;
        report.failures = outcome.failures;
        report
    }

    async fn write_report(&self, report: &SyncReport) -> Result<()> {
        let file_name = format!(
            "sync-report-{}.json",
            report.started_at.format("%Y%m%dT%H%M%SZ")
        );
        let data = serde_json::to_vec_pretty(report)?;
        self.reports.write_file(&file_name, &data).await?;
        tracing::info!("Report written to {}", file_name);
        Ok(())
    }

    /// Runs `run_once` every `interval` until Ctrl-C.
    pub async fn run_scheduled(&self, interval: Duration) -> Result<()> {
        loop {
            match self.run_once().await {
                Ok(report) if report.has_failures() => {
                    tracing::warn!("Sync finished with failures, see report");
                }
                Ok(_) => tracing::info!("Sync finished"),
                Err(e) => tracing::error!("Sync run failed: {}", e),
            }

            tracing::info!("Next sync in {:?}", interval);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, stopping scheduler");
                    return Ok(());
                }
            }
        }
    }
}
