//! Provisioning engine.
//!
//! Brings a store from empty to `Ready` in a fixed order:
//! `Uninitialized → UsersCreated → CollectionsCreated → IndexesBuilt →
//! SeedInserted → ViewsRegistered → Ready`.
//!
//! Every administrative request is idempotent: an artifact that already exists is
//! recorded as skipped. The first failing request halts the run. Nothing already
//! applied is rolled back, so a re-run resumes from where the last one stopped.

use crate::config::{Credentials, Seed};
use crate::error::{AuthFailure, ChargeDbError, Result};
use crate::index::IndexSpec;
use crate::schema::{CollectionDefinition, SchemaRegistry, ViewDefinition};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// How far provisioning has progressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProvisionState {
    Uninitialized,
    UsersCreated,
    CollectionsCreated,
    IndexesBuilt,
    SeedInserted,
    ViewsRegistered,
    Ready,
}

impl ProvisionState {
    /// The only state that may follow this one
    pub fn next(self) -> Option<ProvisionState> {
        use ProvisionState::*;
        match self {
            Uninitialized => Some(UsersCreated),
            UsersCreated => Some(CollectionsCreated),
            CollectionsCreated => Some(IndexesBuilt),
            IndexesBuilt => Some(SeedInserted),
            SeedInserted => Some(ViewsRegistered),
            ViewsRegistered => Some(Ready),
            Ready => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Uninitialized => "uninitialized",
            ProvisionState::UsersCreated => "users_created",
            ProvisionState::CollectionsCreated => "collections_created",
            ProvisionState::IndexesBuilt => "indexes_built",
            ProvisionState::SeedInserted => "seed_inserted",
            ProvisionState::ViewsRegistered => "views_registered",
            ProvisionState::Ready => "ready",
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an idempotent administrative request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    Existed,
}

/// The administrative surface of a store. Each method is one atomic request.
pub trait AdminTarget {
    /// Bind the store to a database name. Binding twice to the same name is a no-op.
    fn bind_database(&self, name: &str) -> Result<CreateOutcome>;

    /// Create a user. An existing user is `Auth { reason: AlreadyExists }`.
    fn create_user(&self, name: &str, roles: &[String], password: &str) -> Result<()>;

    fn create_collection(&self, name: &str, definition: &CollectionDefinition) -> Result<CreateOutcome>;

    /// Build an index. Same name with a different spec is `IndexConflict`.
    fn ensure_index(&self, collection: &str, spec: &IndexSpec) -> Result<CreateOutcome>;

    /// Insert a document unless one with its `_id` exists.
    fn insert_seed(&self, collection: &str, doc: &Value) -> Result<CreateOutcome>;

    fn create_view(&self, name: &str, definition: &ViewDefinition) -> Result<CreateOutcome>;

    fn database_name(&self) -> Result<Option<String>>;
    fn has_user(&self, name: &str) -> Result<bool>;
    fn has_collection(&self, name: &str) -> Result<bool>;
    fn has_index(&self, collection: &str, name: &str) -> Result<bool>;
    fn has_document(&self, collection: &str, id: &str) -> Result<bool>;
    fn has_view(&self, name: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    Skipped,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Applied => f.write_str("applied"),
            StepOutcome::Skipped => f.write_str("skipped"),
        }
    }
}

/// One administrative request and what it did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    /// The state this step works toward
    pub phase: ProvisionState,
    /// The artifact, e.g. `index charging_sessions.timestamp_1`
    pub target: String,
    pub outcome: StepOutcome,
}

impl fmt::Display for StepRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.phase, self.target, self.outcome)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub state: ProvisionState,
    pub steps: Vec<StepRecord>,
}

impl ProvisionReport {
    pub fn applied(&self) -> usize {
        self.count(StepOutcome::Applied)
    }

    pub fn skipped(&self) -> usize {
        self.count(StepOutcome::Skipped)
    }

    fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }
}

/// A provisioning run that stopped at a failing step
#[derive(Error, Debug)]
#[error("provisioning failed at {phase} on {target} (reached {reached}): {source}")]
pub struct ProvisionFailure {
    /// The last state fully reached. A re-run resumes after it.
    pub reached: ProvisionState,
    pub phase: ProvisionState,
    pub target: String,
    #[source]
    pub source: ChargeDbError,
    /// Steps completed before the failure
    pub report: ProvisionReport,
}

/// Runs the provisioning sequence for one schema profile.
pub struct Provisioner {
    registry: SchemaRegistry,
    credentials: Credentials,
    seeds: Vec<Seed>,
}

struct Run {
    state: ProvisionState,
    steps: Vec<StepRecord>,
}

impl Run {
    fn transition(&mut self, to: ProvisionState) -> Result<()> {
        if self.state.next() != Some(to) {
            return Err(ChargeDbError::Other(format!(
                "Illegal provisioning transition {} -> {to}",
                self.state
            )));
        }
        log::info!("Reached {to}");
        self.state = to;
        Ok(())
    }

    fn record(
        &mut self,
        phase: ProvisionState,
        target: String,
        result: Result<CreateOutcome>,
    ) -> std::result::Result<(), ProvisionFailure> {
        match result {
            Ok(outcome) => {
                let outcome = match outcome {
                    CreateOutcome::Created => StepOutcome::Applied,
                    CreateOutcome::Existed => StepOutcome::Skipped,
                };
                let step = StepRecord {
                    phase,
                    target,
                    outcome,
                };
                log::info!("{step}");
                self.steps.push(step);
                Ok(())
            }
            Err(source) => Err(self.fail(phase, target, source)),
        }
    }

    fn fail(&self, phase: ProvisionState, target: String, source: ChargeDbError) -> ProvisionFailure {
        log::error!("{phase}: {target} failed: {source}");
        ProvisionFailure {
            reached: self.state,
            phase,
            target,
            source,
            report: ProvisionReport {
                state: self.state,
                steps: self.steps.clone(),
            },
        }
    }
}

impl Provisioner {
    pub fn new(registry: SchemaRegistry, credentials: Credentials, seeds: Vec<Seed>) -> Self {
        Provisioner {
            registry,
            credentials,
            seeds,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Drive the target to `Ready`, stopping at the first failing step.
    pub fn run<T: AdminTarget + ?Sized>(
        &self,
        target: &T,
    ) -> std::result::Result<ProvisionReport, ProvisionFailure> {
        let mut run = Run {
            state: ProvisionState::Uninitialized,
            steps: Vec::new(),
        };

        while let Some(phase) = run.state.next() {
            match phase {
                ProvisionState::UsersCreated => self.create_users(target, &mut run)?,
                ProvisionState::CollectionsCreated => self.create_collections(target, &mut run)?,
                ProvisionState::IndexesBuilt => self.build_indexes(target, &mut run)?,
                ProvisionState::SeedInserted => self.insert_seeds(target, &mut run)?,
                ProvisionState::ViewsRegistered => self.register_views(target, &mut run)?,
                ProvisionState::Ready | ProvisionState::Uninitialized => {}
            }
            if let Err(e) = run.transition(phase) {
                return Err(run.fail(phase, phase.to_string(), e));
            }
        }

        Ok(ProvisionReport {
            state: run.state,
            steps: run.steps,
        })
    }

    fn create_users<T: AdminTarget + ?Sized>(
        &self,
        target: &T,
        run: &mut Run,
    ) -> std::result::Result<(), ProvisionFailure> {
        let phase = ProvisionState::UsersCreated;
        let database = self.registry.database();
        run.record(phase, format!("database {database}"), target.bind_database(database))?;

        for user in self.registry.users() {
            let result = match target.create_user(
                &user.name,
                &user.roles,
                self.credentials.admin_password.expose(),
            ) {
                Ok(()) => Ok(CreateOutcome::Created),
                Err(ChargeDbError::Auth {
                    reason: AuthFailure::AlreadyExists,
                    ..
                }) => Ok(CreateOutcome::Existed),
                Err(e) => Err(e),
            };
            run.record(phase, format!("user {}", user.name), result)?;
        }
        Ok(())
    }

    fn create_collections<T: AdminTarget + ?Sized>(
        &self,
        target: &T,
        run: &mut Run,
    ) -> std::result::Result<(), ProvisionFailure> {
        for entry in self.registry.entries() {
            run.record(
                ProvisionState::CollectionsCreated,
                format!("collection {}", entry.name),
                target.create_collection(&entry.name, &entry.definition),
            )?;
        }
        Ok(())
    }

    fn build_indexes<T: AdminTarget + ?Sized>(
        &self,
        target: &T,
        run: &mut Run,
    ) -> std::result::Result<(), ProvisionFailure> {
        for entry in self.registry.entries() {
            for spec in &entry.indexes {
                run.record(
                    ProvisionState::IndexesBuilt,
                    format!("index {}.{}", entry.name, spec.name),
                    target.ensure_index(&entry.name, spec),
                )?;
            }
        }
        Ok(())
    }

    fn insert_seeds<T: AdminTarget + ?Sized>(
        &self,
        target: &T,
        run: &mut Run,
    ) -> std::result::Result<(), ProvisionFailure> {
        for seed in &self.seeds {
            run.record(
                ProvisionState::SeedInserted,
                format!("seed {}/{}", seed.collection, seed.id().unwrap_or("?")),
                target.insert_seed(&seed.collection, &seed.document),
            )?;
        }
        Ok(())
    }

    fn register_views<T: AdminTarget + ?Sized>(
        &self,
        target: &T,
        run: &mut Run,
    ) -> std::result::Result<(), ProvisionFailure> {
        for view in self.registry.views() {
            run.record(
                ProvisionState::ViewsRegistered,
                format!("view {}", view.name),
                target.create_view(&view.name, &view.definition()),
            )?;
        }
        Ok(())
    }

    /// The furthest state the target has already reached. See [`inspect`].
    pub fn inspect<T: AdminTarget + ?Sized>(&self, target: &T) -> Result<ProvisionState> {
        inspect(&self.registry, &self.seeds, target)
    }
}

/// The furthest state a target has already reached, judged by which
/// artifacts exist. Needs no credentials.
pub fn inspect<T: AdminTarget + ?Sized>(
    registry: &SchemaRegistry,
    seeds: &[Seed],
    target: &T,
) -> Result<ProvisionState> {
    let mut state = ProvisionState::Uninitialized;

    if target.database_name()?.as_deref() != Some(registry.database()) {
        return Ok(state);
    }
    for user in registry.users() {
        if !target.has_user(&user.name)? {
            return Ok(state);
        }
    }
    state = ProvisionState::UsersCreated;

    for entry in registry.entries() {
        if !target.has_collection(&entry.name)? {
            return Ok(state);
        }
    }
    state = ProvisionState::CollectionsCreated;

    for entry in registry.entries() {
        for spec in &entry.indexes {
            if !target.has_index(&entry.name, &spec.name)? {
                return Ok(state);
            }
        }
    }
    state = ProvisionState::IndexesBuilt;

    for seed in seeds {
        let present = match seed.id() {
            Some(id) => target.has_document(&seed.collection, id)?,
            None => false,
        };
        if !present {
            return Ok(state);
        }
    }
    state = ProvisionState::SeedInserted;

    for view in registry.views() {
        if !target.has_view(&view.name)? {
            return Ok(state);
        }
    }
    Ok(ProvisionState::Ready)
}
