//! Convergence driver: resolve, derive, then materialize.
//!
//! A run walks `Idle → ResolvingCredentials → Deriving → Materializing →
//! Converged`, or drops into `Failed` on the first error. Nothing is retried;
//! every step is idempotent, so running again is the recovery path.
//!
//! The driver does not lock. Callers serialize runs against the same
//! configuration directory (see [`crate::lock::ConvergeLock`]).

use crate::credentials::{ConfigSelector, CredentialError, CredentialSource};
use crate::materializer::{
    materialize, FileArtifact, MaterializationReport, MaterializeError, Ownership,
};
use crate::settings::{self, DeclaredSettings, EnvironmentMapping, HostOverride, SettingsError};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// Name of the directory holding one file per environment variable.
const ENV_DIR: &str = "env";

/// Label used for the legacy boto config artifact.
const LEGACY_CONFIG_LABEL: &str = "boto config";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergeState {
    Idle,
    ResolvingCredentials,
    Deriving,
    Materializing,
    Converged,
    Failed,
}

impl ConvergeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Converged | Self::Failed)
    }
}

impl fmt::Display for ConvergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::ResolvingCredentials => "resolving credentials",
            Self::Deriving => "deriving settings",
            Self::Materializing => "materializing",
            Self::Converged => "converged",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Materialize(#[from] MaterializeError),
}

impl ConvergeError {
    /// State the run was in when it failed.
    pub fn state(&self) -> ConvergeState {
        match self {
            Self::Credentials(_) => ConvergeState::ResolvingCredentials,
            Self::Settings(_) => ConvergeState::Deriving,
            Self::Materialize(_) => ConvergeState::Materializing,
        }
    }
}

/// Where artifacts go and who owns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Configuration root, e.g. `/etc/wal-e.d`.
    pub config_dir: PathBuf,
    /// Deprecated boto config, e.g. `/etc/boto.cfg`.
    pub legacy_config_path: PathBuf,
    /// Owner, group and mode shared by every artifact.
    pub ownership: Ownership,
}

impl Layout {
    pub fn env_dir(&self) -> PathBuf {
        self.config_dir.join(ENV_DIR)
    }

    /// Build the ordered artifact sequence for one run.
    ///
    /// Directories come first, then one file per variable, then the legacy
    /// boto config: rendered when a host override is set, removed otherwise.
    pub fn build_plan(
        &self,
        env: &EnvironmentMapping,
        host_override: Option<&HostOverride>,
    ) -> Vec<FileArtifact> {
        let env_dir = self.env_dir();
        let mut plan = Vec::with_capacity(env.len() + 3);

        plan.push(FileArtifact::directory(&self.config_dir, self.ownership.clone()));
        plan.push(FileArtifact::directory(&env_dir, self.ownership.clone()));

        for (name, value) in env.iter() {
            plan.push(FileArtifact::file(
                env_dir.join(name),
                name,
                self.ownership.clone(),
                value.as_bytes().to_vec(),
            ));
        }

        plan.push(match host_override {
            Some(host) => FileArtifact::file(
                &self.legacy_config_path,
                LEGACY_CONFIG_LABEL,
                self.ownership.clone(),
                host.render().into_bytes(),
            ),
            None => FileArtifact::absent(&self.legacy_config_path, LEGACY_CONFIG_LABEL),
        });

        plan
    }
}

/// Runs convergence against one [`CredentialSource`] and [`Layout`].
pub struct ConvergenceDriver<'a> {
    source: &'a CredentialSource,
    layout: Layout,
    state: ConvergeState,
}

impl<'a> ConvergenceDriver<'a> {
    pub fn new(source: &'a CredentialSource, layout: Layout) -> Self {
        Self {
            source,
            layout,
            state: ConvergeState::Idle,
        }
    }

    pub fn state(&self) -> ConvergeState {
        self.state
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Resolve and derive, returning the artifacts a run would apply.
    ///
    /// Nothing is written and the driver state is left untouched.
    pub fn plan(
        &self,
        selector: &ConfigSelector,
        declared: &DeclaredSettings,
    ) -> Result<Vec<FileArtifact>, ConvergeError> {
        let record = self.source.resolve(selector)?;
        let (env, host_override) = settings::derive(&record, declared)?;
        Ok(self.layout.build_plan(&env, host_override.as_ref()))
    }

    /// Run one convergence.
    ///
    /// A driver left in a terminal state starts over from `Idle`.
    ///
    /// # Errors
    ///
    /// Returns the first resolution, derivation or materialization error.
    /// Resolution and derivation errors abort before anything is written.
    #[instrument(skip_all, fields(config_dir = %self.layout.config_dir.display()))]
    pub fn run(
        &mut self,
        selector: &ConfigSelector,
        declared: &DeclaredSettings,
    ) -> Result<MaterializationReport, ConvergeError> {
        if self.state.is_terminal() {
            self.enter(ConvergeState::Idle);
        }

        let result = self.converge(selector, declared);

        match &result {
            Ok(report) => {
                self.enter(ConvergeState::Converged);
                info!(changed = report.changed(), "converged");
            }
            Err(e) => {
                error!(state = %e.state(), error = %e, "convergence failed");
                self.enter(ConvergeState::Failed);
            }
        }

        result
    }

    fn converge(
        &mut self,
        selector: &ConfigSelector,
        declared: &DeclaredSettings,
    ) -> Result<MaterializationReport, ConvergeError> {
        self.enter(ConvergeState::ResolvingCredentials);
        let record = self.source.resolve(selector)?;

        self.enter(ConvergeState::Deriving);
        let (env, host_override) = settings::derive(&record, declared)?;
        drop(record);

        self.enter(ConvergeState::Materializing);
        let plan = self.layout.build_plan(&env, host_override.as_ref());
        Ok(materialize(&plan)?)
    }

    fn enter(&mut self, next: ConvergeState) {
        debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
    }
}
