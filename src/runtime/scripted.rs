//! Scripted runtime for supervisor and orchestrator tests

use super::{LaunchSpec, Runtime, ServiceProcess};
use crate::compose::config::CommandSpec;
use crate::error::{Result, WardenError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How probes of a service behave
#[derive(Debug, Clone, Copy)]
pub enum ProbeScript {
    /// Every probe succeeds
    Healthy,
    /// Every probe fails
    Failing,
    /// The first `n` probes fail, then they succeed
    HealthyAfter(u32),
    /// Probes never return
    Hang,
}

/// Behaviour of one service
#[derive(Debug, Clone)]
pub struct ServiceScript {
    /// Number of initial spawns that fail
    pub spawn_failures: u32,
    /// Exit with this code after this long; `None` runs until terminated
    pub exit_after: Option<(Duration, i32)>,
    /// Probe behaviour
    pub probe: ProbeScript,
}

impl Default for ServiceScript {
    fn default() -> Self {
        Self {
            spawn_failures: 0,
            exit_after: None,
            probe: ProbeScript::Healthy,
        }
    }
}

#[derive(Debug, Default)]
struct Journal {
    spawns: Vec<String>,
    probes: HashMap<String, u32>,
    terminations: Vec<String>,
    spawn_attempts: HashMap<String, u32>,
}

/// Runtime whose processes follow per-service scripts
#[derive(Clone, Default)]
pub struct ScriptedRuntime {
    scripts: Arc<Mutex<HashMap<String, ServiceScript>>>,
    journal: Arc<Mutex<Journal>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, service: &str, script: ServiceScript) -> Self {
        self.scripts.lock().unwrap().insert(service.to_string(), script);
        self
    }

    /// Successful spawns, in order
    pub fn spawns(&self) -> Vec<String> {
        self.journal.lock().unwrap().spawns.clone()
    }

    /// Spawn attempts for a service, including failed ones
    pub fn spawn_attempts(&self, service: &str) -> u32 {
        self.journal
            .lock()
            .unwrap()
            .spawn_attempts
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    pub fn probes(&self, service: &str) -> u32 {
        self.journal.lock().unwrap().probes.get(service).copied().unwrap_or(0)
    }

    /// Terminated services, in order
    pub fn terminations(&self) -> Vec<String> {
        self.journal.lock().unwrap().terminations.clone()
    }

    fn script_for(&self, service: &str) -> ServiceScript {
        self.scripts
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Runtime for ScriptedRuntime {
    async fn spawn(&self, launch: &LaunchSpec) -> Result<Box<dyn ServiceProcess>> {
        let script = self.script_for(&launch.service);
        let attempt = {
            let mut journal = self.journal.lock().unwrap();
            let attempt = journal
                .spawn_attempts
                .entry(launch.service.clone())
                .or_insert(0);
            *attempt += 1;
            *attempt
        };

        if attempt <= script.spawn_failures {
            return Err(WardenError::Startup(format!(
                "scripted launch failure #{} for {}",
                attempt, launch.service
            )));
        }

        self.journal.lock().unwrap().spawns.push(launch.service.clone());
        Ok(Box::new(ScriptedProcess {
            service: launch.service.clone(),
            exit_at: script
                .exit_after
                .map(|(after, code)| (tokio::time::Instant::now() + after, code)),
            journal: self.journal.clone(),
            exit_code: None,
        }))
    }

    async fn probe(&self, launch: &LaunchSpec, _command: &CommandSpec) -> Result<bool> {
        let script = self.script_for(&launch.service);
        let count = {
            let mut journal = self.journal.lock().unwrap();
            let count = journal.probes.entry(launch.service.clone()).or_insert(0);
            *count += 1;
            *count
        };

        match script.probe {
            ProbeScript::Healthy => Ok(true),
            ProbeScript::Failing => Ok(false),
            ProbeScript::HealthyAfter(n) => Ok(count > n),
            ProbeScript::Hang => {
                std::future::pending::<()>().await;
                Ok(false)
            }
        }
    }
}

struct ScriptedProcess {
    service: String,
    exit_at: Option<(tokio::time::Instant, i32)>,
    journal: Arc<Mutex<Journal>>,
    exit_code: Option<i32>,
}

#[async_trait]
impl ServiceProcess for ScriptedProcess {
    async fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        match self.exit_at {
            Some((at, code)) => {
                tokio::time::sleep_until(at).await;
                self.exit_code = Some(code);
                Ok(code)
            }
            None => {
                std::future::pending::<()>().await;
                Ok(0)
            }
        }
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        self.journal
            .lock()
            .unwrap()
            .terminations
            .push(self.service.clone());
        self.exit_code = Some(143);
        Ok(143)
    }
}
