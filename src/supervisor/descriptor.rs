//! Fleet declaration: service descriptors, validation, dependency ordering.

use crate::envelope::is_valid_service_name;
use crate::error::SupervisorError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_startup_delay() -> f64 {
    2.0
}

fn default_max_restarts() -> u32 {
    3
}

/// One declared service in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service name; also names its socket, pid file and log file.
    pub name: String,

    /// Executable to launch.
    pub path: PathBuf,

    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,

    /// Names of services that must be verified running first.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Whether a startup failure aborts the whole fleet.
    #[serde(default)]
    pub critical: bool,

    /// Seconds to wait after spawn before the first health probe.
    #[serde(default = "default_startup_delay")]
    pub startup_delay: f64,

    /// Automatic restarts allowed within the cooldown window.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl ServiceDescriptor {
    pub fn delay(&self) -> Duration {
        Duration::from_secs_f64(self.startup_delay.max(0.0))
    }
}

/// The whole fleet as declared in the TOML configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetConfig {
    /// Event bus namespace for the fleet.
    #[serde(default = "FleetConfig::default_namespace")]
    pub namespace: String,

    /// Shared HMAC secret; absent means the fleet runs without auth.
    #[serde(default)]
    pub shared_secret: Option<String>,

    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

impl FleetConfig {
    fn default_namespace() -> String {
        "trading".to_owned()
    }

    /// Load and validate a fleet file, layering `TRADEWIRE_` environment
    /// variables over the TOML contents.
    pub fn load(path: &Path) -> Result<Self, SupervisorError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("TRADEWIRE").separator("__"))
            .build()?;
        let fleet: FleetConfig = raw.try_deserialize()?;
        fleet.validate()?;
        Ok(fleet)
    }

    /// Validate names and dependency references.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        let mut seen = HashSet::new();
        for descriptor in &self.services {
            if !is_valid_service_name(&descriptor.name) {
                return Err(SupervisorError::InvalidServiceName(descriptor.name.clone()));
            }
            if !seen.insert(descriptor.name.as_str()) {
                return Err(SupervisorError::DuplicateService(descriptor.name.clone()));
            }
        }
        for descriptor in &self.services {
            for dependency in &descriptor.dependencies {
                if !seen.contains(dependency.as_str()) {
                    return Err(SupervisorError::UnknownDependency {
                        service: descriptor.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Depth-first topological sort of the declared services.
///
/// Returns startup order (dependencies first). A cycle aborts with an error
/// naming the cycle path; nothing may be launched after that.
pub fn topological_order(
    services: &[ServiceDescriptor],
) -> Result<Vec<String>, SupervisorError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let by_name: HashMap<&str, &ServiceDescriptor> =
        services.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut marks: HashMap<&str, Mark> = services
        .iter()
        .map(|s| (s.name.as_str(), Mark::Unvisited))
        .collect();
    let mut order = Vec::with_capacity(services.len());

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a ServiceDescriptor>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), SupervisorError> {
        // Undeclared names are caught by validation; nothing to order here.
        match marks.get(name).copied().unwrap_or(Mark::Done) {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                // Close the cycle for the error message.
                let start = stack.iter().position(|&s| s == name).unwrap_or(0);
                let mut cycle: Vec<String> =
                    stack[start..].iter().map(|s| (*s).to_owned()).collect();
                cycle.push(name.to_owned());
                return Err(SupervisorError::DependencyCycle { cycle });
            }
            Mark::Unvisited => {}
        }
        marks.insert(name, Mark::InProgress);
        stack.push(name);
        if let Some(descriptor) = by_name.get(name) {
            for dependency in &descriptor.dependencies {
                visit(dependency.as_str(), by_name, marks, stack, order)?;
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        order.push(name.to_owned());
        Ok(())
    }

    let mut stack = Vec::new();
    for descriptor in services {
        visit(
            descriptor.name.as_str(),
            &by_name,
            &mut marks,
            &mut stack,
            &mut order,
        )?;
    }
    Ok(order)
}
