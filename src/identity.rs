//! Agent identity announced to peers.
//!
//! The agent ID is persistent: it is read from the ID file, or generated and
//! written there on first start. The instance ID changes with every run.

use std::fs;
use std::io;
use std::path::Path;

use uuid::Uuid;

use crate::config::AgentConfig;
use crate::protocol::message::Hello;

/// Groups every agent belongs to implicitly.
pub const IMPLICIT_GROUP: &str = "all";

/// Who this agent is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub agent_id: String,
    pub instance_id: String,
    pub hostname: String,
    pub groups: Vec<String>,
    pub version: String,
}

impl Identity {
    /// Resolve the identity for this run.
    pub fn load(config: &AgentConfig) -> io::Result<Self> {
        let agent_id = match &config.agent.id {
            Some(id) => id.clone(),
            None => load_or_create_agent_id(&config.agent.id_file)?,
        };

        Ok(Self {
            agent_id,
            instance_id: Uuid::new_v4().to_string(),
            hostname: hostname(),
            groups: group_set(&config.peers.groups),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// The hello message sent to peers.
    pub fn hello(&self) -> Hello {
        Hello {
            id: self.agent_id.clone(),
            instance_id: self.instance_id.clone(),
            groups: self.groups.clone(),
            hostname: self.hostname.clone(),
            version: self.version.clone(),
        }
    }
}

/// `all`, the OS name, then the configured groups, without duplicates.
pub fn group_set(configured: &[String]) -> Vec<String> {
    let mut groups = vec![IMPLICIT_GROUP.to_string(), std::env::consts::OS.to_string()];
    for group in configured {
        let group = group.trim();
        if !group.is_empty() && !groups.iter().any(|g| g == group) {
            groups.push(group.to_string());
        }
    }
    groups
}

fn load_or_create_agent_id(path: &Path) -> io::Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", id))?;
    tracing::info!(agent_id = %id, path = %path.display(), "Generated new agent ID");
    Ok(id)
}

fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "Cannot determine hostname");
            "unknown".to_string()
        }
    }
}
