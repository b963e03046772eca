//! Public error taxonomy. Configuration mistakes are rejected before any
//! stage is spawned (`ConfigError`, returned from `TopologyBuilder::build`);
//! a dead root supervisor is the one runtime condition that escapes a
//! running topology (`TopologyError::SupervisorDied`). Everything else —
//! a crashing `handle_message`, a lost subscription, a killed stage — is
//! recovered locally by a restart and never reaches this enum.

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("a topology supports exactly one producer group, got {0}")]
    MultipleProducerGroups(usize),

    #[error("topology has no producer group configured")]
    MissingProducerGroup,

    #[error("duplicate destination key '{0}'")]
    DuplicateDestinationKey(String),

    #[error("topology '{topology}' stage '{stage}' is missing required option '{option}'")]
    MissingRequiredOption {
        topology: String,
        stage: String,
        option: &'static str,
    },

    #[error("topology must declare at least one destination key")]
    EmptyDestinationKeySet,

    #[error("topology must be given a non-empty name")]
    MissingName,
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("invalid topology configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("supervisor '{supervisor}' terminated unexpectedly: {source}")]
    SupervisorDied {
        supervisor: String,
        #[source]
        source: anyhow::Error,
    },
}
