/// Errors that prevent the agent from starting. Everything else in the
/// pipeline is logged and survived.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("acquiring agent IP: {0}")]
    AgentIp(String),
    #[error("loading eBPF objects: {0}")]
    BpfLoad(#[source] anyhow::Error),
    #[error("starting exporter: {0}")]
    Export(#[source] anyhow::Error),
}
