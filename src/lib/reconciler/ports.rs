use crate::lib::tasks::types::ObservedContainer;

pub const BRIDGE_NETWORK: &str = "bridge";

/// `(host_port, container_port)` of a running container.
///
/// Bridge containers carry explicit bindings: the host port is taken from
/// the bindings and the container port is the binding whose container side
/// differs from its host side. Any other network mode shares the host stack,
/// so the container reports its own port through `PORT=`.
pub fn derive_ports(observed: &ObservedContainer) -> (Option<u16>, Option<u16>) {
    if observed.network_mode.as_deref() != Some(BRIDGE_NETWORK) {
        let host_port = observed
            .env
            .iter()
            .filter_map(|var| var.strip_prefix("PORT="))
            .last()
            .and_then(|port| port.parse().ok());
        return (host_port, None);
    }

    let mut host_port = None;
    let mut container_port = None;
    for (binding, hosts) in &observed.port_bindings {
        let host = hosts.first().map(String::as_str);
        host_port = host.and_then(|port| port.parse().ok());

        let container = binding.split('/').next().unwrap_or(binding);
        if Some(container) != host {
            container_port = container.parse().ok();
        }
    }

    (host_port, container_port)
}
