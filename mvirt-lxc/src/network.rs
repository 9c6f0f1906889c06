//! Network address resolution.
//!
//! A freshly started container needs a while before its interfaces carry
//! addresses. The resolver polls the observed interface list and matches
//! configured networks by name. An attempt either resolves every network
//! or is discarded entirely.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::NetworkPolicy;
use crate::error::{GatewayError, ResolutionError};
use crate::gateway::ContainerGateway;
use crate::retry::{Deadline, should_retry};
use crate::types::{ContainerIdentity, Interface, NetworkSpec};

pub struct AddressResolver {
    gateway: Arc<dyn ContainerGateway>,
    policy: NetworkPolicy,
}

/// Attach observed addresses to `networks`, or name the ones still missing.
pub fn correlate(
    networks: &[NetworkSpec],
    interfaces: &[Interface],
) -> Result<Vec<NetworkSpec>, Vec<String>> {
    let observed: HashMap<&str, &str> = interfaces
        .iter()
        .map(|i| (i.name.as_str(), i.ipv4.as_str()))
        .collect();

    let mut missing = Vec::new();
    let mut resolved = Vec::with_capacity(networks.len());
    for net in networks {
        match observed.get(net.name.as_str()) {
            Some(addr) if !addr.is_empty() => {
                let mut net = net.clone();
                net.computed_address = Some(addr.to_string());
                resolved.push(net);
            }
            _ => missing.push(net.name.clone()),
        }
    }

    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(missing)
    }
}

/// Every observed interface with an IPv4 address, loopback excluded.
pub fn discovered(interfaces: &[Interface]) -> Vec<NetworkSpec> {
    interfaces
        .iter()
        .filter(|i| i.name != "lo" && !i.ipv4.is_empty())
        .map(|i| NetworkSpec {
            hw_address: (!i.hwaddr.is_empty()).then(|| i.hwaddr.clone()),
            computed_address: Some(i.ipv4.clone()),
            ..NetworkSpec::named(i.name.clone())
        })
        .collect()
}

impl AddressResolver {
    pub fn new(gateway: Arc<dyn ContainerGateway>, policy: NetworkPolicy) -> Self {
        Self { gateway, policy }
    }

    /// Resolve the address of every configured network, preserving order.
    pub async fn resolve(
        &self,
        identity: &ContainerIdentity,
        networks: &[NetworkSpec],
        deadline: &Deadline,
    ) -> Result<Vec<NetworkSpec>, ResolutionError> {
        if networks.is_empty() {
            return Ok(Vec::new());
        }

        let mut attempts = 0u32;
        let mut last_error: Option<GatewayError> = None;
        let mut missing: Vec<String> = networks.iter().map(|n| n.name.clone()).collect();

        loop {
            attempts += 1;
            self.pause(identity, attempts, deadline).await?;

            match self.gateway.interfaces(identity).await {
                Ok(interfaces) => match correlate(networks, &interfaces) {
                    Ok(resolved) => {
                        info!(
                            node = %identity.node,
                            vmid = identity.id,
                            attempts,
                            "Resolved network addresses"
                        );
                        return Ok(resolved);
                    }
                    Err(names) => {
                        debug!(node = %identity.node, vmid = identity.id, missing = ?names, "Interfaces without address");
                        missing = names;
                    }
                },
                Err(e) => {
                    warn!(node = %identity.node, vmid = identity.id, attempt = attempts, error = %e, "Unable to list interfaces");
                    last_error = Some(e);
                }
            }

            if !should_retry(attempts, self.policy.attempts) {
                return Err(ResolutionError::Unresolved {
                    identity: identity.clone(),
                    attempts,
                    missing,
                    last_error,
                });
            }
        }
    }

    /// Poll the interfaces of a clone until at least one carries an address
    /// and return all of them.
    pub async fn discover(
        &self,
        identity: &ContainerIdentity,
        deadline: &Deadline,
    ) -> Result<Vec<NetworkSpec>, ResolutionError> {
        let mut attempts = 0u32;
        let mut last_error = None;

        loop {
            attempts += 1;
            self.pause(identity, attempts, deadline).await?;

            match self.gateway.interfaces(identity).await {
                Ok(interfaces) => {
                    let found = discovered(&interfaces);
                    if !found.is_empty() {
                        info!(node = %identity.node, vmid = identity.id, count = found.len(), "Discovered interfaces");
                        return Ok(found);
                    }
                }
                Err(e) => {
                    warn!(node = %identity.node, vmid = identity.id, attempt = attempts, error = %e, "Unable to list interfaces");
                    last_error = Some(e);
                }
            }

            if !should_retry(attempts, self.policy.attempts) {
                return Err(ResolutionError::Unresolved {
                    identity: identity.clone(),
                    attempts,
                    missing: vec!["any interface".to_string()],
                    last_error,
                });
            }
        }
    }

    async fn pause(
        &self,
        identity: &ContainerIdentity,
        attempt: u32,
        deadline: &Deadline,
    ) -> Result<(), ResolutionError> {
        deadline
            .sleep(self.policy.interval.delay(attempt))
            .await
            .map_err(|reason| ResolutionError::Interrupted {
                identity: identity.clone(),
                reason,
            })
    }
}
