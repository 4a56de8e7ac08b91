use std::fmt::{Display, Formatter};

use crate::error::{StorageError, SubnetError};
use crate::registry::{Allocation, CsvSubnetRegistry};
use crate::subnet::config::NetmaskPolicy;
use crate::subnet::{parse_subnet_with, validate_against_allocations, Subnet};

pub const OPENVPN_TUNNEL_SUBNET: &str = "openvpn_tunnel_subnet";
pub const SERVER_LOCAL_PRIVATE_SUBNET: &str = "server_local_private_subnet";

/// The two fixed, non-client allocations of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    OpenvpnTunnel,
    ServerLan,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::OpenvpnTunnel, Role::ServerLan];

    pub fn name(&self) -> &'static str {
        match self {
            Role::OpenvpnTunnel => OPENVPN_TUNNEL_SUBNET,
            Role::ServerLan => SERVER_LOCAL_PRIVATE_SUBNET,
        }
    }

    pub fn from_name(name: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|it| it.name() == name)
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct SubnetManager {
    pub registry: CsvSubnetRegistry,
    pub netmask_policy: NetmaskPolicy,
}

impl SubnetManager {
    pub fn new(registry: CsvSubnetRegistry, netmask_policy: NetmaskPolicy) -> Self {
        Self {
            registry,
            netmask_policy,
        }
    }

    /// Parses `input` and checks it against everything currently allocated.
    pub fn validate(&self, input: &str) -> Result<Subnet, SubnetError> {
        let existing = self.registry.list_all()?;
        let candidate = parse_subnet_with(input, self.netmask_policy)?;
        validate_against_allocations(candidate, &existing)
    }

    /// Validates `input` and appends it under `name`. Nothing is written
    /// when validation fails.
    pub fn allocate(&self, name: &str, input: &str) -> Result<Allocation, SubnetError> {
        let subnet = self.validate(input)?;
        self.registry.append(name, subnet)?;
        Ok(Allocation {
            name: name.to_string(),
            subnet,
        })
    }

    pub fn allocate_role(&self, role: Role, input: &str) -> Result<Allocation, SubnetError> {
        self.allocate(role.name(), input)
    }

    pub fn subnet_for_role(&self, role: Role) -> Result<Option<Subnet>, StorageError> {
        self.registry.find_by_name(role.name())
    }

    pub fn require_role(&self, role: Role) -> Result<Subnet, SubnetError> {
        self.subnet_for_role(role)?.ok_or(SubnetError::MissingRole(role))
    }

    /// Every allocation except the fixed roles, in file order.
    pub fn list_client_subnets(&self) -> Result<Vec<Allocation>, StorageError> {
        Ok(self
            .registry
            .list_all()?
            .into_iter()
            .filter(|it| Role::from_name(&it.name).is_none())
            .collect())
    }

    /// Subnet lines of the server config: the tunnel `server` directive,
    /// then a `push "route"` and a `route` for the LAN and each client.
    /// Both roles must already be allocated.
    pub fn server_directives(&self) -> Result<Vec<String>, SubnetError> {
        let tunnel = self.require_role(Role::OpenvpnTunnel)?;
        let lan = self.require_role(Role::ServerLan)?;

        let mut lines = vec![format!("server {}", tunnel.to_netmask_form())];
        let routed = std::iter::once(lan)
            .chain(self.list_client_subnets()?.into_iter().map(|it| it.subnet));
        for sn in routed {
            lines.push(format!("push \"route {}\"", sn.to_netmask_form()));
            lines.push(format!("route {}", sn.to_netmask_form()));
        }
        Ok(lines)
    }

    /// The `iroute` line for a client's config-dir entry.
    pub fn iroute_directive(&self, client: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .registry
            .find_by_name(client)?
            .map(|it| format!("iroute {}", it.to_netmask_form())))
    }
}
