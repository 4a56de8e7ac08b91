use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::{IpNetworkError, Ipv4Network};

use crate::error::SubnetError;
use crate::registry::Allocation;
use crate::subnet::config::NetmaskPolicy;

/// An IPv4 network held in network form: host bits are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet(Ipv4Network);

impl Subnet {
    /// Builds a subnet, masking off any host bits of `addr`.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, IpNetworkError> {
        let net = Ipv4Network::new(addr, prefix)?;
        Ok(Subnet(Ipv4Network::new(net.network(), prefix)?))
    }

    pub fn network(&self) -> Ipv4Addr {
        self.0.network()
    }

    pub fn prefix(&self) -> u8 {
        self.0.prefix()
    }

    pub fn netmask(&self) -> Ipv4Addr {
        self.0.mask()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        self.0.broadcast()
    }

    /// Two networks overlap iff their address ranges intersect.
    pub fn overlaps(&self, other: &Subnet) -> bool {
        let (a_start, a_end) = self.range();
        let (b_start, b_end) = other.range();
        a_start <= b_end && b_start <= a_end
    }

    /// `"10.8.0.0 255.255.255.0"`, the form OpenVPN `route`/`iroute` take.
    pub fn to_netmask_form(&self) -> String {
        format!("{} {}", self.network(), self.netmask())
    }

    fn range(&self) -> (u32, u32) {
        (u32::from(self.network()), u32::from(self.broadcast()))
    }
}

impl Display for Subnet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix())
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_subnet(s)
    }
}

/// Parses `"<ip>/<prefix>"` or `"<ip> <netmask>"` with the default
/// (strict) netmask policy.
pub fn parse_subnet(input: &str) -> Result<Subnet, SubnetError> {
    parse_subnet_with(input, NetmaskPolicy::default())
}

/// Parses subnet text into a normalized [`Subnet`].
///
/// Accepted forms:
/// - `10.8.0.0/24`
/// - `10.8.0.0/255.255.255.0` or `10.8.0.0/0.0.0.255` (hostmask)
/// - `10.8.0.0 255.255.255.0`
/// - `10.8.0.1` (a single host, `/32`)
///
/// Host bits are masked off, so `10.8.0.5/24` yields `10.8.0.0/24`.
/// A whitespace-separated netmask goes through [`netmask_to_prefix`] with
/// `policy`. A dotted mask after the slash must be a contiguous netmask or
/// hostmask whatever the policy.
pub fn parse_subnet_with(input: &str, policy: NetmaskPolicy) -> Result<Subnet, SubnetError> {
    let parts = input.split_whitespace().collect::<Vec<_>>();
    let (address, prefix) = match parts.as_slice() {
        [] => return Err(SubnetError::invalid(input, "empty subnet")),
        [cidr] => match cidr.split_once('/') {
            Some((address, suffix)) => (address, parse_prefix(input, suffix)?),
            None => (*cidr, 32),
        },
        [address, netmask] => {
            if address.contains('/') {
                return Err(SubnetError::invalid(
                    input,
                    "address followed by a netmask must not carry a prefix length",
                ));
            }
            (*address, parse_netmask(input, netmask, policy)?)
        }
        _ => {
            return Err(SubnetError::invalid(
                input,
                "expected `<address>/<prefix>` or `<address> <netmask>`",
            ))
        }
    };
    let address = address
        .parse::<Ipv4Addr>()
        .map_err(|_| SubnetError::invalid(input, format!("invalid IPv4 address: {}", address)))?;
    Subnet::new(address, prefix).map_err(|e| SubnetError::invalid(input, e.to_string()))
}

fn parse_prefix(input: &str, suffix: &str) -> Result<u8, SubnetError> {
    if suffix.contains('.') {
        return parse_slash_mask(input, suffix);
    }
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SubnetError::invalid(
            input,
            format!("invalid prefix length: {:?}", suffix),
        ));
    }
    match suffix.parse::<u8>() {
        Ok(prefix) if prefix <= 32 => Ok(prefix),
        _ => Err(SubnetError::invalid(
            input,
            format!("prefix length {} is not between 0 and 32", suffix),
        )),
    }
}

fn parse_netmask(input: &str, netmask: &str, policy: NetmaskPolicy) -> Result<u8, SubnetError> {
    let mask = netmask
        .parse::<Ipv4Addr>()
        .map_err(|_| SubnetError::invalid(input, format!("invalid netmask: {}", netmask)))?;
    netmask_to_prefix(mask, policy).ok_or_else(|| {
        SubnetError::invalid(input, format!("non-contiguous netmask: {}", netmask))
    })
}

// after a slash a dotted value is a netmask or a hostmask, never popcounted
fn parse_slash_mask(input: &str, mask: &str) -> Result<u8, SubnetError> {
    let bits = mask
        .parse::<Ipv4Addr>()
        .map(u32::from)
        .map_err(|_| SubnetError::invalid(input, format!("invalid netmask: {}", mask)))?;
    netmask_to_prefix(Ipv4Addr::from(bits), NetmaskPolicy::Strict)
        .or_else(|| netmask_to_prefix(Ipv4Addr::from(!bits), NetmaskPolicy::Strict))
        .ok_or_else(|| {
            SubnetError::invalid(input, format!("invalid netmask or hostmask: {}", mask))
        })
}

/// Converts a dotted netmask to a prefix length by counting its set bits.
///
/// Under [`NetmaskPolicy::Strict`] the set bits must be contiguous from the
/// top, otherwise `None` is returned. [`NetmaskPolicy::Permissive`] takes
/// the bit count as-is, so `255.0.255.0` becomes `/16`.
pub fn netmask_to_prefix(mask: Ipv4Addr, policy: NetmaskPolicy) -> Option<u8> {
    let bits = u32::from(mask);
    let ones = bits.count_ones();
    match policy {
        NetmaskPolicy::Strict if bits.leading_ones() != ones => None,
        _ => Some(ones as u8),
    }
}

/// Checks `candidate` against `existing` in order, failing on the first
/// overlap. Returns the candidate unchanged on success.
pub fn validate_against<'a, I>(candidate: Subnet, existing: I) -> Result<Subnet, SubnetError>
where
    I: IntoIterator<Item = &'a Subnet>,
{
    match existing.into_iter().find(|it| candidate.overlaps(it)) {
        Some(conflict) => Err(SubnetError::Overlap {
            candidate,
            existing: *conflict,
            name: None,
        }),
        None => Ok(candidate),
    }
}

/// Like [`validate_against`], but reports the name of the conflicting
/// allocation.
pub fn validate_against_allocations(
    candidate: Subnet,
    allocations: &[Allocation],
) -> Result<Subnet, SubnetError> {
    validate_against(candidate, allocations.iter().map(|it| &it.subnet)).map_err(|e| match e {
        SubnetError::Overlap {
            candidate,
            existing,
            ..
        } => SubnetError::Overlap {
            candidate,
            existing,
            name: allocations
                .iter()
                .find(|it| it.subnet == existing)
                .map(|it| it.name.clone()),
        },
        e => e,
    })
}
