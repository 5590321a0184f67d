//! Linux interface provider
//!
//! `/dev/net/tun` + `TUNSETIFF`, configured with `ip`:
//!
//! ```text
//! priority 2625  uidrange U-U        lookup main    (disallowed apps)
//! priority 2626  not fwmark 2626     lookup 2626    (everything else)
//! table 2626     0.0.0.0/1, 128.0.0.0/1 dev v2tun0
//! ```
//!
//! Sockets marked with [`BYPASS_MARK`] skip the tunnel table. The provider
//! reports that mark through `socket_mark`, and the session stamps it into
//! every engine outbound as `streamSettings.sockopt.mark` so upstream traffic
//! never loops back into the tunnel.

use crate::interface::{InterfaceError, InterfaceProvider, TunInterface};
use crate::route::{Route, RoutePlan};
use nix::sys::socket::{setsockopt, sockopt};
use nix::unistd::User;
use std::fs::OpenOptions;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::process::Command;
use tracing::{debug, info, warn};

/// Routing table holding the tunnel routes
pub const ROUTE_TABLE: u32 = 2626;

/// Firewall mark of protected sockets
pub const BYPASS_MARK: u32 = 2626;

const TUNNEL_RULE_PRIORITY: u32 = 2626;
const EXCLUDE_RULE_PRIORITY: u32 = 2625;

const IFF_TUN: i16 = 0x0001;
const IFF_NO_PI: i16 = 0x1000;
const IFNAMSIZ: usize = 16;

/// `struct ifreq` as read by `TUNSETIFF`
#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: i16,
    _pad: [u8; 22],
}

impl IfReq {
    fn tun(name: &str) -> Result<Self, InterfaceError> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= IFNAMSIZ {
            return Err(InterfaceError::Unavailable(format!(
                "interface name {:?} must be 1-15 bytes",
                name
            )));
        }
        let mut req = IfReq {
            name: [0; IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        req.name[..bytes.len()].copy_from_slice(bytes);
        Ok(req)
    }

    fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

nix::ioctl_write_ptr_bad!(tun_set_iff, 0x400454ca, IfReq);

type IpArgs = Vec<String>;

/// Creates TUN devices and policy routing for sessions.
#[derive(Debug, Clone)]
pub struct LinuxTunProvider {
    name: String,
    table: u32,
    mark: u32,
}

impl LinuxTunProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: ROUTE_TABLE,
            mark: BYPASS_MARK,
        }
    }

    fn open_device(&self) -> Result<(OwnedFd, String), InterfaceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    InterfaceError::PermissionDenied(format!("/dev/net/tun: {}", e))
                }
                _ => InterfaceError::Unavailable(format!("/dev/net/tun: {}", e)),
            })?;

        let req = IfReq::tun(&self.name)?;
        // SAFETY: `req` is a fully initialized ifreq and outlives the call
        unsafe { tun_set_iff(file.as_raw_fd(), &req) }.map_err(|errno| match errno {
            nix::errno::Errno::EPERM | nix::errno::Errno::EACCES => {
                InterfaceError::PermissionDenied(format!("TUNSETIFF: {}", errno))
            }
            _ => InterfaceError::Unavailable(format!("TUNSETIFF {}: {}", self.name, errno)),
        })?;

        Ok((file.into(), req.name()))
    }
}

impl InterfaceProvider for LinuxTunProvider {
    fn establish(&self, plan: &RoutePlan) -> Result<TunInterface, InterfaceError> {
        let (fd, name) = self.open_device()?;
        let uids = resolve_uids(plan.disallowed_apps.iter().map(String::as_str));
        let (setup, undo) = setup_commands(&name, plan, self.table, self.mark, &uids);

        for args in &setup {
            if let Err(e) = run_ip(args) {
                undo.iter().for_each(|args| run_ip_quiet(args));
                return Err(e);
            }
        }

        if !plan.dns_servers.is_empty() {
            apply_dns(&name, &plan.dns_servers);
        }

        info!(
            name = %name,
            routes = plan.routes.len(),
            excluded_uids = uids.len(),
            "interface established for {}",
            plan.session_name
        );

        Ok(TunInterface::new(name, fd).with_teardown(move || {
            undo.iter().for_each(|args| run_ip_quiet(args));
        }))
    }

    fn protect(&self, fd: BorrowedFd<'_>) -> Result<(), InterfaceError> {
        setsockopt(&fd, sockopt::Mark, &self.mark).map_err(|errno| match errno {
            nix::errno::Errno::EPERM => InterfaceError::PermissionDenied(format!("SO_MARK: {}", errno)),
            _ => InterfaceError::Io(errno.into()),
        })
    }

    fn socket_mark(&self) -> Option<u32> {
        Some(self.mark)
    }
}

/// `ip` invocations that configure `name`, and those that undo the rules.
///
/// Routes and addresses disappear with the device; only rules need undoing.
fn setup_commands(
    name: &str,
    plan: &RoutePlan,
    table: u32,
    mark: u32,
    uids: &[u32],
) -> (Vec<IpArgs>, Vec<IpArgs>) {
    let args = |parts: &[&str]| -> IpArgs { parts.iter().map(|s| s.to_string()).collect() };
    let table = table.to_string();
    let mark = mark.to_string();

    let mut setup = vec![
        args(&["link", "set", "dev", name, "mtu", &plan.mtu.to_string()]),
        args(&["addr", "add", &format!("{}/{}", plan.address, plan.prefix_len), "dev", name]),
        args(&["link", "set", "dev", name, "up"]),
    ];
    let mut undo = Vec::new();

    let routes: Vec<Route> = plan.routes.iter().flat_map(split_default).collect();
    for route in &routes {
        setup.push(args(&[
            family(route.network),
            "route",
            "replace",
            &route.to_string(),
            "dev",
            name,
            "table",
            &table,
        ]));
    }

    let mut families: Vec<&str> = routes.iter().map(|r| family(r.network)).collect();
    families.sort_unstable();
    families.dedup();

    for &fam in &families {
        for uid in uids {
            let range = format!("{}-{}", uid, uid);
            let rule = |op| {
                args(&[
                    fam, "rule", op, "uidrange", &range, "lookup", "main",
                    "priority", &EXCLUDE_RULE_PRIORITY.to_string(),
                ])
            };
            setup.push(rule("add"));
            undo.push(rule("del"));
        }

        let rule = |op| {
            args(&[
                fam, "rule", op, "not", "fwmark", &mark, "lookup", &table,
                "priority", &TUNNEL_RULE_PRIORITY.to_string(),
            ])
        };
        setup.push(rule("add"));
        undo.push(rule("del"));
    }

    (setup, undo)
}

/// A default route becomes two halves, so it beats the main table's default
/// without replacing it.
fn split_default(route: &Route) -> Vec<Route> {
    if !route.is_default() {
        return vec![*route];
    }
    let halves: [IpAddr; 2] = match route.network {
        IpAddr::V4(_) => [Ipv4Addr::new(0, 0, 0, 0).into(), Ipv4Addr::new(128, 0, 0, 0).into()],
        IpAddr::V6(_) => [Ipv6Addr::UNSPECIFIED.into(), Ipv6Addr::new(0x8000, 0, 0, 0, 0, 0, 0, 0).into()],
    };
    halves
        .into_iter()
        .map(|network| Route { network, prefix_len: 1 })
        .collect()
}

fn family(ip: IpAddr) -> &'static str {
    if ip.is_ipv4() { "-4" } else { "-6" }
}

/// Map application identifiers to uids: numeric uids or user names.
///
/// Unknown identifiers are skipped.
fn resolve_uids<'a>(apps: impl Iterator<Item = &'a str>) -> Vec<u32> {
    let mut uids = Vec::new();
    for app in apps {
        let uid = match app.parse::<u32>() {
            Ok(uid) => Some(uid),
            Err(_) => match User::from_name(app) {
                Ok(Some(user)) => Some(user.uid.as_raw()),
                Ok(None) => None,
                Err(e) => {
                    debug!("user lookup for {} failed: {}", app, e);
                    None
                }
            },
        };
        match uid {
            Some(uid) if !uids.contains(&uid) => uids.push(uid),
            Some(_) => {}
            None => warn!("Skipping disallowed app {}: no such user", app),
        }
    }
    uids
}

fn run_ip(args: &[String]) -> Result<(), InterfaceError> {
    debug!(cmd = %args.join(" "), "ip");
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| InterfaceError::Unavailable(format!("failed to run ip: {}", e)))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = format!("ip {} failed: {}", args.join(" "), stderr);
    if stderr.contains("Operation not permitted") {
        Err(InterfaceError::PermissionDenied(message))
    } else {
        Err(InterfaceError::Unavailable(message))
    }
}

fn run_ip_quiet(args: &[String]) {
    if let Err(e) = run_ip(args) {
        debug!("cleanup: {}", e);
    }
}

/// Best effort: hosts without systemd-resolved keep their resolver.
fn apply_dns(name: &str, servers: &[IpAddr]) {
    let servers: Vec<String> = servers.iter().map(ToString::to_string).collect();
    match Command::new("resolvectl").arg("dns").arg(name).args(&servers).output() {
        Ok(output) if output.status.success() => {
            info!(name, "DNS servers set: {}", servers.join(", "));
        }
        Ok(output) => warn!(
            "resolvectl dns {} failed: {}",
            name,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => warn!("resolvectl unavailable, DNS left unchanged: {}", e),
    }
}
