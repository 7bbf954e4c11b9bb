/// Linux implementation of [`HostNet`] over the usual tool set:
/// iproute2, ovs-vsctl/ovs-ofctl, iptables and dnsmasq.
use crate::pal::{id_from_dev_name, DnsmasqConfig, FwTable, HostNet, Netns};
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use sysinfo::SystemExt;
use tokio::sync::OnceCell;
use tracing::debug;
use vn_utils::cmd::{run_cmd, run_cmd_out, CmdError};

const VIRTUAL_NET_SYSFS: &str = "/sys/devices/virtual/net";
const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

/// iproute2 release that introduced the `ip tuntap` subcommand.
const IP_TUNTAP_MIN_VERSION: u32 = 100519;

static IPROUTE_VERSION: OnceCell<u32> = OnceCell::const_new();

#[derive(Debug, Default)]
pub struct LinuxHost;

async fn run_in_ns(netns: &Netns, cmd: &str, args: &[&str]) -> Result<()> {
    match netns.name() {
        Some(ns) => {
            let mut full = vec!["netns", "exec", ns, cmd];
            full.extend_from_slice(args);
            run_cmd("ip", full).await?;
        }
        None => run_cmd(cmd, args).await?,
    }
    Ok(())
}

async fn ip_has_tuntap() -> Result<bool> {
    let version = IPROUTE_VERSION
        .get_or_try_init(|| async {
            let out = run_cmd_out("ip", ["-V"]).await?;
            Ok::<_, Error>(parse_iproute_version(&out).unwrap_or(0))
        })
        .await?;
    Ok(*version >= IP_TUNTAP_MIN_VERSION)
}

fn parse_iproute_version(version_string: &str) -> Option<u32> {
    let suffix = version_string.split("iproute2-ss").nth(1)?;
    let digits: String = suffix.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Extract the OpenFlow port number of `dev` from `ovs-ofctl show` output.
fn parse_ovs_port_id(output: &str, dev: &str) -> Option<u32> {
    let marker = format!("({dev})");
    for line in output.lines() {
        if let Some(pos) = line.find(&marker) {
            let digits: String = line[..pos]
                .chars()
                .rev()
                .take_while(|c| c.is_ascii_digit())
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            if let Ok(id) = digits.parse() {
                return Some(id);
            }
        }
    }
    None
}

async fn resolve_host(host: &str) -> Result<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|err| Error::io(format!("resolving host {host}"), err))?;
    for addr in addrs {
        if let IpAddr::V4(ip) = addr.ip() {
            return Ok(ip);
        }
    }
    Err(Error::config(format!("host {host} has no IPv4 address")))
}

fn dnsmasq_args(config: &DnsmasqConfig) -> Vec<String> {
    let mut args = vec![
        "--strict-order".to_string(),
        "--bind-interfaces".to_string(),
        format!("--pid-file={}", config.pid_file.display()),
        "--conf-file=".to_string(),
        format!("--interface={}", config.bridge),
        "--except-interface=lo".to_string(),
        "--leasefile-ro".to_string(),
        "--dhcp-lease-max=512".to_string(),
        "--dhcp-no-override".to_string(),
        "--dhcp-host".to_string(),
        format!("{},{}", config.vm_hwaddr, config.vm_ip),
    ];
    if !config.domain_name.is_empty() {
        let first = config.domain_name.split(',').next().unwrap_or_default();
        args.push(format!("--dhcp-option=option:domain-name,{first}"));
        args.push(format!("--dhcp-option=119,{}", config.domain_name));
    }
    if !config.ntp_server.is_empty() {
        args.push(format!(
            "--dhcp-option=option:ntp-server,{}",
            config.ntp_server
        ));
    }
    if !config.dns_server.is_empty() {
        args.push(format!(
            "--dhcp-option=option:dns-server,{}",
            config.dns_server
        ));
    }
    args.push(format!("--dhcp-option=option:netmask,{}", config.netmask));
    args.push(format!("--dhcp-option=option:router,{}", config.gateway));
    args.push("-F".to_string());
    args.push(format!("{},static", config.vm_ip));
    args
}

fn ipt_args<'a>(rule: &'a str, chain: &'a str, table: FwTable, op: &'a str) -> Vec<&'a str> {
    let mut args = vec![];
    if let FwTable::Nat = table {
        args.push("-t");
        args.push("nat");
    }
    args.push(op);
    args.push(chain);
    args.extend(rule.split_whitespace());
    args
}

async fn ipt_rule_exists(rule: &str, chain: &str, table: FwTable) -> Result<bool> {
    match run_cmd("iptables", ipt_args(rule, chain, table, "-C")).await {
        Ok(()) => Ok(true),
        Err(CmdError::Failed { .. }) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl HostNet for LinuxHost {
    async fn create_tap(&self, name: &str, user: &str) -> Result<()> {
        if ip_has_tuntap().await? {
            run_cmd("ip", ["tuntap", "add", name, "mode", "tap", "user", user]).await?;
        } else {
            run_cmd("tunctl", ["-u", user, "-t", name]).await?;
        }
        Ok(())
    }

    async fn delete_tap(&self, name: &str) -> Result<()> {
        if ip_has_tuntap().await? {
            run_cmd("ip", ["tuntap", "del", name, "mode", "tap"]).await?;
        } else {
            run_cmd("tunctl", ["-d", name]).await?;
        }
        Ok(())
    }

    async fn create_veth_pair(&self, name1: &str, name2: &str) -> Result<()> {
        run_cmd(
            "ip",
            ["link", "add", name1, "type", "veth", "peer", "name", name2],
        )
        .await?;
        Ok(())
    }

    async fn delete_veth(&self, name: &str, netns: &Netns) -> Result<()> {
        run_in_ns(netns, "ip", &["link", "del", name]).await
    }

    async fn dev_enable(&self, name: &str, netns: &Netns) -> Result<()> {
        run_in_ns(netns, "ip", &["link", "set", name, "up"]).await
    }

    async fn set_mtu(&self, dev: &str, mtu: u32, netns: &Netns) -> Result<()> {
        run_in_ns(netns, "ip", &["link", "set", dev, "mtu", &mtu.to_string()]).await
    }

    async fn used_dev_ids(&self, prefix: &str) -> Result<Vec<u32>> {
        let mut ids = vec![];
        let mut entries = tokio::fs::read_dir(VIRTUAL_NET_SYSFS)
            .await
            .map_err(|err| Error::io(format!("listing {VIRTUAL_NET_SYSFS}"), err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| Error::io(format!("listing {VIRTUAL_NET_SYSFS}"), err))?
        {
            if let Some(id) = id_from_dev_name(prefix, &entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn netns_add(&self, name: &str) -> Result<()> {
        run_cmd("ip", ["netns", "add", name]).await?;
        Ok(())
    }

    async fn netns_delete(&self, name: &str) -> Result<()> {
        run_cmd("ip", ["netns", "delete", name]).await?;
        Ok(())
    }

    async fn ip_add_idemp(&self, ip: Ipv4Addr, bits: u8, dev: &str, netns: &Netns) -> Result<()> {
        let net = Ipv4Net::new(ip, bits).map_err(|err| Error::config(err.to_string()))?;
        let addr = format!("{ip}/{bits}");
        let broadcast = net.broadcast().to_string();
        let result = run_in_ns(
            netns,
            "ip",
            &["addr", "add", &addr, "broadcast", &broadcast, "dev", dev],
        )
        .await;
        match result {
            Err(Error::Command(CmdError::Failed { ref stderr, .. }))
                if stderr.contains("File exists") =>
            {
                debug!("address {addr} already present on {dev}");
                Ok(())
            }
            other => other,
        }
    }

    async fn ip_route_add(&self, dest: &str, gw: Ipv4Addr, netns: &Netns) -> Result<()> {
        run_in_ns(netns, "ip", &["route", "add", dest, "via", &gw.to_string()]).await
    }

    async fn arp_add(&self, ip: Ipv4Addr, hwaddr: &str, dev: &str) -> Result<()> {
        run_cmd(
            "ip",
            [
                "neigh",
                "replace",
                &ip.to_string(),
                "lladdr",
                hwaddr,
                "nud",
                "permanent",
                "dev",
                dev,
            ],
        )
        .await?;
        Ok(())
    }

    async fn arp_del(&self, ip: Ipv4Addr, hwaddr: &str, dev: &str) -> Result<()> {
        run_cmd(
            "ip",
            [
                "neigh",
                "del",
                &ip.to_string(),
                "lladdr",
                hwaddr,
                "nud",
                "permanent",
                "dev",
                dev,
            ],
        )
        .await?;
        Ok(())
    }

    async fn host_addr(&self) -> Result<Ipv4Addr> {
        let host_name = sysinfo::System::new()
            .host_name()
            .ok_or_else(|| Error::config("cannot determine the host name"))?;
        resolve_host(&host_name).await
    }

    async fn bridge_exists(&self, name: &str) -> Result<bool> {
        let kernel_bridge = Path::new(VIRTUAL_NET_SYSFS).join(name).join("bridge");
        if kernel_bridge.exists() {
            return Ok(true);
        }
        self.ovs_bridge_exists(name).await
    }

    async fn bridge_add_port(&self, dev: &str, bridge: &str) -> Result<()> {
        run_cmd("ip", ["link", "set", dev, "master", bridge]).await?;
        Ok(())
    }

    async fn ovs_bridge_exists(&self, name: &str) -> Result<bool> {
        match run_cmd("ovs-vsctl", ["br-exists", name]).await {
            Ok(()) => Ok(true),
            Err(CmdError::Failed { code: 2, .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn ovs_add_bridge(&self, name: &str, hwaddr: Option<String>) -> Result<()> {
        let hwaddr_opt = hwaddr.map(|hwaddr| format!("other-config:hwaddr={hwaddr}"));
        let mut args = vec!["--may-exist", "add-br", name];
        if let Some(hwaddr_opt) = &hwaddr_opt {
            args.extend_from_slice(&["--", "set", "bridge", name, hwaddr_opt]);
        }
        run_cmd("ovs-vsctl", args).await?;
        // Drop the switch's default flow, packets only follow the flows
        // installed by the network types.
        self.ovs_del_flows(name, "--strict priority=0").await?;
        run_cmd("ip", ["link", "set", name, "up"]).await?;
        Ok(())
    }

    async fn ovs_del_bridge(&self, name: &str) -> Result<()> {
        run_cmd("ovs-vsctl", ["--if-exist", "del-br", name]).await?;
        Ok(())
    }

    async fn ovs_add_port(&self, dev: &str, bridge: &str) -> Result<u32> {
        run_cmd("ovs-vsctl", ["add-port", bridge, dev]).await?;
        self.ovs_port_id(dev, bridge).await
    }

    async fn ovs_del_port(&self, dev: &str, bridge: &str) -> Result<()> {
        run_cmd("ovs-vsctl", ["del-port", bridge, dev]).await?;
        Ok(())
    }

    async fn ovs_port_id(&self, dev: &str, bridge: &str) -> Result<u32> {
        let output = run_cmd_out("ovs-ofctl", ["show", bridge]).await?;
        parse_ovs_port_id(&output, dev)
            .ok_or_else(|| Error::config(format!("{dev} not found on {bridge}")))
    }

    async fn ovs_add_tunnel(
        &self,
        bridge: &str,
        name: &str,
        kind: &str,
        remote_host: &str,
        key: u32,
    ) -> Result<u32> {
        let remote_ip = resolve_host(remote_host).await?;
        let type_opt = format!("type={kind}");
        let remote_opt = format!("options:remote_ip={remote_ip}");
        let key_opt = format!("options:key={key}");
        run_cmd(
            "ovs-vsctl",
            [
                "add-port",
                bridge,
                name,
                "--",
                "set",
                "interface",
                name,
                type_opt.as_str(),
                remote_opt.as_str(),
                key_opt.as_str(),
            ],
        )
        .await?;
        self.ovs_port_id(name, bridge).await
    }

    async fn ovs_add_flow(
        &self,
        bridge: &str,
        table: u32,
        priority: u32,
        flow: &str,
    ) -> Result<()> {
        let flow = format!("table={table},priority={priority},{flow}");
        run_cmd("ovs-ofctl", ["add-flow", "-OOpenFlow13", bridge, flow.as_str()]).await?;
        Ok(())
    }

    async fn ovs_del_flows(&self, bridge: &str, flow: &str) -> Result<()> {
        let mut args = vec!["del-flows", bridge];
        args.extend(flow.split_whitespace());
        run_cmd("ovs-ofctl", args).await?;
        Ok(())
    }

    async fn ipt_append_rule_idemp(&self, rule: &str, chain: &str, table: FwTable) -> Result<()> {
        if !ipt_rule_exists(rule, chain, table).await? {
            run_cmd("iptables", ipt_args(rule, chain, table, "-A")).await?;
        }
        Ok(())
    }

    async fn ipt_delete_rule_idemp(&self, rule: &str, chain: &str, table: FwTable) -> Result<()> {
        if ipt_rule_exists(rule, chain, table).await? {
            run_cmd("iptables", ipt_args(rule, chain, table, "-D")).await?;
        }
        Ok(())
    }

    async fn ipt_set_policy(&self, chain: &str, policy: &str) -> Result<()> {
        run_cmd("iptables", ["-P", chain, policy]).await?;
        Ok(())
    }

    async fn set_ip_forward(&self, enable: bool) -> Result<()> {
        let value = if enable { "1" } else { "0" };
        tokio::fs::write(IP_FORWARD_SYSCTL, value)
            .await
            .map_err(|err| Error::io(format!("writing {IP_FORWARD_SYSCTL}"), err))
    }

    async fn dnsmasq_is_running(&self, pid_file: &Path) -> Result<bool> {
        match tokio::fs::read_to_string(pid_file).await {
            Ok(pid) => Ok(pid
                .trim()
                .parse()
                .map(vn_utils::system::is_process_running)
                .unwrap_or(false)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::io(format!("reading {}", pid_file.display()), err)),
        }
    }

    async fn start_dnsmasq(&self, config: &DnsmasqConfig) -> Result<()> {
        run_cmd("/usr/sbin/dnsmasq", dnsmasq_args(config)).await?;
        Ok(())
    }

    async fn stop_dnsmasq(&self, pid_file: &Path) -> Result<()> {
        match tokio::fs::read_to_string(pid_file).await {
            Ok(pid) => {
                if let Ok(pid) = pid.trim().parse() {
                    vn_utils::system::signal_process(pid, sysinfo::Signal::Term);
                }
                tokio::fs::remove_file(pid_file)
                    .await
                    .map_err(|err| Error::io(format!("removing {}", pid_file.display()), err))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(format!("reading {}", pid_file.display()), err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iproute_version() {
        assert_eq!(
            Some(180129),
            parse_iproute_version("ip utility, iproute2-ss180129\n")
        );
        assert_eq!(None, parse_iproute_version("ip utility, iproute2-6.1.0"));
    }

    #[test]
    fn test_parse_ovs_port_id() {
        let output = "OFPT_FEATURES_REPLY (xid=0x2): dpid:0000aabbccddeeff\n\
                      n_tables:254, n_buffers:0\n\
                       1(pvtap0): addr:aa:bb:cc:dd:ee:01\n\
                       12(htun-pvbr0-0): addr:aa:bb:cc:dd:ee:02\n\
                       LOCAL(pvbr0): addr:aa:bb:cc:dd:ee:03\n";
        assert_eq!(Some(1), parse_ovs_port_id(output, "pvtap0"));
        assert_eq!(Some(12), parse_ovs_port_id(output, "htun-pvbr0-0"));
        assert_eq!(None, parse_ovs_port_id(output, "pvtap1"));
    }

    #[test]
    fn test_ipt_args() {
        assert_eq!(
            vec!["-t", "nat", "-C", "POSTROUTING", "-s", "10.252.0.0/16", "-j", "MASQUERADE"],
            ipt_args(
                "-s 10.252.0.0/16 -j MASQUERADE",
                "POSTROUTING",
                FwTable::Nat,
                "-C"
            )
        );
        assert_eq!(
            vec!["-A", "FORWARD", "-j", "ACCEPT"],
            ipt_args("-j ACCEPT", "FORWARD", FwTable::Filter, "-A")
        );
    }

    #[test]
    fn test_dnsmasq_args() {
        let config = DnsmasqConfig {
            bridge: "natbr0".to_string(),
            pid_file: "/var/run/vnetd_dnsmasq.pid".into(),
            vm_hwaddr: "52:54:00:44:AE:5E".to_string(),
            vm_ip: "10.250.0.2".parse().unwrap(),
            netmask: "255.255.0.0".parse().unwrap(),
            gateway: "10.250.0.1".parse().unwrap(),
            domain_name: "cluster.local,vm.cluster.local".to_string(),
            dns_server: String::new(),
            ntp_server: "10.0.0.5".to_string(),
        };
        let args = dnsmasq_args(&config);
        assert!(args.contains(&"--interface=natbr0".to_string()));
        assert!(args.contains(&"52:54:00:44:AE:5E,10.250.0.2".to_string()));
        assert!(args.contains(&"--dhcp-option=option:domain-name,cluster.local".to_string()));
        assert!(args.contains(&"--dhcp-option=119,cluster.local,vm.cluster.local".to_string()));
        assert!(args.contains(&"--dhcp-option=option:ntp-server,10.0.0.5".to_string()));
        assert!(!args.iter().any(|a| a.contains("dns-server")));
        assert!(args.contains(&"--dhcp-option=option:router,10.250.0.1".to_string()));
        assert_eq!("10.250.0.2,static", args.last().unwrap());
    }
}
