use crate::batch::Batch;
use crate::cluster::{Cluster, Vm};
use crate::config::validate_hwaddr;
use crate::net::{dump_resources, ip_plus, load_resources, vm_res_label, Network};
use crate::pal::{dev_name_from_id, free_dev_id, DnsmasqConfig, Env, FwTable, Netns};
use crate::{Error, Result, KS_CLUSTER};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::warn;

pub const TYPE: &str = "nat";

const DNSMASQ_PID_FILE: &str = "/var/run/vnetd_dnsmasq.pid";

/// Outbound NAT with DHCP and optional inbound port forwarding. Every VM
/// sees the same well-known address and is masqueraded to a unique
/// per-VM address on the host bridge.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct NatSettings {
    pub nat_network: String,
    pub vm_network: String,
    pub vm_network_gw: Ipv4Addr,
    pub vm_ip: Ipv4Addr,
    pub bridge: String,
    pub tap_prefix: String,
    #[serde(default = "default_vm_hwaddr")]
    pub vm_hwaddr: String,
    #[serde(default = "default_bridge_hwaddr")]
    pub bridge_hwaddr: String,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
    #[serde(default)]
    pub domain_name: String,
    #[serde(default)]
    pub dns_server: String,
    #[serde(default)]
    pub ntp_server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_nat: Option<ReverseNatSettings>,
    #[serde(default = "default_allow_outbound")]
    pub allow_outbound: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ReverseNatSettings {
    pub vm_port: u16,
    pub min_host_port: u16,
    pub max_host_port: u16,
}

fn default_vm_hwaddr() -> String {
    "52:54:00:44:AE:5E".to_string()
}

fn default_bridge_hwaddr() -> String {
    "52:54:00:C0:C0:C0".to_string()
}

fn default_mtu() -> u32 {
    1500
}

fn default_allow_outbound() -> String {
    "all".to_string()
}

#[derive(Serialize, Deserialize, Debug)]
struct NatVmRes {
    tap_name: String,
    hwaddr: String,
    nat_ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host_port: Option<u16>,
}

type Record = BTreeMap<String, NatVmRes>;

struct FwRule {
    rule: String,
    chain: &'static str,
    table: FwTable,
}

pub struct NatNetwork {
    name: String,
    settings: NatSettings,
    nat_network: Ipv4Net,
    vm_network: Ipv4Net,
    allow_outbound: bool,
    dnsmasq_pid_file: PathBuf,
}

impl NatNetwork {
    pub fn new(name: &str, settings: NatSettings) -> Result<Self> {
        let nat_network: Ipv4Net = settings
            .nat_network
            .parse()
            .map_err(|_| Error::config(format!("bad nat-network: {}", settings.nat_network)))?;
        let vm_network: Ipv4Net = settings
            .vm_network
            .parse()
            .map_err(|_| Error::config(format!("bad vm-network: {}", settings.vm_network)))?;
        validate_hwaddr(&settings.vm_hwaddr)?;
        validate_hwaddr(&settings.bridge_hwaddr)?;
        let allow_outbound = match settings.allow_outbound.as_str() {
            "all" => true,
            "none" => false,
            other => {
                return Err(Error::config(format!(
                    "{other} is not a valid value for allow-outbound"
                )))
            }
        };
        Ok(Self {
            name: name.to_string(),
            settings,
            nat_network,
            vm_network,
            allow_outbound,
            dnsmasq_pid_file: DNSMASQ_PID_FILE.into(),
        })
    }

    fn nat_with_vm_bits(&self) -> String {
        format!("{}/{}", self.nat_network.addr(), self.vm_network.prefix_len())
    }

    /// FORWARD and MASQUERADE rules guarding the NAT range. The same
    /// strings are used to install and to delete, so the two paths
    /// cannot drift apart.
    fn firewall_rules(&self) -> Vec<FwRule> {
        let net = self.nat_with_vm_bits();
        let bridge = &self.settings.bridge;
        let outbound = if self.allow_outbound {
            format!("-s {net} -i {bridge} -j ACCEPT")
        } else {
            format!("-s {net} -i {bridge} -m state --state RELATED,ESTABLISHED -j ACCEPT")
        };
        vec![
            FwRule {
                rule: format!(
                    "-d {net} -o {bridge} -p tcp -m tcp --dport 22 -m state --state NEW -j ACCEPT"
                ),
                chain: "FORWARD",
                table: FwTable::Filter,
            },
            FwRule {
                rule: format!(
                    "-d {net} -o {bridge} -m state --state RELATED,ESTABLISHED -j ACCEPT"
                ),
                chain: "FORWARD",
                table: FwTable::Filter,
            },
            FwRule {
                rule: outbound,
                chain: "FORWARD",
                table: FwTable::Filter,
            },
            FwRule {
                rule: format!(
                    "-s {net} ! -d {net} -p tcp -j MASQUERADE --to-ports 1024-65535"
                ),
                chain: "POSTROUTING",
                table: FwTable::Nat,
            },
            FwRule {
                rule: format!(
                    "-s {net} ! -d {net} -p udp -j MASQUERADE --to-ports 1024-65535"
                ),
                chain: "POSTROUTING",
                table: FwTable::Nat,
            },
            FwRule {
                rule: format!("-s {net} ! -d {net} -j MASQUERADE"),
                chain: "POSTROUTING",
                table: FwTable::Nat,
            },
        ]
    }

    fn rnat_rule(host_ip: Ipv4Addr, host_port: u16, nat_ip: Ipv4Addr, vm_port: u16) -> String {
        format!(
            "-d {host_ip}/32 -p tcp -m tcp --dport {host_port} \
             -j DNAT --to-destination {nat_ip}:{vm_port}"
        )
    }

    fn vm_nat_ip(&self, nat_id: u32) -> Ipv4Addr {
        // first address of the range belongs to the bridge
        ip_plus(self.nat_network.addr(), nat_id + 2)
    }

    async fn alloc_vm_res(&self, env: &Env<'_>, vm: &Vm) -> Result<NatVmRes> {
        let used = env.host.used_dev_ids(&self.settings.tap_prefix).await?;
        let nat_id = free_dev_id(&used);
        let tap_name = dev_name_from_id(&self.settings.tap_prefix, nat_id);
        let vm_nat_ip = self.vm_nat_ip(nat_id);
        let bridge = &self.settings.bridge;
        let vm_ip = self.settings.vm_ip;

        env.host.create_tap(&tap_name, env.batch.batch_user()).await?;
        env.host.dev_enable(&tap_name, &Netns::root()).await?;
        env.host
            .set_mtu(&tap_name, self.settings.mtu, &Netns::root())
            .await?;
        let port_id = env.host.ovs_add_port(&tap_name, bridge).await?;

        // Rewrite outgoing packets with the VM's unique address.
        env.host
            .ovs_add_flow(
                bridge,
                0,
                1000,
                &format!(
                    "in_port={port_id},idle_timeout=0,hard_timeout=0,\
                     dl_type=0x0800,nw_src={vm_ip},actions=mod_nw_src:{vm_nat_ip},local"
                ),
            )
            .await?;
        // Rewrite incoming packets with the VM's real address.
        env.host
            .ovs_add_flow(
                bridge,
                0,
                1000,
                &format!(
                    "in_port=local,idle_timeout=0,hard_timeout=0,\
                     dl_type=0x0800,nw_dst={vm_nat_ip},actions=mod_nw_dst:{vm_ip},output:{port_id}"
                ),
            )
            .await?;
        // DHCP requests are answered by the bridge.
        env.host
            .ovs_add_flow(
                bridge,
                0,
                1000,
                &format!(
                    "in_port={port_id},idle_timeout=0,hard_timeout=0,udp,tp_dst=67,actions=local"
                ),
            )
            .await?;

        // Permanent ARP entry so packets for the unique address are
        // injected into the bridge.
        env.host
            .arp_add(vm_nat_ip, &self.settings.vm_hwaddr, bridge)
            .await?;

        let mut res = NatVmRes {
            tap_name,
            hwaddr: self.settings.vm_hwaddr.clone(),
            nat_ip: vm_nat_ip,
            host_port: None,
        };

        if let Some(rnat) = &self.settings.reverse_nat {
            let host_port = rnat.min_host_port as u32 + nat_id;
            if host_port > rnat.max_host_port as u32 {
                return Err(Error::exhausted(
                    "unable to find a free host port for reverse NAT",
                ));
            }
            let host_port = host_port as u16;
            let host_ip = env.host.host_addr().await?;
            let rule = Self::rnat_rule(host_ip, host_port, vm_nat_ip, rnat.vm_port);
            env.host
                .ipt_append_rule_idemp(&rule, "PREROUTING", FwTable::Nat)
                .await?;
            env.host
                .ipt_append_rule_idemp(&rule, "OUTPUT", FwTable::Nat)
                .await?;
            res.host_port = Some(host_port);
            env.batch
                .write_key(
                    KS_CLUSTER,
                    &format!("rnat/{}/{}", vm.rank, rnat.vm_port),
                    &host_port.to_string(),
                )
                .await?;
        }
        Ok(res)
    }

    async fn free_vm_res(&self, env: &Env<'_>, res: &NatVmRes) -> Result<()> {
        let bridge = &self.settings.bridge;
        let port_id = env.host.ovs_port_id(&res.tap_name, bridge).await?;
        env.host
            .ovs_del_flows(
                bridge,
                &format!(
                    "table=0,in_port={port_id},dl_type=0x0800,nw_src={}",
                    self.settings.vm_ip
                ),
            )
            .await?;
        env.host
            .ovs_del_flows(
                bridge,
                &format!("table=0,in_port=local,dl_type=0x0800,nw_dst={}", res.nat_ip),
            )
            .await?;
        env.host.ovs_del_port(&res.tap_name, bridge).await?;
        env.host.delete_tap(&res.tap_name).await?;
        env.host.arp_del(res.nat_ip, &res.hwaddr, bridge).await?;

        if let (Some(host_port), Some(rnat)) = (res.host_port, &self.settings.reverse_nat) {
            let host_ip = env.host.host_addr().await?;
            let rule = Self::rnat_rule(host_ip, host_port, res.nat_ip, rnat.vm_port);
            env.host
                .ipt_delete_rule_idemp(&rule, "PREROUTING", FwTable::Nat)
                .await?;
            env.host
                .ipt_delete_rule_idemp(&rule, "OUTPUT", FwTable::Nat)
                .await?;
        }
        Ok(())
    }
}

/// Host port forwarded to the given VM port, as published at alloc time.
pub async fn rnat_host_port(batch: &dyn Batch, vm_rank: u32, vm_port: u16) -> Result<Option<u16>> {
    let key = format!("rnat/{vm_rank}/{vm_port}");
    match batch.read_key(KS_CLUSTER, &key).await? {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::BadValue {
                key,
                err: format!("expected a port number, got {value:?}"),
            }),
        None => Ok(None),
    }
}

#[async_trait]
impl Network for NatNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        TYPE
    }

    async fn init_node(&self, env: &Env<'_>) -> Result<()> {
        let bridge = &self.settings.bridge;
        let existed = env.host.ovs_bridge_exists(bridge).await?;
        env.host
            .ovs_add_bridge(bridge, Some(self.settings.bridge_hwaddr.clone()))
            .await?;
        if !existed {
            // a dnsmasq left over from a previous bridge is stale
            env.host.stop_dnsmasq(&self.dnsmasq_pid_file).await?;
        }

        // Gateway address on the VM network plus a host-side address on
        // the NAT network the unique VM addresses live in.
        env.host
            .ip_add_idemp(
                self.settings.vm_network_gw,
                self.vm_network.prefix_len(),
                bridge,
                &Netns::root(),
            )
            .await?;
        let bridge_nat_ip = ip_plus(self.nat_network.addr(), 1);
        env.host
            .ip_add_idemp(bridge_nat_ip, self.vm_network.prefix_len(), bridge, &Netns::root())
            .await?;

        if !env.host.dnsmasq_is_running(&self.dnsmasq_pid_file).await? {
            env.host
                .start_dnsmasq(&DnsmasqConfig {
                    bridge: bridge.clone(),
                    pid_file: self.dnsmasq_pid_file.clone(),
                    vm_hwaddr: self.settings.vm_hwaddr.clone(),
                    vm_ip: self.settings.vm_ip,
                    netmask: self.vm_network.netmask(),
                    gateway: self.settings.vm_network_gw,
                    domain_name: self.settings.domain_name.clone(),
                    dns_server: self.settings.dns_server.clone(),
                    ntp_server: self.settings.ntp_server.clone(),
                })
                .await?;
        }

        env.host.set_ip_forward(true).await?;
        env.host.ipt_set_policy("FORWARD", "DROP").await?;
        for fw in self.firewall_rules() {
            env.host
                .ipt_append_rule_idemp(&fw.rule, fw.chain, fw.table)
                .await?;
        }

        // ARP requests for the gateway go to the bridge and only there.
        env.host
            .ovs_add_flow(
                bridge,
                0,
                1000,
                &format!(
                    "idle_timeout=0,hard_timeout=0,dl_type=0x0806,nw_dst={},actions=local",
                    self.settings.vm_network_gw
                ),
            )
            .await?;
        // ARP answers from the bridge are flooded to every port.
        env.host
            .ovs_add_flow(
                bridge,
                0,
                1000,
                &format!(
                    "in_port=local,idle_timeout=0,hard_timeout=0,\
                     dl_type=0x0806,nw_dst={},actions=flood",
                    self.settings.vm_ip
                ),
            )
            .await?;
        // So are DHCP answers.
        env.host
            .ovs_add_flow(
                bridge,
                0,
                0,
                "idle_timeout=0,hard_timeout=0,in_port=LOCAL,udp,tp_dst=68,actions=FLOOD",
            )
            .await?;
        Ok(())
    }

    async fn alloc_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()> {
        let node_rank = env.batch.node_rank();
        let mut record = Record::new();
        for vm in cluster.local_vms_on_network(&self.name, node_rank) {
            match self.alloc_vm_res(env, vm).await {
                Ok(res) => {
                    record.insert(vm_res_label(vm.rank), res);
                }
                Err(err) => {
                    // keep what we got so a later free can reclaim it
                    let _ = dump_resources(env, &self.name, &record).await;
                    return Err(err);
                }
            }
        }
        dump_resources(env, &self.name, &record).await
    }

    async fn load_node_resources(&self, env: &Env<'_>, cluster: &mut Cluster) -> Result<()> {
        let node_rank = env.batch.node_rank();
        if cluster
            .local_vms_on_network(&self.name, node_rank)
            .next()
            .is_none()
        {
            return Ok(());
        }
        let record: Record = load_resources(env, &self.name).await?;
        for vm in cluster
            .vms
            .iter_mut()
            .filter(|vm| vm.is_on_node(node_rank) && vm.uses_network(&self.name))
        {
            let res = record
                .get(&vm_res_label(vm.rank))
                .ok_or_else(|| Error::StateMissing(self.name.clone()))?;
            vm.add_eth_iface(&self.name, &res.tap_name, &res.hwaddr, res.host_port);
        }
        Ok(())
    }

    async fn free_node_resources(&self, env: &Env<'_>, cluster: &Cluster) -> Result<()> {
        let node_rank = env.batch.node_rank();
        if cluster
            .local_vms_on_network(&self.name, node_rank)
            .next()
            .is_none()
        {
            return Ok(());
        }
        let record: Record = load_resources(env, &self.name).await?;
        for vm in cluster.local_vms_on_network(&self.name, node_rank) {
            let res = record
                .get(&vm_res_label(vm.rank))
                .ok_or_else(|| Error::StateMissing(self.name.clone()))?;
            self.free_vm_res(env, res).await?;
        }
        Ok(())
    }

    async fn cleanup_node(&self, env: &Env<'_>) -> Result<()> {
        if let Err(err) = env.host.set_ip_forward(false).await {
            warn!("could not disable ip forwarding: {err}");
        }
        if let Err(err) = env.host.ipt_set_policy("FORWARD", "ACCEPT").await {
            warn!("could not reset FORWARD policy: {err}");
        }
        if let Err(err) = env.host.ovs_del_bridge(&self.settings.bridge).await {
            warn!("could not delete bridge {}: {err}", self.settings.bridge);
        }
        for fw in self.firewall_rules() {
            if let Err(err) = env
                .host
                .ipt_delete_rule_idemp(&fw.rule, fw.chain, fw.table)
                .await
            {
                warn!("could not delete firewall rule: {err}");
            }
        }
        for id in env.host.used_dev_ids(&self.settings.tap_prefix).await? {
            warn!("deleting leftover tap for {} network", self.name);
            let tap = dev_name_from_id(&self.settings.tap_prefix, id);
            if let Err(err) = env.host.delete_tap(&tap).await {
                warn!("could not delete {tap}: {err}");
            }
        }
        if let Err(err) = env.host.stop_dnsmasq(&self.dnsmasq_pid_file).await {
            warn!("could not stop dnsmasq: {err}");
        }
        Ok(())
    }
}
