use crate::net::{bridged, genericpci, hostib, ib, nat, pv, Network, Networks};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// One catalog entry: a type tag plus the type-specific settings
/// mapping, validated by the type's builder.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    settings: serde_yaml::Value,
}

type Builder = fn(&str, serde_yaml::Value) -> Result<Box<dyn Network>>;

/// Startup-built table mapping a catalog `type` tag to the builder that
/// validates its settings and constructs the network object.
pub struct Registry {
    builders: BTreeMap<&'static str, Builder>,
}

impl Registry {
    /// Registry holding the six built-in network types.
    pub fn builtin() -> Self {
        let mut builders: BTreeMap<&'static str, Builder> = BTreeMap::new();
        builders.insert(bridged::TYPE, |name, settings| {
            Ok(Box::new(bridged::BridgedNetwork::new(
                name,
                from_settings(name, settings)?,
            )))
        });
        builders.insert(pv::TYPE, |name, settings| {
            Ok(Box::new(pv::PvNetwork::new(
                name,
                from_settings(name, settings)?,
            )?))
        });
        builders.insert(nat::TYPE, |name, settings| {
            Ok(Box::new(nat::NatNetwork::new(
                name,
                from_settings(name, settings)?,
            )?))
        });
        builders.insert(hostib::TYPE, |name, settings| {
            Ok(Box::new(hostib::HostIbNetwork::new(
                name,
                from_settings(name, settings)?,
            )))
        });
        builders.insert(ib::TYPE, |name, settings| {
            Ok(Box::new(ib::IbNetwork::new(
                name,
                from_settings(name, settings)?,
            )?))
        });
        builders.insert(genericpci::TYPE, |name, settings| {
            Ok(Box::new(genericpci::GenericPciNetwork::new(
                name,
                from_settings(name, settings)?,
            )))
        });
        Self { builders }
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.builders.keys().copied()
    }

    pub fn build(
        &self,
        kind: &str,
        name: &str,
        settings: serde_yaml::Value,
    ) -> Result<Box<dyn Network>> {
        let builder = self
            .builders
            .get(kind)
            .ok_or_else(|| Error::config(format!("unknown network type: {kind}")))?;
        builder(name, settings)
    }
}

fn from_settings<T: DeserializeOwned>(name: &str, settings: serde_yaml::Value) -> Result<T> {
    serde_yaml::from_value(settings).map_err(|err| {
        Error::config(format!(
            "failed to parse configuration for network {name}: {err}"
        ))
    })
}

/// Load the network catalog and instantiate one network per entry.
pub async fn load(path: &Path) -> Result<Networks> {
    load_with(&Registry::builtin(), path).await
}

pub async fn load_with(registry: &Registry, path: &Path) -> Result<Networks> {
    info!("Reading network catalog: {}", path.display());
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| Error::config(format!("cannot read {}: {err}", path.display())))?;
    parse_catalog(registry, &raw)
}

pub fn parse_catalog(registry: &Registry, yaml: &str) -> Result<Networks> {
    let catalog: BTreeMap<String, CatalogEntry> =
        serde_yaml::from_str(yaml).map_err(|err| Error::config(err.to_string()))?;
    let mut nets: BTreeMap<String, Box<dyn Network>> = BTreeMap::new();
    for (name, entry) in catalog {
        validate_net_name(&name)?;
        let net = registry.build(&entry.kind, &name, entry.settings)?;
        nets.insert(name, net);
    }
    Ok(Networks::new(nets))
}

fn validate_net_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .map_or(false, |first| first.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::config(format!("invalid network name: {name}")))
    }
}

fn is_hex_pair(group: &str) -> bool {
    group.len() == 2 && group.chars().all(|c| c.is_ascii_hexdigit())
}

/// A full 6-group MAC address.
pub(crate) fn validate_hwaddr(addr: &str) -> Result<()> {
    let groups: Vec<&str> = addr.split(':').collect();
    if groups.len() == 6 && groups.iter().all(|g| is_hex_pair(g)) {
        Ok(())
    } else {
        Err(Error::config(format!("invalid MAC address: {addr}")))
    }
}

/// A MAC prefix of one to four groups.
pub(crate) fn validate_mac_prefix(prefix: &str) -> Result<()> {
    let groups: Vec<&str> = prefix.split(':').collect();
    if (1..=4).contains(&groups.len()) && groups.iter().all(|g| is_hex_pair(g)) {
        Ok(())
    } else {
        Err(Error::config(format!("invalid MAC prefix: {prefix}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
natnet:
  type: nat
  settings:
    nat-network: 10.252.0.0/16
    vm-network: 10.250.0.0/16
    vm-network-gw: 10.250.0.1
    vm-ip: 10.250.0.2
    bridge: natbr0
    tap-prefix: nattap
pv0:
  type: pv
  settings:
    bridge-prefix: pvbr
    tap-prefix: pvtap
ext:
  type: bridged
  settings:
    host-bridge: br0
    tap-prefix: exttap
fabric:
  type: ib
  settings:
    host-device: mlx5_0
    min-pkey: "0x2000"
    max-pkey: "0x3000"
    opensm-daemon: opensm
    opensm-partition-cfg: /etc/opensm/partitions.conf
    opensm-partition-tpl: /etc/opensm/partitions.conf.tpl
hostfabric:
  type: hostib
  settings:
    host-device: mlx4_0
gpu:
  type: genericpci
  settings:
    host-device-addrs:
      - 0000:83:00.0
    host-driver: nvidia
"#;

    #[test]
    fn test_parse_full_catalog() {
        let registry = Registry::builtin();
        let nets = parse_catalog(&registry, CATALOG).unwrap();
        assert_eq!(6, nets.len());
        assert_eq!(
            vec!["ext", "fabric", "gpu", "hostfabric", "natnet", "pv0"],
            nets.names().collect::<Vec<_>>()
        );
        assert_eq!("nat", nets.get("natnet").unwrap().kind());
        assert_eq!("ib", nets.get("fabric").unwrap().kind());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let registry = Registry::builtin();
        let err = parse_catalog(&registry, "x:\n  type: frob\n  settings: {}\n").unwrap_err();
        assert!(err.to_string().contains("unknown network type"));
    }

    #[test]
    fn test_unknown_setting_names_network() {
        let registry = Registry::builtin();
        let err = parse_catalog(
            &registry,
            "ext:\n  type: bridged\n  settings:\n    host-bridge: br0\n    tap-prefix: t\n    frob: 1\n",
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("network ext"), "{message}");
    }

    #[test]
    fn test_bad_network_name() {
        let registry = Registry::builtin();
        let err = parse_catalog(
            &registry,
            "0bad:\n  type: bridged\n  settings:\n    host-bridge: br0\n    tap-prefix: t\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_hwaddr_validation() {
        assert!(validate_hwaddr("52:54:00:C0:C0:C0").is_ok());
        assert!(validate_hwaddr("52:54:00:c0:c0").is_err());
        assert!(validate_hwaddr("52:54:00:c0:c0:zz").is_err());
        assert!(validate_mac_prefix("52:54:00").is_ok());
        assert!(validate_mac_prefix("52").is_ok());
        assert!(validate_mac_prefix("52:54:00:11:22").is_err());
    }

    #[test]
    fn test_settings_round_trip_is_fixed_point() {
        let yaml = "nat-network: 10.252.0.0/16\nvm-network: 10.250.0.0/16\n\
                    vm-network-gw: 10.250.0.1\nvm-ip: 10.250.0.2\n\
                    bridge: natbr0\ntap-prefix: nattap\n";
        let settings: nat::NatSettings = serde_yaml::from_str(yaml).unwrap();
        // declared defaults fill the gaps
        assert_eq!("52:54:00:44:AE:5E", settings.vm_hwaddr);
        assert_eq!("52:54:00:C0:C0:C0", settings.bridge_hwaddr);
        assert_eq!(1500, settings.mtu);
        assert_eq!("all", settings.allow_outbound);
        assert!(settings.reverse_nat.is_none());
        // round-tripping through YAML changes nothing
        let dumped = serde_yaml::to_string(&settings).unwrap();
        let reparsed: nat::NatSettings = serde_yaml::from_str(&dumped).unwrap();
        assert_eq!(settings, reparsed);
    }
}
