/// Linux implementation of [`HostPci`]: PCI driver rebinding, SR-IOV
/// virtual function discovery and InfiniBand per-VF isolation, all
/// through sysfs.
use crate::linux_host::LinuxHost;
use crate::pal::{HostPci, VfType};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use vn_utils::cmd::run_cmd;

const PCI_DEVICES: &str = "/sys/bus/pci/devices";
const PCI_DRIVERS: &str = "/sys/bus/pci/drivers";
const INFINIBAND_CLASS: &str = "/sys/class/infiniband";
const VFIO_DRIVER: &str = "vfio-pci";
const VFIO_DEV_DIR: &str = "/dev/vfio";

/// SR-IOV semantics are keyed off the device name prefix; only the two
/// Mellanox families are understood.
pub fn device_vf_type(device: &str) -> Result<VfType> {
    if device.starts_with("mlx4") {
        Ok(VfType::Mlx4)
    } else if device.starts_with("mlx5") {
        Ok(VfType::Mlx5)
    } else {
        Err(Error::config(format!(
            "cannot determine VF type for device {device}"
        )))
    }
}

/// `0xc0cc0110...` -> `c0:cc:01:10:...`, the format the sriov sysfs
/// files expect.
pub fn guid_hex_to_col(guid: &str) -> String {
    let hex = guid.strip_prefix("0x").unwrap_or(guid);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

async fn read_sysfs(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .await
        .map_err(|err| Error::io(format!("reading {}", path.display()), err))
}

async fn write_sysfs(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value)
        .await
        .map_err(|err| Error::io(format!("writing {}", path.display()), err))
}

async fn list_dir(path: &Path) -> Result<Vec<String>> {
    let mut names = vec![];
    let mut entries = fs::read_dir(path)
        .await
        .map_err(|err| Error::io(format!("listing {}", path.display()), err))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| Error::io(format!("listing {}", path.display()), err))?
    {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

async fn link_basename(path: &Path) -> Result<String> {
    let target = fs::read_link(path)
        .await
        .map_err(|err| Error::io(format!("resolving {}", path.display()), err))?;
    Ok(target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default())
}

fn ib_device_path(device: &str) -> PathBuf {
    Path::new(INFINIBAND_CLASS).join(device)
}

/// Addresses of the virtual functions of an InfiniBand device, in
/// virtfn order.
async fn vf_addrs(device: &str) -> Result<Vec<(u32, String)>> {
    let device_path = ib_device_path(device).join("device");
    let mut vfs = vec![];
    for name in list_dir(&device_path).await? {
        if let Some(id) = name.strip_prefix("virtfn").and_then(|id| id.parse().ok()) {
            let addr = link_basename(&device_path.join(&name)).await?;
            vfs.push((id, addr));
        }
    }
    vfs.sort();
    Ok(vfs)
}

async fn vf_id_from_addr(device: &str, vf_addr: &str) -> Result<u32> {
    vf_addrs(device)
        .await?
        .into_iter()
        .find(|(_, addr)| addr == vf_addr)
        .map(|(id, _)| id)
        .ok_or_else(|| Error::config(format!("{vf_addr} is not a VF of {device}")))
}

async fn num_ports(device: &str) -> Result<usize> {
    Ok(list_dir(&ib_device_path(device).join("ports")).await?.len())
}

/// Index of the pkey table slot holding `pkey` on the physical port,
/// ignoring the full-membership bit.
async fn find_pkey_idx(device: &str, pkey: u16) -> Result<String> {
    let pkeys_path = ib_device_path(device).join("ports/1/pkeys");
    for idx in list_dir(&pkeys_path).await? {
        let raw = read_sysfs(&pkeys_path.join(&idx)).await?;
        let Ok(value) = parse_hex_or_dec(raw.trim()) else {
            continue;
        };
        if value & 0x7fff == pkey & 0x7fff {
            return Ok(idx);
        }
    }
    Err(Error::config(format!(
        "pkey {pkey:#06x} not found on device {device}"
    )))
}

fn parse_hex_or_dec(value: &str) -> std::result::Result<u16, std::num::ParseIntError> {
    match value.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    }
}

#[async_trait]
impl HostPci for LinuxHost {
    async fn enable_driver(&self, dev_addr: &str, driver: &str) -> Result<()> {
        let device_path = Path::new(PCI_DEVICES).join(dev_addr);
        let vendor = read_sysfs(&device_path.join("vendor")).await?;
        let device = read_sysfs(&device_path.join("device")).await?;
        let new_id = Path::new(PCI_DRIVERS).join(driver).join("new_id");
        write_sysfs(&new_id, &format!("{} {}", vendor.trim(), device.trim())).await
    }

    async fn vf_enable_driver(&self, device: &str, driver: &str) -> Result<()> {
        let virtfn0 = ib_device_path(device).join("device/virtfn0");
        let dev_addr = link_basename(&virtfn0).await?;
        self.enable_driver(&dev_addr, driver).await
    }

    async fn list_vfio_devices(&self) -> Result<Vec<String>> {
        let driver_dir = Path::new(PCI_DRIVERS).join(VFIO_DRIVER);
        Ok(list_dir(&driver_dir)
            .await?
            .into_iter()
            .filter(|name| name.contains(':'))
            .collect())
    }

    async fn bind_vfio(&self, dev_addr: &str, user: &str) -> Result<()> {
        let unbind = Path::new(PCI_DEVICES).join(dev_addr).join("driver/unbind");
        write_sysfs(&unbind, dev_addr).await?;
        let bind = Path::new(PCI_DRIVERS).join(VFIO_DRIVER).join("bind");
        write_sysfs(&bind, dev_addr).await?;

        let group_link = Path::new(PCI_DRIVERS)
            .join(VFIO_DRIVER)
            .join(dev_addr)
            .join("iommu_group");
        let group = link_basename(&group_link).await?;
        // char device creation may race with the chown
        tokio::time::sleep(Duration::from_millis(100)).await;
        let group_dev = format!("{VFIO_DEV_DIR}/{group}");
        run_cmd("chown", [user, group_dev.as_str()]).await?;
        Ok(())
    }

    async fn unbind_vfio(&self, dev_addr: &str, host_driver: &str) -> Result<()> {
        let unbind = Path::new(PCI_DRIVERS).join(VFIO_DRIVER).join("unbind");
        write_sysfs(&unbind, dev_addr).await?;
        let bind = Path::new(PCI_DRIVERS).join(host_driver).join("bind");
        write_sysfs(&bind, dev_addr).await
    }

    async fn find_free_vf(&self, device: &str) -> Result<String> {
        let bound = self.list_vfio_devices().await?;
        vf_addrs(device)
            .await?
            .into_iter()
            .map(|(_, addr)| addr)
            .find(|addr| !bound.contains(addr))
            .ok_or_else(|| Error::exhausted(format!("no free VF for device {device}")))
    }

    async fn cleanup_vfs(&self, device: &str) -> Result<Vec<String>> {
        let bound = self.list_vfio_devices().await?;
        let mut reclaimed = vec![];
        for (_, addr) in vf_addrs(device).await? {
            if bound.contains(&addr) {
                self.unbind_vfio(&addr, "pci-stub").await?;
                reclaimed.push(addr);
            }
        }
        Ok(reclaimed)
    }

    async fn vf_allow_host_pkeys(&self, device: &str, vf_addr: &str) -> Result<()> {
        let device_path = ib_device_path(device);
        for port in 1..=num_ports(device).await? {
            let pkeys_path = device_path.join("ports").join(port.to_string()).join("pkeys");
            let vf_idx_path = device_path
                .join("iov")
                .join(vf_addr)
                .join("ports")
                .join(port.to_string())
                .join("pkey_idx");

            // Mirror every non-zero host pkey into the VF's index table.
            let mut slot = 0;
            for pkey_idx in list_dir(&pkeys_path).await? {
                let raw = read_sysfs(&pkeys_path.join(&pkey_idx)).await?;
                let Ok(value) = parse_hex_or_dec(raw.trim()) else {
                    continue;
                };
                if value != 0 {
                    write_sysfs(&vf_idx_path.join(slot.to_string()), &pkey_idx).await?;
                    slot += 1;
                }
            }
        }
        Ok(())
    }

    async fn vf_clear_pkeys(&self, device: &str, vf_addr: &str) -> Result<()> {
        let device_path = ib_device_path(device);
        for port in 1..=num_ports(device).await? {
            let vf_idx_path = device_path
                .join("iov")
                .join(vf_addr)
                .join("ports")
                .join(port.to_string())
                .join("pkey_idx");
            for pkey_idx in list_dir(&vf_idx_path).await? {
                write_sysfs(&vf_idx_path.join(pkey_idx), "none").await?;
            }
        }
        Ok(())
    }

    async fn vf_set_pkey(&self, device: &str, vf_addr: &str, pkey: u16) -> Result<()> {
        let vf_idx_path = ib_device_path(device)
            .join("iov")
            .join(vf_addr)
            .join("ports/1/pkey_idx");
        let user_idx = find_pkey_idx(device, pkey).await?;
        write_sysfs(&vf_idx_path.join("0"), &user_idx).await?;
        let default_idx = find_pkey_idx(device, 0xffff).await?;
        write_sysfs(&vf_idx_path.join("1"), &default_idx).await
    }

    async fn vf_set_guid(
        &self,
        device: &str,
        vf_addr: &str,
        port_guid: &str,
        node_guid: &str,
    ) -> Result<()> {
        let vf_id = vf_id_from_addr(device, vf_addr).await?;
        let sriov_path = ib_device_path(device).join("device/sriov").join(vf_id.to_string());
        write_sysfs(&sriov_path.join("policy"), "Follow\n").await?;
        write_sysfs(&sriov_path.join("node"), &guid_hex_to_col(node_guid)).await?;
        write_sysfs(&sriov_path.join("port"), &guid_hex_to_col(port_guid)).await
    }

    async fn vf_unset_guid(&self, device: &str, vf_addr: &str) -> Result<()> {
        let vf_id = vf_id_from_addr(device, vf_addr).await?;
        let sriov_path = ib_device_path(device).join("device/sriov").join(vf_id.to_string());
        write_sysfs(&sriov_path.join("policy"), "Down\n").await
    }

    async fn phys_port_guid(&self, device: &str) -> Result<String> {
        let output = vn_utils::cmd::run_cmd_out("ibstat", ["-p", device]).await?;
        output
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .ok_or_else(|| Error::config(format!("ibstat reported no port GUID for {device}")))
    }
}
