//! Network device configurators and the HTTP-serve task.
//!
//! Covers the common guest networking setups:
//!
//! - [`InterVm`] — a private network between multiple QEMU VMs over a
//!   shared unix socket.
//! - [`ipv4_host_network`] / [`ipv6_host_network`] — QEMU user-mode
//!   networking towards the host.
//! - [`serve_http`] — an HTTP server on the host whose lifetime is bound to
//!   the VM's, for guests that download from the host.
//!
//! NIC-level knobs ([`with_nic`], [`with_mac`], [`with_pcap`]) compose over
//! any of the network configurators.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::info;

use crate::error::Error;
use crate::qemu::{configurator, task, Configurator, IdAllocator};

/// The default QEMU NIC device.
pub const NIC_E1000: &str = "e1000";
/// The paravirtualized QEMU NIC device.
pub const NIC_VIRTIO_NET: &str = "virtio-net";

/// A guest interface MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mac(pub [u8; 6]);

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Per-netdev options, filled in by [`NicOpt`]s.
#[derive(Debug, Clone)]
pub struct NetOptions {
    /// The NIC device QEMU emulates.
    pub nic: String,
    /// The MAC address assigned to the guest interface.
    pub mac: Mac,
}

/// An option applied to a single network device.
pub struct NicOpt(Box<dyn FnOnce(&str, &mut IdAllocator, &mut NetOptions) -> Vec<String> + Send>);

impl NicOpt {
    fn apply(self, netdev: &str, alloc: &mut IdAllocator, opts: &mut NetOptions) -> Vec<String> {
        (self.0)(netdev, alloc, opts)
    }
}

impl fmt::Debug for NicOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NicOpt")
    }
}

/// Capture the netdev's traffic to a pcap file.
pub fn with_pcap(output_file: impl Into<String>) -> NicOpt {
    let output_file = output_file.into();
    NicOpt(Box::new(move |netdev, alloc, _opts| {
        vec![
            "-object".to_string(),
            format!(
                "filter-dump,id={},netdev={netdev},file={output_file}",
                alloc.id("filter")
            ),
        ]
    }))
}

/// Change the NIC device QEMU emulates (default [`NIC_E1000`]).
pub fn with_nic(nic: impl Into<String>) -> NicOpt {
    let nic = nic.into();
    NicOpt(Box::new(move |_netdev, _alloc, opts| {
        opts.nic = nic;
        Vec::new()
    }))
}

/// Assign a MAC address to the guest interface.
pub fn with_mac(mac: Mac) -> NicOpt {
    NicOpt(Box::new(move |_netdev, _alloc, opts| {
        opts.mac = mac;
        Vec::new()
    }))
}

// ---------------------------------------------------------------------------
// Inter-VM network
// ---------------------------------------------------------------------------

/// A private network connecting multiple QEMU VMs over a shared unix
/// socket. Closed from the world; only the participating VMs see it.
///
/// The first VM configured with [`InterVm::new_vm`] listens on the socket,
/// later ones connect to it. MAC addresses come from the
/// locally-administered `0e:00:00:00:00:<n>` range, indexed by VM ordinal.
/// Keep the `InterVm` alive while the VMs run; dropping it removes the
/// socket directory.
#[derive(Debug)]
pub struct InterVm {
    // Owns the socket directory; removed when the network is dropped.
    _dir: tempfile::TempDir,
    socket: PathBuf,
    // Ordinal assignment must be safe when VMs are configured from
    // concurrent test tasks.
    num_vms: AtomicU32,
}

impl InterVm {
    /// Create a new inter-VM network.
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("intervm-").tempdir()?;
        let socket = dir.path().join("intervm.socket");
        Ok(Self {
            _dir: dir,
            socket,
            num_vms: AtomicU32::new(0),
        })
    }

    /// The socket path the VMs connect through.
    pub fn socket(&self) -> &std::path::Path {
        &self.socket
    }

    /// A configurator attaching a new VM to this network.
    pub fn new_vm(&self, nic_opts: Vec<NicOpt>) -> Configurator {
        let num = self.num_vms.fetch_add(1, Ordering::SeqCst);
        let socket = self.socket.clone();

        configurator(move |alloc, opts| {
            let dev_id = alloc.id("vm");
            let mut net = NetOptions {
                nic: NIC_E1000.to_string(),
                mac: Mac([0x0e, 0, 0, 0, 0, num as u8]),
            };

            let mut args = Vec::new();
            for opt in nic_opts {
                args.extend(opt.apply(&dev_id, alloc, &mut net));
            }
            args.push("-device".to_string());
            args.push(format!("{},netdev={dev_id},mac={}", net.nic, net.mac));
            args.push("-netdev".to_string());
            let server = num == 0;
            args.push(format!(
                "stream,id={dev_id},server={server},addr.type=unix,addr.path={}",
                socket.display()
            ));

            opts.append_qemu(args);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Host networks
// ---------------------------------------------------------------------------

/// QEMU user-mode networking towards the host over IPv4.
///
/// `cidr` is the guest network, e.g. `"192.168.0.0/24"`. The DHCP range
/// starts at the 8th address of the network.
pub fn ipv4_host_network(cidr: impl Into<String>, nic_opts: Vec<NicOpt>) -> Configurator {
    let cidr = cidr.into();
    configurator(move |alloc, opts| {
        let (addr, prefix) = parse_ipv4_cidr(&cidr)?;
        let network = mask_ipv4(addr, prefix);
        let dhcp_start =
            nth_ipv4(network, prefix, 8).ok_or_else(|| Error::InvalidCidr(cidr.clone()))?;

        let netdev_id = alloc.id("netdev");
        let mut net = NetOptions {
            nic: NIC_E1000.to_string(),
            mac: Mac([0x0e, 0, 0, 0, 0, 1]),
        };

        let mut args = Vec::new();
        for opt in nic_opts {
            args.extend(opt.apply(&netdev_id, alloc, &mut net));
        }
        args.push("-device".to_string());
        args.push(format!("{},netdev={netdev_id},mac={}", net.nic, net.mac));
        args.push("-netdev".to_string());
        args.push(format!(
            "user,id={netdev_id},net={network}/{prefix},dhcpstart={dhcp_start},ipv6=off"
        ));

        opts.append_qemu(args);
        Ok(())
    })
}

/// QEMU user-mode networking towards the host over IPv6.
///
/// `cidr` is the guest network, e.g. `"fec0::/64"`.
pub fn ipv6_host_network(cidr: impl Into<String>, nic_opts: Vec<NicOpt>) -> Configurator {
    let cidr = cidr.into();
    configurator(move |alloc, opts| {
        let (addr, prefix) = parse_ipv6_cidr(&cidr)?;

        let netdev_id = alloc.id("netdev");
        let mut net = NetOptions {
            nic: NIC_E1000.to_string(),
            mac: Mac([0x0e, 0, 0, 0, 0, 1]),
        };

        let mut args = Vec::new();
        for opt in nic_opts {
            args.extend(opt.apply(&netdev_id, alloc, &mut net));
        }
        args.push("-device".to_string());
        args.push(format!("{},netdev={netdev_id},mac={}", net.nic, net.mac));
        args.push("-netdev".to_string());
        args.push(format!(
            "user,id={netdev_id},ipv6-net={addr}/{prefix},ipv4=off"
        ));

        opts.append_qemu(args);
        Ok(())
    })
}

fn parse_ipv4_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), Error> {
    let invalid = || Error::InvalidCidr(cidr.to_string());
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    Ok((addr, prefix))
}

fn parse_ipv6_cidr(cidr: &str) -> Result<(Ipv6Addr, u8), Error> {
    let invalid = || Error::InvalidCidr(cidr.to_string());
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: Ipv6Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 128 {
        return Err(invalid());
    }
    Ok((addr, prefix))
}

fn ipv4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

fn mask_ipv4(addr: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & ipv4_mask(prefix))
}

/// The nth address of the network, or `None` when it falls outside.
fn nth_ipv4(network: Ipv4Addr, prefix: u8, n: u32) -> Option<Ipv4Addr> {
    let base = u32::from(network);
    let ip = base.checked_add(n)?;
    let mask = ipv4_mask(prefix);
    if ip & mask == base & mask {
        Some(Ipv4Addr::from(ip))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// HTTP-serve task
// ---------------------------------------------------------------------------

/// Serve HTTP on the host for the lifetime of the VM.
///
/// Installs two tasks: one running the server on `listener`, and one that
/// shuts the server down once the VM has exited (or once the run is
/// cancelled — so a child that never starts still unblocks the server).
pub fn serve_http(router: axum::Router, listener: std::net::TcpListener) -> Configurator {
    configurator(move |_alloc, opts| {
        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();

        opts.tasks.push(task(move |_cancel, _n| async move {
            listener.set_nonblocking(true)?;
            let listener = tokio::net::TcpListener::from_std(listener)?;
            info!(addr = ?listener.local_addr().ok(), "serving HTTP for the guest");
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = close_rx.await;
                })
                .await
                .map_err(|e| anyhow::anyhow!("HTTP server failed: {e}"))
        }));

        opts.tasks.push(task(move |cancel, mut n| async move {
            tokio::select! {
                _ = n.vm_exited() => {}
                _ = cancel.cancelled() => {}
            }
            let _ = close_tx.send(());
            Ok(())
        }));

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qemu::{options_for, with_qemu_command, Arch};

    #[test]
    fn mac_formats_as_colon_hex() {
        assert_eq!(Mac([0x0e, 0, 0, 0, 0, 0x1f]).to_string(), "0e:00:00:00:00:1f");
    }

    #[test]
    fn nth_ipv4_walks_the_network() {
        let net = "192.168.0.0".parse().unwrap();
        assert_eq!(nth_ipv4(net, 24, 8), Some("192.168.0.8".parse().unwrap()));
        assert_eq!(nth_ipv4(net, 30, 8), None);
    }

    #[test]
    fn ipv4_network_emits_user_netdev_with_dhcpstart() {
        let opts = options_for(
            Arch::X86_64,
            [
                with_qemu_command("qemu"),
                ipv4_host_network("192.168.0.0/24", Vec::new()),
            ],
        )
        .unwrap();
        let cmdline = opts.cmdline().unwrap();
        assert!(cmdline.contains(&"e1000,netdev=netdev0,mac=0e:00:00:00:00:01".to_string()));
        assert!(cmdline.contains(
            &"user,id=netdev0,net=192.168.0.0/24,dhcpstart=192.168.0.8,ipv6=off".to_string()
        ));
    }

    #[test]
    fn ipv4_network_normalizes_host_bits() {
        let opts = options_for(
            Arch::X86_64,
            [
                with_qemu_command("qemu"),
                ipv4_host_network("10.0.0.5/8", Vec::new()),
            ],
        )
        .unwrap();
        let cmdline = opts.cmdline().unwrap();
        assert!(cmdline
            .contains(&"user,id=netdev0,net=10.0.0.0/8,dhcpstart=10.0.0.8,ipv6=off".to_string()));
    }

    #[test]
    fn ipv4_network_rejects_bad_cidr() {
        for bad in ["not-a-cidr", "192.168.0.0", "192.168.0.0/33", "fec0::/64"] {
            let err = options_for(
                Arch::X86_64,
                [ipv4_host_network(bad, Vec::new())],
            )
            .unwrap_err();
            assert!(matches!(err, Error::InvalidCidr(_)), "cidr: {bad}");
        }
    }

    #[test]
    fn ipv6_network_emits_ipv6_net() {
        let opts = options_for(
            Arch::X86_64,
            [
                with_qemu_command("qemu"),
                ipv6_host_network("fec0::/64", Vec::new()),
            ],
        )
        .unwrap();
        let cmdline = opts.cmdline().unwrap();
        assert!(cmdline.contains(&"user,id=netdev0,ipv6-net=fec0::/64,ipv4=off".to_string()));
    }

    #[test]
    fn nic_opts_change_device_and_capture() {
        let opts = options_for(
            Arch::X86_64,
            [
                with_qemu_command("qemu"),
                ipv4_host_network(
                    "192.168.0.0/24",
                    vec![
                        with_nic(NIC_VIRTIO_NET),
                        with_mac(Mac([0x0e, 0, 0, 0, 0, 9])),
                        with_pcap("/tmp/out.pcap"),
                    ],
                ),
            ],
        )
        .unwrap();
        let cmdline = opts.cmdline().unwrap();
        assert!(cmdline.contains(&"virtio-net,netdev=netdev0,mac=0e:00:00:00:00:09".to_string()));
        assert!(cmdline
            .contains(&"filter-dump,id=filter0,netdev=netdev0,file=/tmp/out.pcap".to_string()));
    }

    #[test]
    fn inter_vm_first_listens_later_vms_connect() {
        let net = InterVm::new().unwrap();
        let socket = net.socket().display().to_string();

        let first = options_for(
            Arch::X86_64,
            [with_qemu_command("qemu"), net.new_vm(Vec::new())],
        )
        .unwrap();
        let second = options_for(
            Arch::X86_64,
            [with_qemu_command("qemu"), net.new_vm(Vec::new())],
        )
        .unwrap();

        let first = first.cmdline().unwrap();
        let second = second.cmdline().unwrap();

        assert!(first.contains(&"e1000,netdev=vm0,mac=0e:00:00:00:00:00".to_string()));
        assert!(first.contains(&format!(
            "stream,id=vm0,server=true,addr.type=unix,addr.path={socket}"
        )));
        assert!(second.contains(&"e1000,netdev=vm0,mac=0e:00:00:00:00:01".to_string()));
        assert!(second.contains(&format!(
            "stream,id=vm0,server=false,addr.type=unix,addr.path={socket}"
        )));
    }
}
